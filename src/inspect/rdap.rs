use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::InspectError;

pub const DEFAULT_RDAP_BASE: &str = "https://rdap.org/domain/";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RdapDomain {
    #[serde(default)]
    events: Vec<RdapEvent>,
    not_after: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RdapEvent {
    #[serde(default)]
    event_action: String,
    event_date: Option<String>,
}

/// RDAP domain lookups through a bootstrap proxy such as rdap.org.
#[derive(Debug, Clone)]
pub struct RdapClient {
    http: Client,
    base_url: String,
}

impl RdapClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InspectError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("uptrail/", env!("CARGO_PKG_VERSION"), " (RDAP)"))
            .build()
            .map_err(|e| InspectError::Rdap(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
        })
    }

    /// Registration expiry for a domain root. `Ok(None)` when the registry
    /// answered but published no expiry.
    #[instrument(skip(self))]
    pub async fn fetch_expiry(&self, domain: &str) -> Result<Option<DateTime<Utc>>, InspectError> {
        let url = format!("{}{}", self.base_url, domain);
        debug!("RDAP query: {}", url);

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/rdap+json, application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InspectError::Timeout(format!("RDAP query for {}", domain))
                } else {
                    InspectError::Rdap(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(InspectError::Rdap(format!(
                "{} returned HTTP {}",
                url,
                response.status().as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| InspectError::Rdap(e.to_string()))?;

        parse_rdap_expiry(&body)
    }
}

/// First event whose action mentions expiry, else the top-level `notAfter`.
fn parse_rdap_expiry(body: &str) -> Result<Option<DateTime<Utc>>, InspectError> {
    let domain: RdapDomain =
        serde_json::from_str(body).map_err(|e| InspectError::Rdap(format!("bad JSON: {}", e)))?;

    let from_event = domain
        .events
        .iter()
        .filter(|e| {
            let action = e.event_action.to_ascii_lowercase();
            action.contains("expire") || action.contains("expiration")
        })
        .find_map(|e| e.event_date.as_deref().and_then(parse_rfc3339));

    Ok(from_event.or_else(|| domain.not_after.as_deref().and_then(parse_rfc3339)))
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_expiration_event() {
        let body = r#"{
            "objectClassName": "domain",
            "ldhName": "EXAMPLE.COM",
            "events": [
                {"eventAction": "registration", "eventDate": "1995-08-14T04:00:00Z"},
                {"eventAction": "expiration", "eventDate": "2026-08-13T04:00:00Z"},
                {"eventAction": "last update of RDAP database", "eventDate": "2024-01-01T00:00:00Z"}
            ]
        }"#;
        assert_eq!(
            parse_rdap_expiry(body).unwrap(),
            Some(Utc.with_ymd_and_hms(2026, 8, 13, 4, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_not_after_fallback() {
        let body = r#"{"events":[{"eventAction":"expiration"}],"notAfter":"2030-02-01T00:00:00Z"}"#;
        assert_eq!(
            parse_rdap_expiry(body).unwrap(),
            Some(Utc.with_ymd_and_hms(2030, 2, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_no_expiry() {
        assert_eq!(parse_rdap_expiry(r#"{"events":[]}"#).unwrap(), None);
        assert_eq!(parse_rdap_expiry("{}").unwrap(), None);
        tokio_test::assert_err!(parse_rdap_expiry("<html>"));
    }

    #[tokio::test]
    async fn test_fetch_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domain/example.org"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"events":[{"eventAction":"expiration","eventDate":"2028-07-30T12:00:00Z"}]}"#,
            ))
            .mount(&server)
            .await;

        let client =
            RdapClient::new(&format!("{}/domain/", server.uri()), Duration::from_secs(5)).unwrap();
        let expiry = client.fetch_expiry("example.org").await.unwrap();
        assert_eq!(expiry, Some(Utc.with_ymd_and_hms(2028, 7, 30, 12, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_fetch_expiry_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client =
            RdapClient::new(&format!("{}/domain/", server.uri()), Duration::from_secs(5)).unwrap();
        let err = client.fetch_expiry("missing.test").await.unwrap_err();
        assert!(matches!(err, InspectError::Rdap(_)));
    }
}

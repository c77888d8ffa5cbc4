//! HTTP probe implementation.

use std::error::Error as StdError;
use std::time::{Duration, Instant};

use super::tcp::io_error_code;
use super::{ProbeError, ProbeOutcome};

const MAX_REDIRECTS: usize = 10;
const USER_AGENT: &str = concat!("uptrail/", env!("CARGO_PKG_VERSION"), " (monitor)");

/// What a response must satisfy to count as UP.
#[derive(Debug, Clone)]
pub struct HttpAssertion<'a> {
    pub expected_status: u16,
    /// Empty means no body assertion.
    pub body_must_contain: &'a str,
}

/// Run an HTTP GET probe against the given URL.
///
/// Any status code is a valid response; the assertion decides UP or DOWN.
/// Transport failures come back as `Err` and are turned into a DOWN outcome
/// by the caller.
pub async fn run_http_probe(
    url: &str,
    assertion: &HttpAssertion<'_>,
    timeout: Duration,
) -> Result<ProbeOutcome, ProbeError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let start = Instant::now();

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify_error(e, timeout))?;

    let status = response.status().as_u16();
    if status != assertion.expected_status {
        return Ok(ProbeOutcome::down(format!(
            "HTTP {} (expected {})",
            status, assertion.expected_status
        )));
    }

    // Read the full body to measure complete transfer time
    let body = response
        .text()
        .await
        .map_err(|e| classify_error(e, timeout))?;

    if !assertion.body_must_contain.is_empty() && !body.contains(assertion.body_must_contain) {
        return Ok(ProbeOutcome::down(format!(
            "Keyword \"{}\" not found",
            assertion.body_must_contain
        )));
    }

    Ok(ProbeOutcome::up(start.elapsed().as_millis() as u64))
}

fn classify_error(err: reqwest::Error, timeout: Duration) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::HttpTimeout(timeout);
    }
    if err.is_redirect() {
        return ProbeError::Network("TOO_MANY_REDIRECTS".to_string());
    }

    // Prefer the OS-level code buried in the source chain
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<std::io::Error>() {
            return ProbeError::Network(io_error_code(io_err));
        }
        source = inner.source();
    }

    if err.is_connect() {
        ProbeError::Network("CONNECT_ERROR".to_string())
    } else {
        ProbeError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn expect(status: u16, needle: &str) -> HttpAssertion<'_> {
        HttpAssertion {
            expected_status: status,
            body_must_contain: needle,
        }
    }

    #[tokio::test]
    async fn test_http_probe_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let outcome = run_http_probe(&server.uri(), &expect(200, ""), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.up);
        assert!(outcome.reason.is_none());
        assert!(outcome.response_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_http_probe_status_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let outcome = run_http_probe(&server.uri(), &expect(200, ""), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!outcome.up);
        assert_eq!(outcome.reason.as_deref(), Some("HTTP 503 (expected 200)"));
        assert!(outcome.response_time_ms.is_none());
    }

    #[tokio::test]
    async fn test_http_probe_non_2xx_expected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let outcome = run_http_probe(&server.uri(), &expect(403, ""), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.up);
    }

    #[tokio::test]
    async fn test_http_probe_keyword_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("maintenance page"))
            .mount(&server)
            .await;

        let outcome = run_http_probe(
            &server.uri(),
            &expect(200, "Welcome"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!outcome.up);
        assert_eq!(outcome.reason.as_deref(), Some("Keyword \"Welcome\" not found"));

        let outcome = run_http_probe(
            &server.uri(),
            &expect(200, "maintenance"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(outcome.up);
    }

    #[tokio::test]
    async fn test_http_probe_follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("Location", format!("{}/new", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let url = format!("{}/old", server.uri());
        let outcome = run_http_probe(&url, &expect(200, ""), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.up);
    }

    #[tokio::test]
    async fn test_http_probe_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = run_http_probe(&server.uri(), &expect(200, ""), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "HTTP_TIMEOUT");
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let result = run_http_probe(
            "http://256.256.256.256",
            &expect(200, ""),
            Duration::from_millis(100),
        )
        .await;
        assert!(result.is_err());
    }
}

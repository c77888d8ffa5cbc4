//! Asset inspectors: TLS certificate expiry and domain registration expiry.
//!
//! Domain expiry resolution order: registrable root, known hosting provider
//! roots, rate-limited and cached WHOIS, then RDAP.

mod rdap;
mod tls;
mod whois;

pub use rdap::*;
pub use tls::*;
pub use whois::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::db::DomainSource;

/// Roots managed by hosting providers; WHOIS tells nothing about the tenant.
pub const PROVIDER_ROOTS: [&str; 10] = [
    "vercel.app",
    "netlify.app",
    "github.io",
    "surge.sh",
    "render.com",
    "herokuapp.com",
    "cloudfront.net",
    "pages.dev",
    "firebaseapp.com",
    "web.app",
];

/// Inspector error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InspectError {
    #[error("{0} timed out")]
    Timeout(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("WHOIS error: {0}")]
    Whois(String),
    #[error("RDAP error: {0}")]
    Rdap(String),
}

/// Result of a domain expiry resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainExpiry {
    pub root: Option<String>,
    pub source: DomainSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_left: Option<i64>,
}

impl DomainExpiry {
    fn without_date(root: Option<String>, source: DomainSource) -> Self {
        Self {
            root,
            source,
            expires_at: None,
            days_left: None,
        }
    }
}

/// Asset lookups used by the daily sweep.
#[async_trait]
pub trait AssetInspector: Send + Sync {
    /// Leaf certificate "not after" for `host:443`. `Ok(None)` if the peer sent none.
    async fn certificate_expiry(&self, host: &str) -> Result<Option<DateTime<Utc>>, InspectError>;

    /// Never fails; problems surface as [`DomainSource::Error`].
    async fn domain_expiry(&self, host: &str) -> DomainExpiry;
}

/// Inspector that talks to TLS endpoints, WHOIS servers and RDAP.
pub struct NetworkInspector {
    whois: WhoisGateway,
    rdap: RdapClient,
    tls_timeout: Duration,
}

impl NetworkInspector {
    pub fn new(whois: WhoisGateway, rdap: RdapClient, tls_timeout: Duration) -> Self {
        Self {
            whois,
            rdap,
            tls_timeout,
        }
    }

    pub fn whois(&self) -> &WhoisGateway {
        &self.whois
    }
}

#[async_trait]
impl AssetInspector for NetworkInspector {
    async fn certificate_expiry(&self, host: &str) -> Result<Option<DateTime<Utc>>, InspectError> {
        fetch_certificate_expiry(host, HTTPS_PORT, self.tls_timeout).await
    }

    #[instrument(skip(self))]
    async fn domain_expiry(&self, host: &str) -> DomainExpiry {
        let Some(root) = domain_root(host) else {
            return DomainExpiry::without_date(None, DomainSource::None);
        };

        if is_provider_root(&root) {
            return DomainExpiry::without_date(Some(root), DomainSource::Provider);
        }

        match self.whois.lookup(&root).await {
            Ok(record) => {
                if let Some(expiry) = record.expiry {
                    return DomainExpiry {
                        days_left: days_left(Some(expiry), Utc::now()),
                        expires_at: Some(expiry),
                        root: Some(root),
                        source: DomainSource::Whois,
                    };
                }
                debug!("WHOIS for {} had no parseable expiry", root);
            }
            Err(e) => debug!("WHOIS for {} failed: {}", root, e),
        }

        match self.rdap.fetch_expiry(&root).await {
            Ok(Some(expiry)) => {
                return DomainExpiry {
                    days_left: days_left(Some(expiry), Utc::now()),
                    expires_at: Some(expiry),
                    root: Some(root),
                    source: DomainSource::Rdap,
                };
            }
            Ok(None) => debug!("RDAP for {} had no expiry event", root),
            Err(e) => debug!("RDAP for {} failed: {}", root, e),
        }

        DomainExpiry::without_date(Some(root), DomainSource::Error)
    }
}

/// Hostname of an absolute URL, without IPv6 brackets.
pub fn hostname_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then(|| host.to_string())
}

/// Registrable domain (eTLD+1) of a hostname, ignoring private suffix rules.
/// Bare IPs have no root.
pub fn domain_root(hostname: &str) -> Option<String> {
    let host = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.parse::<IpAddr>().is_ok() {
        return None;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return None;
    }

    // Longest public (non-private) suffix; the root is one label in front of it
    let mut suffix_labels = 0;
    for k in 1..=labels.len() {
        let candidate = labels[labels.len() - k..].join(".");
        if let Some(suffix) = psl::suffix(candidate.as_bytes()) {
            if suffix.as_bytes() == candidate.as_bytes() && suffix.typ() != Some(psl::Type::Private)
            {
                suffix_labels = k;
            }
        }
    }

    if suffix_labels == 0 || suffix_labels == labels.len() {
        return None;
    }
    Some(labels[labels.len() - suffix_labels - 1..].join("."))
}

pub fn is_provider_root(root: &str) -> bool {
    PROVIDER_ROOTS.contains(&root)
}

/// Whole days until `expiry`, rounded, never negative.
pub fn days_left(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    let expiry = expiry?;
    let diff_ms = (expiry - now).num_milliseconds() as f64;
    Some(((diff_ms / 86_400_000.0).round() as i64).max(0))
}

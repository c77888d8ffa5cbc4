//! Database model types.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::StorageError;

/// Default probe timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

pub const DEFAULT_CHECK_PAGE: usize = 100;
pub const MAX_CHECK_PAGE: usize = 500;
pub const DEFAULT_INCIDENT_LIMIT: usize = 200;
pub const MAX_INCIDENT_LIMIT: usize = 1000;

/// How a target is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetKind {
    Http,
    Tcp,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Http => "HTTP",
            TargetKind::Tcp => "TCP",
        }
    }
}

impl FromStr for TargetKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Ok(TargetKind::Http),
            "TCP" => Ok(TargetKind::Tcp),
            other => Err(StorageError::InvalidTarget(format!("unknown check type: {}", other))),
        }
    }
}

/// Current status of a target. `Pending` only until the first probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetStatus {
    Up,
    Down,
    Pending,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Up => "UP",
            TargetStatus::Down => "DOWN",
            TargetStatus::Pending => "PENDING",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(TargetStatus::Up),
            "DOWN" => Ok(TargetStatus::Down),
            "PENDING" => Ok(TargetStatus::Pending),
            other => Err(StorageError::Corrupt(format!("unknown status: {}", other))),
        }
    }
}

/// Where a domain expiry date came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainSource {
    Whois,
    Rdap,
    /// Root belongs to a hosting provider; WHOIS is not meaningful.
    Provider,
    Error,
    /// No registrable root (bare IP).
    None,
    Other,
}

impl DomainSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainSource::Whois => "whois",
            DomainSource::Rdap => "rdap",
            DomainSource::Provider => "provider",
            DomainSource::Error => "error",
            DomainSource::None => "none",
            DomainSource::Other => "other",
        }
    }

    /// Normalize a stored source string; unknown values collapse to `Other`.
    pub fn normalize(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "whois" => DomainSource::Whois,
            "rdap" => DomainSource::Rdap,
            "provider" => DomainSource::Provider,
            "error" => DomainSource::Error,
            "none" => DomainSource::None,
            _ => DomainSource::Other,
        }
    }
}

impl fmt::Display for DomainSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitored endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: i64,
    pub kind: TargetKind,
    pub url: Option<String>,
    pub tcp_host: Option<String>,
    pub tcp_port: Option<u16>,
    pub expected_status: u16,
    /// Empty means no body assertion.
    pub body_must_contain: String,
    pub timeout_ms: u64,

    pub status: TargetStatus,
    pub response_time_ms: Option<u64>,
    pub last_checked: Option<DateTime<Utc>>,

    pub ssl_valid_to: Option<DateTime<Utc>>,
    pub ssl_days_left: Option<i64>,
    pub ssl_checked_at: Option<DateTime<Utc>>,

    pub domain_expires_at: Option<DateTime<Utc>>,
    pub domain_days_left: Option<i64>,
    pub domain_root: Option<String>,
    pub domain_source: Option<DomainSource>,
    pub domain_checked_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Target {
    /// Build a freshly registered target from a validated request.
    pub fn from_new(id: i64, new: NewTarget, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: new.kind,
            url: new.url,
            tcp_host: new.tcp_host,
            tcp_port: new.tcp_port,
            expected_status: new.expected_status,
            body_must_contain: new.body_must_contain,
            timeout_ms: new.timeout_ms,
            status: TargetStatus::Pending,
            response_time_ms: None,
            last_checked: None,
            ssl_valid_to: None,
            ssl_days_left: None,
            ssl_checked_at: None,
            domain_expires_at: None,
            domain_days_left: None,
            domain_root: None,
            domain_source: None,
            domain_checked_at: None,
            created_at,
        }
    }

    pub fn apply_probe(&mut self, update: &ProbeUpdate) {
        self.status = update.status;
        self.response_time_ms = update.response_time_ms;
        self.last_checked = Some(update.last_checked);
    }

    pub fn apply_ssl(&mut self, update: &SslUpdate) {
        self.ssl_valid_to = update.valid_to;
        self.ssl_days_left = update.days_left;
        self.ssl_checked_at = Some(update.checked_at);
    }

    pub fn apply_domain(&mut self, update: &DomainUpdate) {
        self.domain_root = update.root.clone();
        self.domain_source = Some(update.source);
        self.domain_expires_at = update.expires_at;
        self.domain_days_left = update.days_left;
        self.domain_checked_at = Some(update.checked_at);
    }

    /// Short human label used in logs.
    pub fn label(&self) -> String {
        match self.kind {
            TargetKind::Http => self.url.clone().unwrap_or_default(),
            TargetKind::Tcp => format!(
                "{}:{}",
                self.tcp_host.as_deref().unwrap_or(""),
                self.tcp_port.map(|p| p.to_string()).unwrap_or_default()
            ),
        }
    }
}

/// Registration request for a target.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTarget {
    pub kind: TargetKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tcp_host: Option<String>,
    #[serde(default)]
    pub tcp_port: Option<u16>,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default)]
    pub body_must_contain: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_expected_status() -> u16 {
    200
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl NewTarget {
    pub fn http(url: &str) -> Self {
        Self {
            kind: TargetKind::Http,
            url: Some(url.to_string()),
            tcp_host: None,
            tcp_port: None,
            expected_status: default_expected_status(),
            body_must_contain: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn tcp(host: &str, port: u16) -> Self {
        Self {
            kind: TargetKind::Tcp,
            url: None,
            tcp_host: Some(host.to_string()),
            tcp_port: Some(port),
            expected_status: default_expected_status(),
            body_must_contain: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Check the per-kind required fields and normalize the URL.
    pub fn validate(mut self) -> Result<Self, StorageError> {
        if self.timeout_ms == 0 {
            self.timeout_ms = DEFAULT_TIMEOUT_MS;
        }

        match self.kind {
            TargetKind::Http => {
                let url = self
                    .url
                    .as_deref()
                    .map(normalize_url)
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        StorageError::InvalidTarget("HTTP targets require a url".to_string())
                    })?;
                self.url = Some(url);
            }
            TargetKind::Tcp => {
                let host = self.tcp_host.as_deref().map(str::trim).unwrap_or("");
                if host.is_empty() || self.tcp_port.is_none() {
                    return Err(StorageError::InvalidTarget(
                        "TCP targets require host and port".to_string(),
                    ));
                }
                self.tcp_host = Some(host.to_string());
            }
        }

        Ok(self)
    }
}

/// Trim whitespace and trailing slashes. Parseable URLs are rebuilt with a
/// lowercase scheme and host; credentials and default ports are dropped.
pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    let Ok(url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    let Some(host) = url.host_str() else {
        return trimmed.to_string();
    };

    let mut out = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        out.push_str(&format!(":{}", port));
    }
    out.push_str(url.path());
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    out.trim_end_matches('/').to_string()
}

/// Fields written after every probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeUpdate {
    pub status: TargetStatus,
    pub response_time_ms: Option<u64>,
    pub last_checked: DateTime<Utc>,
}

/// Fields written by the TLS certificate inspector.
#[derive(Debug, Clone, PartialEq)]
pub struct SslUpdate {
    pub valid_to: Option<DateTime<Utc>>,
    pub days_left: Option<i64>,
    pub checked_at: DateTime<Utc>,
}

/// Fields written by the domain expiry resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainUpdate {
    pub root: Option<String>,
    pub source: DomainSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_left: Option<i64>,
    pub checked_at: DateTime<Utc>,
}

/// An immutable probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub id: i64,
    pub target_id: i64,
    pub status: TargetStatus,
    pub response_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCheck {
    pub target_id: i64,
    pub status: TargetStatus,
    pub response_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentStatus {
    Ongoing,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Ongoing => "ONGOING",
            IncidentStatus::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONGOING" => Ok(IncidentStatus::Ongoing),
            "RESOLVED" => Ok(IncidentStatus::Resolved),
            other => Err(StorageError::Corrupt(format!("unknown incident status: {}", other))),
        }
    }
}

impl IncidentStatus {
    /// Parse a user-supplied filter ("ongoing", "Resolved", ...). Unknown
    /// values mean no filter.
    pub fn from_filter(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ongoing" => Some(IncidentStatus::Ongoing),
            "resolved" => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }
}

/// A contiguous DOWN period of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: i64,
    pub target_id: i64,
    pub status: IncidentStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIncident {
    pub target_id: i64,
    pub start_time: DateTime<Utc>,
    pub reason: String,
}

/// Incident listing filter. The default lists every target, any status,
/// up to [`DEFAULT_INCIDENT_LIMIT`] rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentQuery {
    pub target_id: Option<i64>,
    pub status: Option<IncidentStatus>,
    pub limit: Option<usize>,
}

impl IncidentQuery {
    pub fn for_target(target_id: i64) -> Self {
        Self {
            target_id: Some(target_id),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: IncidentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, incident: &Incident) -> bool {
        self.target_id.map_or(true, |id| incident.target_id == id)
            && self.status.map_or(true, |s| incident.status == s)
    }

    /// Requested limit clamped to `1..=MAX_INCIDENT_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_INCIDENT_LIMIT)
            .clamp(1, MAX_INCIDENT_LIMIT)
    }
}

/// Clamp a check page size to `1..=MAX_CHECK_PAGE`.
pub fn clamp_check_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_CHECK_PAGE)
}

/// One page of a target's check history, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckPage {
    pub items: Vec<Check>,
    /// Pass as `before` to fetch the next page.
    pub next_cursor: Option<DateTime<Utc>>,
    pub has_more: bool,
}

impl CheckPage {
    /// Build a page from a newest-first query that fetched `limit + 1` rows.
    pub fn from_overfetch(mut items: Vec<Check>, limit: usize) -> Self {
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items.last().map(|c| c.created_at)
        } else {
            None
        };
        Self {
            items,
            next_cursor,
            has_more,
        }
    }
}

/// Rows removed by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub checks: u64,
    pub incidents: u64,
}

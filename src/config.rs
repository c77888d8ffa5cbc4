//! Configuration module for uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::inspect::DEFAULT_RDAP_BASE;

/// Monitor configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Probe sweep schedule, 5- or 6-field cron (default: every 10 minutes)
    pub cron_schedule: String,
    /// TLS/domain sweep schedule (default: daily at 03:00)
    pub asset_cron_schedule: String,
    /// Max random delay before each run (default: 0, disabled)
    pub jitter: Duration,
    /// How long shutdown waits for an in-progress run (default: 30s)
    pub shutdown_timeout: Duration,
    pub whois_rate_limit: Duration,
    pub whois_cache_ttl: Duration,
    pub whois_timeout: Duration,
    pub tls_timeout: Duration,
    pub rdap_timeout: Duration,
    pub rdap_base_url: String,
    /// Checks and incidents older than this are purged (default: 30)
    pub retention_days: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            db_path: "uptrail.db".to_string(),
            cron_schedule: "*/10 * * * *".to_string(),
            asset_cron_schedule: "0 3 * * *".to_string(),
            jitter: Duration::ZERO,
            shutdown_timeout: Duration::from_millis(30_000),
            whois_rate_limit: Duration::from_millis(2_500),
            whois_cache_ttl: Duration::from_millis(12 * 60 * 60 * 1000),
            whois_timeout: Duration::from_millis(8_000),
            tls_timeout: Duration::from_millis(8_000),
            rdap_timeout: Duration::from_millis(7_000),
            rdap_base_url: DEFAULT_RDAP_BASE.to_string(),
            retention_days: 30,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `CRON_SCHEDULE`, `ASSET_CRON_SCHEDULE`: cron expressions
    /// - `CRON_JITTER_MS`, `SHUTDOWN_TIMEOUT_MS`
    /// - `WHOIS_RATE_LIMIT_MS`, `WHOIS_CACHE_TTL_MS`, `WHOIS_TIMEOUT_MS`
    /// - `TLS_TIMEOUT_MS`, `RDAP_TIMEOUT_MS`, `RDAP_BASE_URL`
    /// - `RETENTION_DAYS`
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup. Unparseable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let millis = |key: &str, default: Duration| {
            parse_or(key, text(key), default.as_millis() as u64).map_or(default, Duration::from_millis)
        };

        if let Some(path) = text("UPTRAIL_DB_PATH") {
            cfg.db_path = path;
        }
        if let Some(expr) = text("CRON_SCHEDULE") {
            cfg.cron_schedule = expr;
        }
        if let Some(expr) = text("ASSET_CRON_SCHEDULE") {
            cfg.asset_cron_schedule = expr;
        }
        if let Some(url) = text("RDAP_BASE_URL") {
            cfg.rdap_base_url = url;
        }

        cfg.jitter = millis("CRON_JITTER_MS", cfg.jitter);
        cfg.shutdown_timeout = millis("SHUTDOWN_TIMEOUT_MS", cfg.shutdown_timeout);
        cfg.whois_rate_limit = millis("WHOIS_RATE_LIMIT_MS", cfg.whois_rate_limit);
        cfg.whois_cache_ttl = millis("WHOIS_CACHE_TTL_MS", cfg.whois_cache_ttl);
        cfg.whois_timeout = millis("WHOIS_TIMEOUT_MS", cfg.whois_timeout);
        cfg.tls_timeout = millis("TLS_TIMEOUT_MS", cfg.tls_timeout);
        cfg.rdap_timeout = millis("RDAP_TIMEOUT_MS", cfg.rdap_timeout);
        if let Some(days) = parse_or("RETENTION_DAYS", text("RETENTION_DAYS"), cfg.retention_days) {
            cfg.retention_days = days;
        }

        cfg
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, raw: Option<String>, default: T) -> Option<T> {
    let raw = raw?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}, keeping default", key, raw);
            Some(default)
        }
    }
}

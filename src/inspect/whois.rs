//! WHOIS lookups with a TTL cache, a global minimum gap between network
//! queries, and single-flight de-duplication per domain root.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use super::InspectError;

pub const IANA_WHOIS_SERVER: &str = "whois.iana.org";
const WHOIS_PORT: u16 = 43;
const MAX_RESPONSE_SIZE: usize = 1024 * 1024; // 1MB

/// Sends one query line to a WHOIS server and returns the raw reply.
#[async_trait]
pub trait WhoisTransport: Send + Sync {
    async fn query(&self, server: &str, query: &str) -> Result<String, InspectError>;
}

/// Plain TCP port-43 transport.
#[derive(Debug, Clone)]
pub struct TcpWhoisTransport {
    timeout: Duration,
}

impl TcpWhoisTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl WhoisTransport for TcpWhoisTransport {
    async fn query(&self, server: &str, query: &str) -> Result<String, InspectError> {
        let mut stream = timeout(self.timeout, TcpStream::connect((server, WHOIS_PORT)))
            .await
            .map_err(|_| InspectError::Timeout(format!("WHOIS connect to {}", server)))?
            .map_err(|e| InspectError::Whois(format!("Failed to connect to {}: {}", server, e)))?;

        timeout(self.timeout, stream.write_all(format!("{}\r\n", query).as_bytes()))
            .await
            .map_err(|_| InspectError::Timeout(format!("WHOIS write to {}", server)))?
            .map_err(|e| InspectError::Whois(format!("Failed to send query: {}", e)))?;

        let mut response = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match timeout(self.timeout, stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    response.extend_from_slice(&buf[..n]);
                    if response.len() > MAX_RESPONSE_SIZE {
                        return Err(InspectError::Whois("Response too large".to_string()));
                    }
                }
                Ok(Err(e)) => return Err(InspectError::Whois(format!("Read error: {}", e))),
                // Keep what we have if the server just stops talking
                Err(_) if !response.is_empty() => break,
                Err(_) => return Err(InspectError::Timeout(format!("WHOIS read from {}", server))),
            }
        }

        // Try UTF-8, fall back to Latin-1
        Ok(String::from_utf8(response)
            .unwrap_or_else(|e| e.into_bytes().iter().map(|&c| c as char).collect()))
    }
}

/// Parsed WHOIS answer for a domain root.
#[derive(Debug, Clone, PartialEq)]
pub struct WhoisRecord {
    /// Referral server that produced `text`, if IANA named one.
    pub server: Option<String>,
    pub text: String,
    pub expiry: Option<DateTime<Utc>>,
}

type LookupFuture = Shared<BoxFuture<'static, Result<WhoisRecord, InspectError>>>;

struct CacheEntry {
    record: WhoisRecord,
    expires_at: Instant,
}

struct GatewayInner {
    transport: Arc<dyn WhoisTransport>,
    rate_limit: Duration,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, LookupFuture>>,
    last_query: tokio::sync::Mutex<Option<Instant>>,
}

/// Shared WHOIS front door. Clones share cache, rate limiter and in-flight map.
#[derive(Clone)]
pub struct WhoisGateway {
    inner: Arc<GatewayInner>,
}

impl WhoisGateway {
    pub fn new(transport: Arc<dyn WhoisTransport>, rate_limit: Duration, cache_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                transport,
                rate_limit,
                cache_ttl,
                cache: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                last_query: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Look up a domain root, serving from cache or joining an in-flight query
    /// for the same root when possible.
    pub async fn lookup(&self, domain_root: &str) -> Result<WhoisRecord, InspectError> {
        let key = domain_root.trim().to_ascii_lowercase();

        let pending = {
            let mut inflight = lock(&self.inner.inflight);
            // Checked under the in-flight lock so a just-finished query is seen
            if let Some(hit) = self.inner.cached(&key) {
                debug!("WHOIS cache hit for {}", key);
                return Ok(hit);
            }
            match inflight.get(&key) {
                Some(existing) => {
                    debug!("Joining in-flight WHOIS lookup for {}", key);
                    existing.clone()
                }
                None => {
                    let fut = run_lookup(self.inner.clone(), key.clone()).boxed().shared();
                    inflight.insert(key, fut.clone());
                    fut
                }
            }
        };

        pending.await
    }

    pub fn cache_len(&self) -> usize {
        lock(&self.inner.cache).len()
    }

    pub fn clear_cache(&self) {
        lock(&self.inner.cache).clear();
    }
}

impl GatewayInner {
    fn cached(&self, key: &str) -> Option<WhoisRecord> {
        let cache = lock(&self.cache);
        cache
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.record.clone())
    }

    /// Wait until the global minimum gap since the previous query has passed.
    async fn wait_for_slot(&self) {
        let mut last = self.last_query.lock().await;
        if let Some(prev) = *last {
            let ready = prev + self.rate_limit;
            if ready > Instant::now() {
                debug!(
                    "WHOIS rate limit: waiting {}ms",
                    (ready - Instant::now()).as_millis()
                );
                tokio::time::sleep_until(ready).await;
            }
        }
        *last = Some(Instant::now());
    }
}

async fn run_lookup(inner: Arc<GatewayInner>, key: String) -> Result<WhoisRecord, InspectError> {
    inner.wait_for_slot().await;

    let result = whois_raw(inner.transport.as_ref(), &key)
        .await
        .map(|(server, text)| WhoisRecord {
            expiry: parse_whois_expiry(&text),
            server,
            text,
        });

    match &result {
        Ok(record) => {
            lock(&inner.cache).insert(
                key.clone(),
                CacheEntry {
                    record: record.clone(),
                    expires_at: Instant::now() + inner.cache_ttl,
                },
            );
        }
        Err(e) => warn!("WHOIS lookup for {} failed: {}", key, e),
    }

    lock(&inner.inflight).remove(&key);
    result
}

/// Two-hop WHOIS: ask IANA for the authoritative server, then ask that server.
///
/// Without a referral, or when the second hop fails, the IANA text is returned.
pub async fn whois_raw(
    transport: &dyn WhoisTransport,
    domain: &str,
) -> Result<(Option<String>, String), InspectError> {
    let iana = transport.query(IANA_WHOIS_SERVER, domain).await?;

    let Some(server) = extract_referral(&iana) else {
        return Ok((None, iana));
    };

    debug!("Following WHOIS referral for {} to {}", domain, server);
    match transport.query(&server, domain).await {
        Ok(text) if !text.trim().is_empty() => Ok((Some(server), text)),
        Ok(_) => Ok((Some(server), iana)),
        Err(e) => {
            debug!("WHOIS referral {} failed: {}", server, e);
            Ok((Some(server), iana))
        }
    }
}

/// Referral server from an IANA reply (`whois: <server>` line).
pub fn extract_referral(text: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?im)^\s*whois:[ \t]*(\S+)").unwrap());

    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
}

/// Expiry date from free-form WHOIS text. Labels are tried in order and the
/// first one with a parseable date wins.
pub fn parse_whois_expiry(text: &str) -> Option<DateTime<Utc>> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"(?i)Registry Expiry Date:[ \t]*([0-9T:\-\.Z ]+)",
            r"(?i)Registrar Registration Expiration Date:[ \t]*([0-9T:\-\.Z ]+)",
            r"(?i)Expiration Date:[ \t]*([0-9T:\-\.Z ]+)",
            r"(?i)Expiry Date:[ \t]*([0-9T:\-\.Z ]+)",
            r"(?i)Expiration Time:[ \t]*([0-9T:\-\.Z ]+)",
            r"(?i)renewal date:[ \t]*([0-9T:\-\.Z ]+)",
            r"(?i)paid-till:[ \t]*([0-9\.\-: TZ]+)",
            r"(?i)expires:[ \t]*([0-9\.\-: TZ]+)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });

    patterns.iter().find_map(|re| {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| parse_loose_date(m.as_str().trim()))
    })
}

/// Parse the date shapes registries actually print.
fn parse_loose_date(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let datetime_formats = [
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y.%m.%d %H:%M:%S",
        "%Y-%m-%dT%H:%MZ",
    ];
    for fmt in &datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }

    let date_formats = ["%Y-%m-%d", "%Y.%m.%d"];
    for fmt in &date_formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }

    None
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

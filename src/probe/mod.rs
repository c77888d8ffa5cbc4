//! Probe module for uptime monitoring.
//!
//! Supports HTTP (status + body assertion) and TCP (connect timing) probes.
//! Every probe produces a [`ProbeOutcome`]; failures never escape as errors.

mod http;
mod tcp;

pub use http::*;
pub use tcp::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::db::{Target, TargetKind};

/// Probe error types. The display form is the reason recorded on a DOWN outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("HTTP_TIMEOUT")]
    HttpTimeout(Duration),
    #[error("TCP_TIMEOUT")]
    TcpTimeout(Duration),
    #[error("TCP_CONFIG_MISSING")]
    TcpConfigMissing,
    #[error("{0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Normalized result of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub up: bool,
    /// Only present when the probe passed.
    pub response_time_ms: Option<u64>,
    pub reason: Option<String>,
}

impl ProbeOutcome {
    pub fn up(response_time_ms: u64) -> Self {
        Self {
            up: true,
            response_time_ms: Some(response_time_ms),
            reason: None,
        }
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Self {
            up: false,
            response_time_ms: None,
            reason: Some(reason.into()),
        }
    }
}

impl From<ProbeError> for ProbeOutcome {
    fn from(err: ProbeError) -> Self {
        ProbeOutcome::down(err.to_string())
    }
}

/// Anything that can probe a target.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &Target) -> ProbeOutcome;
}

/// Prober that talks to the network.
#[derive(Debug, Clone, Default)]
pub struct NetworkProber;

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, target: &Target) -> ProbeOutcome {
        run_probe(target).await
    }
}

/// Run the probe matching the target's kind.
pub async fn run_probe(target: &Target) -> ProbeOutcome {
    let timeout = Duration::from_millis(target.timeout_ms.max(1));

    let result = match target.kind {
        TargetKind::Http => match target.url.as_deref() {
            Some(url) => {
                let assertion = HttpAssertion {
                    expected_status: target.expected_status,
                    body_must_contain: &target.body_must_contain,
                };
                run_http_probe(url, &assertion, timeout).await
            }
            None => Err(ProbeError::Config("HTTP target without url".to_string())),
        },
        TargetKind::Tcp => match (target.tcp_host.as_deref(), target.tcp_port) {
            (Some(host), Some(port)) if !host.is_empty() => {
                run_tcp_probe(host, port, timeout).await.map(ProbeOutcome::up)
            }
            _ => Err(ProbeError::TcpConfigMissing),
        },
    };

    result.unwrap_or_else(ProbeOutcome::from)
}

//! uptrail - website uptime, TLS certificate and domain expiry monitoring.
//!
//! The [`monitor::Monitor`] runs HTTP/TCP probes, keeps target state and
//! incidents in a [`db::MonitorStore`], and publishes events through an
//! [`monitor::EventSink`]. The [`scheduler::Worker`] drives it on cron
//! schedules.

pub mod analytics;
pub mod config;
pub mod db;
pub mod inspect;
pub mod monitor;
pub mod probe;
pub mod scheduler;

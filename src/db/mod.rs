//! Storage layer for uptrail.
//!
//! The monitor only talks to [`MonitorStore`]. Two adapters ship with the
//! crate: SQLite with embedded migrations, and an in-process store.

mod memory;
mod models;
mod store;

pub use memory::*;
pub use models::*;
pub use store::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Invalid target: {0}")]
    InvalidTarget(String),
    #[error("Target already exists: {0}")]
    Duplicate(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Persistence contract consumed by the monitor.
///
/// Target mutations are partial: probe state, SSL state and domain state are
/// written independently so the probe sweep and the asset sweep never
/// overwrite each other's fields.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Register a target. An HTTP URL that is already registered, after
    /// normalization, is rejected with [`StorageError::Duplicate`].
    async fn add_target(&self, target: NewTarget) -> Result<Target, StorageError>;
    async fn list_targets(&self) -> Result<Vec<Target>, StorageError>;
    async fn get_target(&self, id: i64) -> Result<Target, StorageError>;
    /// Delete a target together with its checks and incidents.
    async fn delete_target(&self, id: i64) -> Result<(), StorageError>;

    async fn update_probe_state(&self, id: i64, update: &ProbeUpdate) -> Result<(), StorageError>;
    async fn update_ssl_state(&self, id: i64, update: &SslUpdate) -> Result<(), StorageError>;
    async fn update_domain_state(&self, id: i64, update: &DomainUpdate)
        -> Result<(), StorageError>;

    async fn append_check(&self, check: NewCheck) -> Result<Check, StorageError>;
    /// Checks created at or after `since`, oldest first. `None` means all targets.
    async fn checks_since(
        &self,
        target_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Check>, StorageError>;
    /// One target's checks created strictly before `before`, newest first.
    /// `limit` is clamped to `1..=MAX_CHECK_PAGE`.
    async fn list_checks(
        &self,
        target_id: i64,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<CheckPage, StorageError>;

    /// Most recent ONGOING incident for the target, if any.
    async fn find_ongoing_incident(&self, target_id: i64)
        -> Result<Option<Incident>, StorageError>;
    async fn create_incident(&self, incident: NewIncident) -> Result<Incident, StorageError>;
    async fn close_incident(&self, id: i64, end_time: DateTime<Utc>) -> Result<(), StorageError>;
    /// Incidents matching the query, newest first.
    async fn list_incidents(&self, query: &IncidentQuery) -> Result<Vec<Incident>, StorageError>;

    /// Drop checks created before `cutoff` and incidents that started before it.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats, StorageError>;
}

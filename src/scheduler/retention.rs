//! Retention for check history and incidents.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::db::{MonitorStore, PurgeStats, StorageError};

/// Delete checks and incidents older than `retention_days` before `now`.
pub async fn process_retention(
    store: &dyn MonitorStore,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<PurgeStats, StorageError> {
    let cutoff = now - ChronoDuration::days(retention_days as i64);
    let stats = store.purge_before(cutoff).await?;

    if stats.checks > 0 || stats.incidents > 0 {
        tracing::info!(
            "Retention: removed {} checks and {} incidents older than {}",
            stats.checks,
            stats.incidents,
            cutoff
        );
    } else {
        tracing::debug!("Retention: nothing older than {}", cutoff);
    }

    Ok(stats)
}

//! Aggregation queries over stored check history.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::db::{MonitorStore, StorageError, TargetStatus};

/// Largest window any query accepts (one week).
pub const MAX_HOURS: u32 = 168;

pub fn clamp_hours(hours: i64) -> u32 {
    hours.clamp(0, MAX_HOURS as i64) as u32
}

/// `up / total * 100`, rounded. `None` without samples.
pub fn uptime_percent(up: usize, total: usize) -> Option<u32> {
    if total == 0 {
        return None;
    }
    Some((up as f64 / total as f64 * 100.0).round() as u32)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeReport {
    pub since: DateTime<Utc>,
    pub hours: u32,
    pub up_count: usize,
    pub total: usize,
    pub uptime_percent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyBucket {
    /// "HH:00" label in UTC.
    pub hour: String,
    pub start: DateTime<Utc>,
    pub up: usize,
    pub total: usize,
    pub percent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetUptime {
    pub target_id: i64,
    pub total: usize,
    pub up: usize,
    pub latest_status: TargetStatus,
    pub latest_at: DateTime<Utc>,
    pub uptime_percent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub since: DateTime<Utc>,
    pub hours: u32,
    pub targets: usize,
    pub checks: usize,
    pub up_count: usize,
    pub uptime_percent: Option<u32>,
    /// Targets with checks in the window, busiest first.
    pub per_target: Vec<TargetUptime>,
}

fn window_start(now: DateTime<Utc>, hours: u32) -> DateTime<Utc> {
    now - ChronoDuration::hours(hours as i64)
}

/// Uptime of one target, or of all targets, over the last `hours`.
pub async fn uptime(
    store: &dyn MonitorStore,
    target_id: Option<i64>,
    hours: i64,
    now: DateTime<Utc>,
) -> Result<UptimeReport, StorageError> {
    let hours = clamp_hours(hours);
    let since = window_start(now, hours);
    let checks = store.checks_since(target_id, since).await?;

    let up_count = checks.iter().filter(|c| c.status == TargetStatus::Up).count();
    Ok(UptimeReport {
        since,
        hours,
        up_count,
        total: checks.len(),
        uptime_percent: uptime_percent(up_count, checks.len()),
    })
}

/// One bucket per hour, oldest first, the last one being the current hour.
pub async fn hourly_uptime(
    store: &dyn MonitorStore,
    target_id: i64,
    hours: i64,
    now: DateTime<Utc>,
) -> Result<Vec<HourlyBucket>, StorageError> {
    let hours = clamp_hours(hours);
    if hours == 0 {
        return Ok(Vec::new());
    }

    let current_hour = now
        .duration_trunc(ChronoDuration::hours(1))
        .unwrap_or(now);
    let first = current_hour - ChronoDuration::hours(hours as i64 - 1);

    let mut buckets: Vec<HourlyBucket> = (0..hours as i64)
        .map(|i| {
            let start = first + ChronoDuration::hours(i);
            HourlyBucket {
                hour: start.format("%H:00").to_string(),
                start,
                up: 0,
                total: 0,
                percent: None,
            }
        })
        .collect();

    for check in store.checks_since(Some(target_id), first).await? {
        let idx = (check.created_at - first).num_hours();
        if let Some(bucket) = usize::try_from(idx).ok().and_then(|i| buckets.get_mut(i)) {
            bucket.total += 1;
            if check.status == TargetStatus::Up {
                bucket.up += 1;
            }
        }
    }

    for bucket in &mut buckets {
        bucket.percent = uptime_percent(bucket.up, bucket.total);
    }
    Ok(buckets)
}

/// Fleet-wide totals plus a per-target breakdown.
pub async fn overview(
    store: &dyn MonitorStore,
    hours: i64,
    now: DateTime<Utc>,
) -> Result<Overview, StorageError> {
    let hours = clamp_hours(hours);
    let since = window_start(now, hours);
    let targets = store.list_targets().await?.len();
    let checks = store.checks_since(None, since).await?;

    let mut per_target: HashMap<i64, TargetUptime> = HashMap::new();
    // Oldest first, so the last write wins for "latest"
    for check in &checks {
        let entry = per_target.entry(check.target_id).or_insert(TargetUptime {
            target_id: check.target_id,
            total: 0,
            up: 0,
            latest_status: check.status,
            latest_at: check.created_at,
            uptime_percent: None,
        });
        entry.total += 1;
        if check.status == TargetStatus::Up {
            entry.up += 1;
        }
        entry.latest_status = check.status;
        entry.latest_at = check.created_at;
    }

    let mut per_target: Vec<TargetUptime> = per_target
        .into_values()
        .map(|mut t| {
            t.uptime_percent = uptime_percent(t.up, t.total);
            t
        })
        .collect();
    per_target.sort_by(|a, b| b.total.cmp(&a.total).then(a.target_id.cmp(&b.target_id)));

    let up_count = checks.iter().filter(|c| c.status == TargetStatus::Up).count();
    Ok(Overview {
        since,
        hours,
        targets,
        checks: checks.len(),
        up_count,
        uptime_percent: uptime_percent(up_count, checks.len()),
        per_target,
    })
}

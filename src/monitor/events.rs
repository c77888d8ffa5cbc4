//! Event sink consumed by push layers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::{Target, TargetStatus};

pub const CHECK_RECORDED: &str = "check:recorded";
pub const TARGET_UPDATED: &str = "target:updated";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRecorded {
    pub target_id: i64,
    pub status: TargetStatus,
    pub response_time_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the monitor publishes, tagged with its wire name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum MonitorEvent {
    #[serde(rename = "check:recorded")]
    CheckRecorded(CheckRecorded),
    #[serde(rename = "target:updated")]
    TargetUpdated(Box<Target>),
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::CheckRecorded(_) => CHECK_RECORDED,
            MonitorEvent::TargetUpdated(_) => TARGET_UPDATED,
        }
    }
}

/// Receives monitor events.
///
/// Called inline from the probe pipeline, so the methods are synchronous and
/// must return promptly. Sinks that do I/O should hand the event to a channel
/// or a spawned task, as [`BroadcastSink`] does.
pub trait EventSink: Send + Sync {
    fn on_check_recorded(&self, event: CheckRecorded);
    fn on_target_updated(&self, target: Target);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_check_recorded(&self, _event: CheckRecorded) {}
    fn on_target_updated(&self, _target: Target) {}
}

/// Fan-out over a bounded broadcast channel. Slow subscribers lag and lose
/// events instead of stalling the probe pipeline.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<MonitorEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: MonitorEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl EventSink for BroadcastSink {
    fn on_check_recorded(&self, event: CheckRecorded) {
        self.publish(MonitorEvent::CheckRecorded(event));
    }

    fn on_target_updated(&self, target: Target) {
        self.publish(MonitorEvent::TargetUpdated(Box::new(target)));
    }
}

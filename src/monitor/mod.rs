//! Monitoring orchestrator.
//!
//! Runs probes, applies their results to targets, manages the incident
//! lifecycle and publishes events. Also drives the daily TLS/domain sweep.

mod events;

pub use events::*;

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::db::{
    DomainUpdate, Incident, MonitorStore, NewCheck, NewIncident, ProbeUpdate, SslUpdate,
    StorageError, Target, TargetStatus,
};
use crate::inspect::{days_left, hostname_from_url, AssetInspector};
use crate::probe::{ProbeOutcome, Prober};

/// What happened to a target's incidents during one check.
#[derive(Debug, Clone, PartialEq)]
pub enum IncidentChange {
    None,
    Opened(Incident),
    /// Id of the resolved incident.
    Resolved(i64),
}

/// Result of one target pipeline run.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub previous: TargetStatus,
    pub outcome: ProbeOutcome,
    pub target: Target,
    pub incident: IncidentChange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub up: usize,
    pub down: usize,
    /// Targets whose pipeline hit a storage error or panicked.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssetSummary {
    pub inspected: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Ties probes, inspectors, storage and events together.
#[derive(Clone)]
pub struct Monitor {
    store: Arc<dyn MonitorStore>,
    prober: Arc<dyn Prober>,
    inspector: Arc<dyn AssetInspector>,
    events: Arc<dyn EventSink>,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        prober: Arc<dyn Prober>,
        inspector: Arc<dyn AssetInspector>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            prober,
            inspector,
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn MonitorStore> {
        &self.store
    }

    /// Probe one target and apply the result. Steps run strictly in order;
    /// storage errors abort the pipeline for this target only.
    pub async fn check_target(&self, target: &Target) -> Result<CheckOutcome, StorageError> {
        let previous = target.status;
        let outcome = self.prober.probe(target).await;
        let status = if outcome.up {
            TargetStatus::Up
        } else {
            TargetStatus::Down
        };
        let now = Utc::now();

        let update = ProbeUpdate {
            status,
            response_time_ms: if outcome.up { outcome.response_time_ms } else { None },
            last_checked: now,
        };
        self.store.update_probe_state(target.id, &update).await?;

        self.store
            .append_check(NewCheck {
                target_id: target.id,
                status,
                response_time_ms: update.response_time_ms,
                created_at: now,
            })
            .await?;

        let incident = if previous == status {
            IncidentChange::None
        } else {
            match status {
                TargetStatus::Down => {
                    let reason = outcome.reason.clone().unwrap_or_else(|| "unknown".to_string());
                    info!("{} is DOWN: {}", target.label(), reason);
                    let incident = self
                        .store
                        .create_incident(NewIncident {
                            target_id: target.id,
                            start_time: now,
                            reason,
                        })
                        .await?;
                    IncidentChange::Opened(incident)
                }
                TargetStatus::Up if previous == TargetStatus::Down => {
                    info!("{} is back UP", target.label());
                    match self.store.find_ongoing_incident(target.id).await? {
                        Some(open) => {
                            self.store.close_incident(open.id, now).await?;
                            IncidentChange::Resolved(open.id)
                        }
                        None => {
                            debug!("No ongoing incident to resolve for {}", target.label());
                            IncidentChange::None
                        }
                    }
                }
                _ => IncidentChange::None,
            }
        };

        let mut snapshot = target.clone();
        snapshot.apply_probe(&update);

        self.events.on_check_recorded(CheckRecorded {
            target_id: target.id,
            status,
            response_time_ms: update.response_time_ms,
            timestamp: now,
        });
        self.events.on_target_updated(snapshot.clone());

        Ok(CheckOutcome {
            previous,
            outcome,
            target: snapshot,
            incident,
        })
    }

    /// Probe every target concurrently. One target's failure never affects another.
    pub async fn run_all_checks(&self) -> Result<SweepSummary, StorageError> {
        let targets = self.store.list_targets().await?;
        let start = Instant::now();
        let total = targets.len();

        let mut set = JoinSet::new();
        for target in targets {
            let monitor = self.clone();
            set.spawn(async move {
                let result = monitor.check_target(&target).await;
                (target, result)
            });
        }

        let mut summary = SweepSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) if outcome.outcome.up => summary.up += 1,
                Ok((_, Ok(_))) => summary.down += 1,
                Ok((target, Err(e))) => {
                    error!("Check pipeline failed for {}: {}", target.label(), e);
                    summary.failed += 1;
                }
                Err(e) => {
                    error!("Check task aborted: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Probe sweep finished: {} targets ({} up, {} down, {} failed) in {:?}",
            total,
            summary.up,
            summary.down,
            summary.failed,
            start.elapsed()
        );
        Ok(summary)
    }

    /// TLS and domain expiry for one target. Returns `Ok(false)` when the
    /// target has no hostname to inspect.
    pub async fn check_assets(&self, target: &Target) -> Result<bool, StorageError> {
        let Some(host) = target.url.as_deref().and_then(hostname_from_url) else {
            return Ok(false);
        };

        let (cert, domain) = tokio::join!(
            self.inspector.certificate_expiry(&host),
            self.inspector.domain_expiry(&host)
        );
        let now = Utc::now();

        let valid_to = cert.unwrap_or_else(|e| {
            warn!("Certificate check failed for {}: {}", host, e);
            None
        });
        let ssl = SslUpdate {
            valid_to,
            days_left: days_left(valid_to, now),
            checked_at: now,
        };

        let domain = DomainUpdate {
            days_left: domain.days_left,
            root: domain.root,
            source: domain.source,
            expires_at: domain.expires_at,
            checked_at: now,
        };

        // Both writes are attempted even if the first fails
        let ssl_result = self.store.update_ssl_state(target.id, &ssl).await;
        let domain_result = self.store.update_domain_state(target.id, &domain).await;
        ssl_result?;
        domain_result?;

        debug!(
            "Assets for {}: ssl_days_left={:?} domain_source={} domain_days_left={:?}",
            host, ssl.days_left, domain.source, domain.days_left
        );
        Ok(true)
    }

    /// Daily sweep over every target with a resolvable hostname.
    pub async fn run_daily_asset_checks(&self) -> Result<AssetSummary, StorageError> {
        let targets = self.store.list_targets().await?;
        let start = Instant::now();

        let mut set = JoinSet::new();
        for target in targets {
            let monitor = self.clone();
            set.spawn(async move {
                let result = monitor.check_assets(&target).await;
                (target, result)
            });
        }

        let mut summary = AssetSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(true))) => summary.inspected += 1,
                Ok((_, Ok(false))) => summary.skipped += 1,
                Ok((target, Err(e))) => {
                    error!("Asset update failed for {}: {}", target.label(), e);
                    summary.failed += 1;
                }
                Err(e) => {
                    error!("Asset task aborted: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Asset sweep finished: {} inspected, {} skipped, {} failed in {:?}",
            summary.inspected,
            summary.skipped,
            summary.failed,
            start.elapsed()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DomainSource, IncidentQuery, IncidentStatus, MemoryStore, NewTarget};
    use crate::inspect::{DomainExpiry, InspectError};
    use crate::probe::NetworkProber;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Replays queued outcomes per target id; DOWN when the queue is empty.
    #[derive(Default)]
    struct ScriptedProber {
        script: Mutex<HashMap<i64, VecDeque<ProbeOutcome>>>,
    }

    impl ScriptedProber {
        fn push(&self, id: i64, outcome: ProbeOutcome) {
            self.script.lock().unwrap().entry(id).or_default().push_back(outcome);
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, target: &Target) -> ProbeOutcome {
            self.script
                .lock()
                .unwrap()
                .get_mut(&target.id)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| ProbeOutcome::down("ECONNREFUSED"))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<MonitorEvent>>,
    }

    impl EventSink for RecordingSink {
        fn on_check_recorded(&self, event: CheckRecorded) {
            self.events.lock().unwrap().push(MonitorEvent::CheckRecorded(event));
        }

        fn on_target_updated(&self, target: Target) {
            self.events
                .lock()
                .unwrap()
                .push(MonitorEvent::TargetUpdated(Box::new(target)));
        }
    }

    struct FixedInspector {
        cert: Result<Option<DateTime<Utc>>, InspectError>,
        domain: DomainExpiry,
    }

    #[async_trait]
    impl AssetInspector for FixedInspector {
        async fn certificate_expiry(
            &self,
            _host: &str,
        ) -> Result<Option<DateTime<Utc>>, InspectError> {
            self.cert.clone()
        }

        async fn domain_expiry(&self, _host: &str) -> DomainExpiry {
            self.domain.clone()
        }
    }

    fn no_assets() -> Arc<FixedInspector> {
        Arc::new(FixedInspector {
            cert: Ok(None),
            domain: DomainExpiry {
                root: None,
                source: DomainSource::None,
                expires_at: None,
                days_left: None,
            },
        })
    }

    struct Harness {
        store: Arc<MemoryStore>,
        prober: Arc<ScriptedProber>,
        sink: Arc<RecordingSink>,
        monitor: Monitor,
    }

    fn harness(inspector: Arc<FixedInspector>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let prober = Arc::new(ScriptedProber::default());
        let sink = Arc::new(RecordingSink::default());
        let monitor = Monitor::new(store.clone(), prober.clone(), inspector, sink.clone());
        Harness {
            store,
            prober,
            sink,
            monitor,
        }
    }

    async fn ongoing(store: &MemoryStore, target_id: i64) -> usize {
        store
            .list_incidents(&IncidentQuery::for_target(target_id))
            .await
            .unwrap()
            .iter()
            .filter(|i| i.status == IncidentStatus::Ongoing)
            .count()
    }

    async fn check(h: &Harness, id: i64) -> CheckOutcome {
        let target = h.store.get_target(id).await.unwrap();
        h.monitor.check_target(&target).await.unwrap()
    }

    #[tokio::test]
    async fn test_pending_to_up_opens_nothing() {
        let h = harness(no_assets());
        let t = h.store.add_target(NewTarget::http("https://ok.example")).await.unwrap();
        h.prober.push(t.id, ProbeOutcome::up(42));

        let result = check(&h, t.id).await;
        assert_eq!(result.previous, TargetStatus::Pending);
        assert_eq!(result.incident, IncidentChange::None);

        let stored = h.store.get_target(t.id).await.unwrap();
        assert_eq!(stored.status, TargetStatus::Up);
        assert_eq!(stored.response_time_ms, Some(42));
        assert!(stored.last_checked.is_some());
        assert!(h.store.list_incidents(&IncidentQuery::for_target(t.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_to_down_opens_incident() {
        let h = harness(no_assets());
        let t = h.store.add_target(NewTarget::tcp("10.0.0.1", 9999)).await.unwrap();
        h.prober.push(t.id, ProbeOutcome::down("TCP_TIMEOUT"));

        let result = check(&h, t.id).await;
        let IncidentChange::Opened(incident) = result.incident else {
            panic!("expected an incident, got {:?}", result.incident);
        };
        assert_eq!(incident.reason.as_deref(), Some("TCP_TIMEOUT"));
        assert_eq!(incident.status, IncidentStatus::Ongoing);
        assert!(incident.end_time.is_none());

        let stored = h.store.get_target(t.id).await.unwrap();
        assert_eq!(stored.status, TargetStatus::Down);
        assert_eq!(stored.response_time_ms, None);
    }

    #[tokio::test]
    async fn test_down_without_reason_uses_unknown() {
        let h = harness(no_assets());
        let t = h.store.add_target(NewTarget::http("https://x.example")).await.unwrap();
        h.prober.push(
            t.id,
            ProbeOutcome {
                up: false,
                response_time_ms: Some(5),
                reason: None,
            },
        );

        let result = check(&h, t.id).await;
        let IncidentChange::Opened(incident) = result.incident else {
            panic!("expected an incident");
        };
        assert_eq!(incident.reason.as_deref(), Some("unknown"));
        // Response time never recorded for DOWN
        assert_eq!(result.target.response_time_ms, None);
    }

    #[tokio::test]
    async fn test_incident_invariants_over_flapping_sequence() {
        let h = harness(no_assets());
        let t = h.store.add_target(NewTarget::http("https://flaky.example")).await.unwrap();
        let sequence = [true, false, false, true, true, false, true, false, false, true];
        for &up in &sequence {
            h.prober.push(
                t.id,
                if up {
                    ProbeOutcome::up(10)
                } else {
                    ProbeOutcome::down("HTTP 500 (expected 200)")
                },
            );
        }

        for _ in &sequence {
            check(&h, t.id).await;
            assert!(ongoing(&h.store, t.id).await <= 1);
        }

        let since = Utc::now() - ChronoDuration::hours(1);
        let checks = h.store.checks_since(Some(t.id), since).await.unwrap();
        assert_eq!(checks.len(), sequence.len());

        // Three UP->DOWN transitions, each resolved
        let incidents = h.store.list_incidents(&IncidentQuery::for_target(t.id)).await.unwrap();
        assert_eq!(incidents.len(), 3);
        assert!(incidents.iter().all(|i| i.status == IncidentStatus::Resolved));
        assert!(incidents.iter().all(|i| i.end_time.is_some()));
    }

    #[tokio::test]
    async fn test_up_from_down_without_incident_is_noop() {
        let h = harness(no_assets());
        let t = h.store.add_target(NewTarget::http("https://ok.example")).await.unwrap();
        h.store
            .update_probe_state(
                t.id,
                &ProbeUpdate {
                    status: TargetStatus::Down,
                    response_time_ms: None,
                    last_checked: Utc::now(),
                },
            )
            .await
            .unwrap();
        h.prober.push(t.id, ProbeOutcome::up(8));

        let result = check(&h, t.id).await;
        assert_eq!(result.previous, TargetStatus::Down);
        assert_eq!(result.incident, IncidentChange::None);
    }

    #[tokio::test]
    async fn test_events_emitted_every_probe() {
        let h = harness(no_assets());
        let t = h.store.add_target(NewTarget::http("https://ok.example")).await.unwrap();
        h.prober.push(t.id, ProbeOutcome::up(5));
        h.prober.push(t.id, ProbeOutcome::up(6));

        check(&h, t.id).await;
        check(&h, t.id).await;

        let events = h.sink.events.lock().unwrap().clone();
        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![CHECK_RECORDED, TARGET_UPDATED, CHECK_RECORDED, TARGET_UPDATED]
        );
        match &events[3] {
            MonitorEvent::TargetUpdated(target) => {
                assert_eq!(target.status, TargetStatus::Up);
                assert_eq!(target.response_time_ms, Some(6));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_all_checks_isolates_targets() {
        let h = harness(no_assets());
        let a = h.store.add_target(NewTarget::http("https://a.example")).await.unwrap();
        let b = h.store.add_target(NewTarget::http("https://b.example")).await.unwrap();
        let c = h.store.add_target(NewTarget::tcp("c.internal", 22)).await.unwrap();
        h.prober.push(a.id, ProbeOutcome::up(1));
        h.prober.push(b.id, ProbeOutcome::down("HTTP 503 (expected 200)"));
        h.prober.push(c.id, ProbeOutcome::up(3));

        let summary = h.monitor.run_all_checks().await.unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                up: 2,
                down: 1,
                failed: 0
            }
        );
        assert_eq!(ongoing(&h.store, b.id).await, 1);
        assert_eq!(ongoing(&h.store, a.id).await, 0);
    }

    #[tokio::test]
    async fn test_storage_error_propagates_from_check() {
        let h = harness(no_assets());
        let t = h.store.add_target(NewTarget::http("https://gone.example")).await.unwrap();
        h.store.delete_target(t.id).await.unwrap();

        let result = h.monitor.check_target(&t).await;
        assert!(matches!(result, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn test_asset_failures_are_independent() {
        let expires = Utc::now() + ChronoDuration::days(90);
        let h = harness(Arc::new(FixedInspector {
            cert: Err(InspectError::Timeout("TLS handshake with example.com".to_string())),
            domain: DomainExpiry {
                root: Some("example.com".to_string()),
                source: DomainSource::Whois,
                expires_at: Some(expires),
                days_left: Some(90),
            },
        }));
        let http = h.store.add_target(NewTarget::http("https://www.example.com/health")).await.unwrap();
        let tcp = h.store.add_target(NewTarget::tcp("db.internal", 5432)).await.unwrap();
        h.prober.push(http.id, ProbeOutcome::up(20));
        check(&h, http.id).await;

        let summary = h.monitor.run_daily_asset_checks().await.unwrap();
        assert_eq!(
            summary,
            AssetSummary {
                inspected: 1,
                skipped: 1,
                failed: 0
            }
        );

        let stored = h.store.get_target(http.id).await.unwrap();
        assert_eq!(stored.ssl_valid_to, None);
        assert_eq!(stored.ssl_days_left, None);
        assert!(stored.ssl_checked_at.is_some());
        assert_eq!(stored.domain_source, Some(DomainSource::Whois));
        assert_eq!(stored.domain_root.as_deref(), Some("example.com"));
        assert_eq!(stored.domain_days_left, Some(90));
        // Probe fields untouched by the asset sweep
        assert_eq!(stored.status, TargetStatus::Up);
        assert_eq!(stored.response_time_ms, Some(20));

        let untouched = h.store.get_target(tcp.id).await.unwrap();
        assert!(untouched.ssl_checked_at.is_none());
        assert!(untouched.domain_checked_at.is_none());
    }

    #[tokio::test]
    async fn test_http_target_lifecycle_against_live_server() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let monitor = Monitor::new(store.clone(), Arc::new(NetworkProber), no_assets(), sink);
        let t = store.add_target(NewTarget::http(&server.uri())).await.unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let first = monitor.check_target(&store.get_target(t.id).await.unwrap()).await.unwrap();
        assert!(first.outcome.up);
        assert!(first.outcome.reason.is_none());
        assert_eq!(first.target.status, TargetStatus::Up);
        assert_eq!(first.incident, IncidentChange::None);

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let second = monitor.check_target(&store.get_target(t.id).await.unwrap()).await.unwrap();
        assert_eq!(second.outcome.reason.as_deref(), Some("HTTP 503 (expected 200)"));
        assert_eq!(second.target.status, TargetStatus::Down);
        assert!(matches!(second.incident, IncidentChange::Opened(_)));

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let third = monitor.check_target(&store.get_target(t.id).await.unwrap()).await.unwrap();
        assert_eq!(third.target.status, TargetStatus::Up);
        let IncidentChange::Resolved(id) = third.incident else {
            panic!("expected resolution, got {:?}", third.incident);
        };

        let incidents = store.list_incidents(&IncidentQuery::for_target(t.id)).await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].id, id);
        assert_eq!(incidents[0].status, IncidentStatus::Resolved);
        assert!(incidents[0].end_time.is_some());
    }
}

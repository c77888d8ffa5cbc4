//! In-process store, handy for embedding and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};

use super::models::*;
use super::{MonitorStore, StorageError};

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    targets: Vec<Target>,
    checks: Vec<Check>,
    incidents: Vec<Incident>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn target_mut(&mut self, id: i64) -> Result<&mut Target, StorageError> {
        self.targets
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StorageError::NotFound)
    }
}

/// Store backed by plain vectors behind a mutex.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::Poisoned)
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn add_target(&self, target: NewTarget) -> Result<Target, StorageError> {
        let target = target.validate()?;
        let mut state = self.state()?;
        if let Some(url) = target.url.as_deref() {
            if state.targets.iter().any(|t| t.url.as_deref() == Some(url)) {
                return Err(StorageError::Duplicate(url.to_string()));
            }
        }
        let id = state.next_id();
        let target = Target::from_new(id, target, Utc::now());
        state.targets.push(target.clone());
        Ok(target)
    }

    async fn list_targets(&self) -> Result<Vec<Target>, StorageError> {
        Ok(self.state()?.targets.clone())
    }

    async fn get_target(&self, id: i64) -> Result<Target, StorageError> {
        self.state()?
            .targets
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn delete_target(&self, id: i64) -> Result<(), StorageError> {
        let mut state = self.state()?;
        let before = state.targets.len();
        state.targets.retain(|t| t.id != id);
        if state.targets.len() == before {
            return Err(StorageError::NotFound);
        }
        state.checks.retain(|c| c.target_id != id);
        state.incidents.retain(|i| i.target_id != id);
        Ok(())
    }

    async fn update_probe_state(&self, id: i64, update: &ProbeUpdate) -> Result<(), StorageError> {
        self.state()?.target_mut(id)?.apply_probe(update);
        Ok(())
    }

    async fn update_ssl_state(&self, id: i64, update: &SslUpdate) -> Result<(), StorageError> {
        self.state()?.target_mut(id)?.apply_ssl(update);
        Ok(())
    }

    async fn update_domain_state(
        &self,
        id: i64,
        update: &DomainUpdate,
    ) -> Result<(), StorageError> {
        self.state()?.target_mut(id)?.apply_domain(update);
        Ok(())
    }

    async fn append_check(&self, check: NewCheck) -> Result<Check, StorageError> {
        let mut state = self.state()?;
        let check = Check {
            id: state.next_id(),
            target_id: check.target_id,
            status: check.status,
            response_time_ms: check.response_time_ms,
            created_at: check.created_at,
        };
        state.checks.push(check.clone());
        Ok(check)
    }

    async fn checks_since(
        &self,
        target_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Check>, StorageError> {
        let mut checks: Vec<Check> = self
            .state()?
            .checks
            .iter()
            .filter(|c| target_id.map_or(true, |id| c.target_id == id) && c.created_at >= since)
            .cloned()
            .collect();
        checks.sort_by_key(|c| (c.created_at, c.id));
        Ok(checks)
    }

    async fn list_checks(
        &self,
        target_id: i64,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<CheckPage, StorageError> {
        let limit = clamp_check_limit(limit);
        let mut checks: Vec<Check> = self
            .state()?
            .checks
            .iter()
            .filter(|c| c.target_id == target_id && before.map_or(true, |b| c.created_at < b))
            .cloned()
            .collect();
        checks.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        checks.truncate(limit + 1);
        Ok(CheckPage::from_overfetch(checks, limit))
    }

    async fn find_ongoing_incident(
        &self,
        target_id: i64,
    ) -> Result<Option<Incident>, StorageError> {
        Ok(self
            .state()?
            .incidents
            .iter()
            .filter(|i| i.target_id == target_id && i.status == IncidentStatus::Ongoing)
            .max_by_key(|i| (i.start_time, i.id))
            .cloned())
    }

    async fn create_incident(&self, incident: NewIncident) -> Result<Incident, StorageError> {
        let mut state = self.state()?;
        let incident = Incident {
            id: state.next_id(),
            target_id: incident.target_id,
            status: IncidentStatus::Ongoing,
            start_time: incident.start_time,
            end_time: None,
            reason: Some(incident.reason),
        };
        state.incidents.push(incident.clone());
        Ok(incident)
    }

    async fn close_incident(&self, id: i64, end_time: DateTime<Utc>) -> Result<(), StorageError> {
        let mut state = self.state()?;
        let incident = state
            .incidents
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StorageError::NotFound)?;
        incident.status = IncidentStatus::Resolved;
        incident.end_time = Some(end_time);
        Ok(())
    }

    async fn list_incidents(&self, query: &IncidentQuery) -> Result<Vec<Incident>, StorageError> {
        let mut incidents: Vec<Incident> = self
            .state()?
            .incidents
            .iter()
            .filter(|i| query.matches(i))
            .cloned()
            .collect();
        incidents.sort_by(|a, b| (b.start_time, b.id).cmp(&(a.start_time, a.id)));
        incidents.truncate(query.effective_limit());
        Ok(incidents)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats, StorageError> {
        let mut state = self.state()?;
        let checks_before = state.checks.len();
        let incidents_before = state.incidents.len();
        state.checks.retain(|c| c.created_at >= cutoff);
        state.incidents.retain(|i| i.start_time >= cutoff);
        Ok(PurgeStats {
            checks: (checks_before - state.checks.len()) as u64,
            incidents: (incidents_before - state.incidents.len()) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_duplicate_url_rejected() {
        let store = MemoryStore::new();
        store.add_target(NewTarget::http("https://ok.example")).await.unwrap();

        let err = store
            .add_target(NewTarget::http("HTTPS://OK.example/"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Duplicate(ref url) if url == "https://ok.example"));

        // TCP targets have no URL and never collide
        store.add_target(NewTarget::tcp("db.internal", 5432)).await.unwrap();
        store.add_target(NewTarget::tcp("db.internal", 5432)).await.unwrap();
        assert_eq!(store.list_targets().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_checks_pages_newest_first() {
        let store = MemoryStore::new();
        let a = store.add_target(NewTarget::http("https://a.example")).await.unwrap();
        let b = store.add_target(NewTarget::http("https://b.example")).await.unwrap();
        let now = Utc::now();
        for minutes in 0..5 {
            for target in [&a, &b] {
                store
                    .append_check(NewCheck {
                        target_id: target.id,
                        status: TargetStatus::Up,
                        response_time_ms: Some(minutes as u64),
                        created_at: now - ChronoDuration::minutes(minutes),
                    })
                    .await
                    .unwrap();
            }
        }

        let first = store.list_checks(a.id, None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);
        assert!(first.items.iter().all(|c| c.target_id == a.id));
        assert_eq!(first.items[0].created_at, now);

        let second = store.list_checks(a.id, first.next_cursor, 2).await.unwrap();
        assert_eq!(second.items[0].created_at, now - ChronoDuration::minutes(2));
        assert!(second.has_more);

        let last = store.list_checks(a.id, second.next_cursor, 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
        assert_eq!(last.next_cursor, None);
    }

    #[tokio::test]
    async fn test_list_incidents_filters_and_limits() {
        let store = MemoryStore::new();
        let target = store.add_target(NewTarget::tcp("db.internal", 5432)).await.unwrap();
        let start = Utc::now() - ChronoDuration::hours(5);
        for hour in 0..4 {
            let incident = store
                .create_incident(NewIncident {
                    target_id: target.id,
                    start_time: start + ChronoDuration::hours(hour),
                    reason: "TCP_TIMEOUT".to_string(),
                })
                .await
                .unwrap();
            if hour < 3 {
                store
                    .close_incident(incident.id, incident.start_time + ChronoDuration::minutes(5))
                    .await
                    .unwrap();
            }
        }

        let ongoing = store
            .list_incidents(&IncidentQuery::for_target(target.id).with_status(IncidentStatus::Ongoing))
            .await
            .unwrap();
        assert_eq!(ongoing.len(), 1);
        assert_eq!(ongoing[0].start_time, start + ChronoDuration::hours(3));

        let resolved = store
            .list_incidents(
                &IncidentQuery::default()
                    .with_status(IncidentStatus::Resolved)
                    .with_limit(2),
            )
            .await
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].start_time, start + ChronoDuration::hours(2));

        assert!(store
            .list_incidents(&IncidentQuery::for_target(target.id + 100))
            .await
            .unwrap()
            .is_empty());
    }
}

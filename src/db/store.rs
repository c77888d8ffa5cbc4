//! SQLite database store implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::models::*;
use super::{MonitorStore, StorageError};

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const TARGET_COLUMNS: &str = "id, kind, url, tcp_host, tcp_port, expected_status, body_must_contain, \
     timeout_ms, status, response_time_ms, last_checked, ssl_valid_to, ssl_days_left, \
     ssl_checked_at, domain_expires_at, domain_days_left, domain_root, domain_source, \
     domain_checked_at, created_at";

/// Thread-safe SQLite store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StorageError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn read_target(&self, conn: &Connection, id: i64) -> Result<Target, StorageError> {
        conn.query_row(
            &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
            params![id],
            row_to_target,
        )
        .optional()?
        .ok_or(StorageError::NotFound)
    }

    fn ensure_updated(changed: usize) -> Result<(), StorageError> {
        if changed == 0 {
            Err(StorageError::NotFound)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MonitorStore for SqliteStore {
    async fn add_target(&self, target: NewTarget) -> Result<Target, StorageError> {
        let target = target.validate()?;
        let created_at = Utc::now();

        let conn = self.conn()?;
        if let Some(url) = target.url.as_deref() {
            let exists = conn
                .query_row("SELECT id FROM targets WHERE url = ?1 LIMIT 1", params![url], |row| {
                    row.get::<_, i64>(0)
                })
                .optional()?;
            if exists.is_some() {
                return Err(StorageError::Duplicate(url.to_string()));
            }
        }
        conn.execute(
            "INSERT INTO targets (kind, url, tcp_host, tcp_port, expected_status, body_must_contain, timeout_ms, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', ?8)",
            params![
                target.kind.as_str(),
                target.url,
                target.tcp_host,
                target.tcp_port.map(i64::from),
                i64::from(target.expected_status),
                target.body_must_contain,
                target.timeout_ms as i64,
                fmt_db_time(&created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Target::from_new(id, target, created_at))
    }

    async fn list_targets(&self) -> Result<Vec<Target>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM targets ORDER BY id", TARGET_COLUMNS))?;
        let targets = stmt
            .query_map([], row_to_target)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    async fn get_target(&self, id: i64) -> Result<Target, StorageError> {
        let conn = self.conn()?;
        self.read_target(&conn, id)
    }

    async fn delete_target(&self, id: i64) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM checks WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM incidents WHERE target_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        tx.commit()?;
        Self::ensure_updated(changed)
    }

    async fn update_probe_state(&self, id: i64, update: &ProbeUpdate) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE targets SET status = ?1, response_time_ms = ?2, last_checked = ?3 WHERE id = ?4",
            params![
                update.status.as_str(),
                update.response_time_ms.map(|ms| ms as i64),
                fmt_db_time(&update.last_checked),
                id,
            ],
        )?;
        Self::ensure_updated(changed)
    }

    async fn update_ssl_state(&self, id: i64, update: &SslUpdate) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE targets SET ssl_valid_to = ?1, ssl_days_left = ?2, ssl_checked_at = ?3 WHERE id = ?4",
            params![
                update.valid_to.as_ref().map(fmt_db_time),
                update.days_left,
                fmt_db_time(&update.checked_at),
                id,
            ],
        )?;
        Self::ensure_updated(changed)
    }

    async fn update_domain_state(
        &self,
        id: i64,
        update: &DomainUpdate,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE targets SET domain_root = ?1, domain_source = ?2, domain_expires_at = ?3, \
             domain_days_left = ?4, domain_checked_at = ?5 WHERE id = ?6",
            params![
                update.root,
                update.source.as_str(),
                update.expires_at.as_ref().map(fmt_db_time),
                update.days_left,
                fmt_db_time(&update.checked_at),
                id,
            ],
        )?;
        Self::ensure_updated(changed)
    }

    async fn append_check(&self, check: NewCheck) -> Result<Check, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO checks (target_id, status, response_time_ms, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                check.target_id,
                check.status.as_str(),
                check.response_time_ms.map(|ms| ms as i64),
                fmt_db_time(&check.created_at),
            ],
        )?;
        Ok(Check {
            id: conn.last_insert_rowid(),
            target_id: check.target_id,
            status: check.status,
            response_time_ms: check.response_time_ms,
            created_at: check.created_at,
        })
    }

    async fn checks_since(
        &self,
        target_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Check>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, target_id, status, response_time_ms, created_at FROM checks \
             WHERE (?1 IS NULL OR target_id = ?1) AND created_at >= ?2 ORDER BY created_at ASC, id ASC",
        )?;
        let checks = stmt
            .query_map(params![target_id, fmt_db_time(&since)], row_to_check)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(checks)
    }

    async fn list_checks(
        &self,
        target_id: i64,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<CheckPage, StorageError> {
        let limit = clamp_check_limit(limit);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, target_id, status, response_time_ms, created_at FROM checks \
             WHERE target_id = ?1 AND (?2 IS NULL OR created_at < ?2) \
             ORDER BY created_at DESC, id DESC LIMIT ?3",
        )?;
        let checks = stmt
            .query_map(
                params![target_id, before.as_ref().map(fmt_db_time), (limit + 1) as i64],
                row_to_check,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(CheckPage::from_overfetch(checks, limit))
    }

    async fn find_ongoing_incident(
        &self,
        target_id: i64,
    ) -> Result<Option<Incident>, StorageError> {
        let conn = self.conn()?;
        let incident = conn
            .query_row(
                "SELECT id, target_id, status, start_time, end_time, reason FROM incidents \
                 WHERE target_id = ?1 AND status = 'ONGOING' ORDER BY start_time DESC, id DESC LIMIT 1",
                params![target_id],
                row_to_incident,
            )
            .optional()?;
        Ok(incident)
    }

    async fn create_incident(&self, incident: NewIncident) -> Result<Incident, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO incidents (target_id, status, start_time, reason) VALUES (?1, 'ONGOING', ?2, ?3)",
            params![
                incident.target_id,
                fmt_db_time(&incident.start_time),
                incident.reason,
            ],
        )?;
        Ok(Incident {
            id: conn.last_insert_rowid(),
            target_id: incident.target_id,
            status: IncidentStatus::Ongoing,
            start_time: incident.start_time,
            end_time: None,
            reason: Some(incident.reason),
        })
    }

    async fn close_incident(&self, id: i64, end_time: DateTime<Utc>) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE incidents SET status = 'RESOLVED', end_time = ?1 WHERE id = ?2",
            params![fmt_db_time(&end_time), id],
        )?;
        Self::ensure_updated(changed)
    }

    async fn list_incidents(&self, query: &IncidentQuery) -> Result<Vec<Incident>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, target_id, status, start_time, end_time, reason FROM incidents \
             WHERE (?1 IS NULL OR target_id = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY start_time DESC, id DESC LIMIT ?3",
        )?;
        let incidents = stmt
            .query_map(
                params![
                    query.target_id,
                    query.status.map(|s| s.as_str()),
                    query.effective_limit() as i64,
                ],
                row_to_incident,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(incidents)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats, StorageError> {
        let cutoff = fmt_db_time(&cutoff);
        let conn = self.conn()?;
        let checks = conn.execute("DELETE FROM checks WHERE created_at < ?1", params![cutoff])?;
        let incidents =
            conn.execute("DELETE FROM incidents WHERE start_time < ?1", params![cutoff])?;
        Ok(PurgeStats {
            checks: checks as u64,
            incidents: incidents as u64,
        })
    }
}

fn row_to_target(row: &Row<'_>) -> SqlResult<Target> {
    Ok(Target {
        id: row.get(0)?,
        kind: text_enum(row, 1)?,
        url: row.get(2)?,
        tcp_host: row.get(3)?,
        tcp_port: row.get::<_, Option<i64>>(4)?.and_then(|p| u16::try_from(p).ok()),
        expected_status: u16::try_from(row.get::<_, i64>(5)?).unwrap_or(200),
        body_must_contain: row.get(6)?,
        timeout_ms: row.get::<_, i64>(7)?.max(0) as u64,
        status: text_enum(row, 8)?,
        response_time_ms: row.get::<_, Option<i64>>(9)?.map(|ms| ms.max(0) as u64),
        last_checked: time_col(row, 10)?,
        ssl_valid_to: time_col(row, 11)?,
        ssl_days_left: row.get(12)?,
        ssl_checked_at: time_col(row, 13)?,
        domain_expires_at: time_col(row, 14)?,
        domain_days_left: row.get(15)?,
        domain_root: row.get(16)?,
        domain_source: row
            .get::<_, Option<String>>(17)?
            .map(|s| DomainSource::normalize(&s)),
        domain_checked_at: time_col(row, 18)?,
        created_at: time_col(row, 19)?.unwrap_or_else(Utc::now),
    })
}

fn row_to_check(row: &Row<'_>) -> SqlResult<Check> {
    Ok(Check {
        id: row.get(0)?,
        target_id: row.get(1)?,
        status: text_enum(row, 2)?,
        response_time_ms: row.get::<_, Option<i64>>(3)?.map(|ms| ms as u64),
        created_at: time_col(row, 4)?.unwrap_or_else(Utc::now),
    })
}

fn row_to_incident(row: &Row<'_>) -> SqlResult<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        target_id: row.get(1)?,
        status: text_enum(row, 2)?,
        start_time: time_col(row, 3)?.unwrap_or_else(Utc::now),
        end_time: time_col(row, 4)?,
        reason: row.get(5)?,
    })
}

fn text_enum<T>(row: &Row<'_>, idx: usize) -> SqlResult<T>
where
    T: FromStr<Err = StorageError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .and_then(|s| parse_db_time(&s)))
}

fn fmt_db_time(t: &DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

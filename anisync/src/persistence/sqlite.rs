use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::job::{JobId, JobInput, JobKind, Priority};
use crate::lock::LockKind;
use crate::store::{
    ArchiveOutcome, ArchivedJobRecord, FailureRecord, JobStore, ScheduledJobEntry,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    identity_key TEXT NOT NULL,
    job_kind TEXT NOT NULL,
    input TEXT NOT NULL,
    priority INTEGER NOT NULL,
    submitted_at TEXT NOT NULL,
    eligible_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_failure TEXT,
    failure_history TEXT NOT NULL DEFAULT '[]',
    claimed_by TEXT,
    claim_expires_at TEXT,
    version INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS jobs_identity_key ON jobs (identity_key);
CREATE INDEX IF NOT EXISTS jobs_eligible ON jobs (priority DESC, submitted_at, id);
CREATE TABLE IF NOT EXISTS job_archive (
    id TEXT PRIMARY KEY,
    identity_key TEXT NOT NULL,
    job_kind TEXT NOT NULL,
    input TEXT NOT NULL,
    priority INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    reason TEXT,
    failure_history TEXT NOT NULL,
    finished_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS job_archive_key ON job_archive (identity_key, outcome, finished_at);
CREATE TABLE IF NOT EXISTS scheduler_flags (
    name TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL
);
"#;

const ENTRY_COLUMNS: &str = "id, identity_key, job_kind, input, priority, submitted_at, \
     eligible_at, attempts, last_failure, failure_history, claimed_by, claim_expires_at, version";

const ARCHIVE_COLUMNS: &str =
    "id, identity_key, job_kind, input, priority, outcome, attempts, reason, failure_history, finished_at";

/// Embedded single-writer job store.
///
/// Calls run on the blocking pool behind one connection. Claims are only
/// safe within a single process, so the store asks for [`LockKind::Process`].
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self
            .conn
            .try_lock()
            .map(|conn| conn.path().unwrap_or(":memory:").to_string());
        f.debug_struct("SqliteJobStore")
            .field("path", &path.as_deref().unwrap_or("<locked>"))
            .finish()
    }
}

impl SqliteJobStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open job database {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create job tables")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await?
    }
}

// Fixed-width UTC text sorts chronologically.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp {raw}"))?
        .with_timezone(&Utc))
}

fn parse_id(raw: &str) -> anyhow::Result<JobId> {
    Ok(JobId(Uuid::parse_str(raw)?))
}

struct EntryRow {
    id: String,
    identity_key: String,
    kind: String,
    input: String,
    priority: i32,
    submitted_at: String,
    eligible_at: String,
    attempts: u32,
    last_failure: Option<String>,
    failure_history: String,
    claimed_by: Option<String>,
    claim_expires_at: Option<String>,
    version: i64,
}

impl EntryRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity_key: row.get(1)?,
            kind: row.get(2)?,
            input: row.get(3)?,
            priority: row.get(4)?,
            submitted_at: row.get(5)?,
            eligible_at: row.get(6)?,
            attempts: row.get(7)?,
            last_failure: row.get(8)?,
            failure_history: row.get(9)?,
            claimed_by: row.get(10)?,
            claim_expires_at: row.get(11)?,
            version: row.get(12)?,
        })
    }

    fn into_entry(self) -> anyhow::Result<ScheduledJobEntry> {
        Ok(ScheduledJobEntry {
            id: parse_id(&self.id)?,
            identity_key: self.identity_key,
            kind: JobKind::new(self.kind),
            input: serde_json::from_str::<JobInput>(&self.input)?,
            priority: Priority::new(self.priority),
            submitted_at: parse_ts(&self.submitted_at)?,
            eligible_at: parse_ts(&self.eligible_at)?,
            attempts: self.attempts,
            last_failure: self.last_failure,
            failure_history: serde_json::from_str::<Vec<FailureRecord>>(&self.failure_history)?,
            claimed_by: self.claimed_by,
            claim_expires_at: self.claim_expires_at.as_deref().map(parse_ts).transpose()?,
            version: u64::try_from(self.version)?,
        })
    }
}

struct ArchiveRow {
    id: String,
    identity_key: String,
    kind: String,
    input: String,
    priority: i32,
    outcome: String,
    attempts: u32,
    reason: Option<String>,
    failure_history: String,
    finished_at: String,
}

impl ArchiveRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity_key: row.get(1)?,
            kind: row.get(2)?,
            input: row.get(3)?,
            priority: row.get(4)?,
            outcome: row.get(5)?,
            attempts: row.get(6)?,
            reason: row.get(7)?,
            failure_history: row.get(8)?,
            finished_at: row.get(9)?,
        })
    }

    fn into_record(self) -> anyhow::Result<ArchivedJobRecord> {
        Ok(ArchivedJobRecord {
            id: parse_id(&self.id)?,
            identity_key: self.identity_key,
            kind: JobKind::new(self.kind),
            input: serde_json::from_str::<JobInput>(&self.input)?,
            priority: Priority::new(self.priority),
            outcome: ArchiveOutcome::parse(&self.outcome)
                .ok_or_else(|| anyhow::anyhow!("invalid archive outcome: {}", self.outcome))?,
            attempts: self.attempts,
            reason: self.reason,
            failure_history: serde_json::from_str::<Vec<FailureRecord>>(&self.failure_history)?,
            finished_at: parse_ts(&self.finished_at)?,
        })
    }
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> anyhow::Result<Vec<ScheduledJobEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, EntryRow::read)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?.into_entry()?);
    }
    Ok(entries)
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> anyhow::Result<Vec<ArchivedJobRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, ArchiveRow::read)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn lock_kind(&self) -> LockKind {
        LockKind::Process
    }

    async fn insert(&self, entry: &ScheduledJobEntry) -> anyhow::Result<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO jobs (id, identity_key, job_kind, input, priority, submitted_at, \
                 eligible_at, attempts, last_failure, failure_history, claimed_by, \
                 claim_expires_at, version) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    entry.id.to_string(),
                    entry.identity_key,
                    entry.kind.as_str(),
                    serde_json::to_string(&entry.input)?,
                    entry.priority.value(),
                    ts(entry.submitted_at),
                    ts(entry.eligible_at),
                    entry.attempts,
                    entry.last_failure,
                    serde_json::to_string(&entry.failure_history)?,
                    entry.claimed_by,
                    entry.claim_expires_at.map(ts),
                    i64::try_from(entry.version)?,
                ],
            )
            .with_context(|| format!("failed to insert job {}", entry.identity_key))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<ScheduledJobEntry>> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
                EntryRow::read,
            )
            .optional()?
            .map(EntryRow::into_entry)
            .transpose()
        })
        .await
    }

    async fn find_active_by_key(
        &self,
        identity_key: &str,
    ) -> anyhow::Result<Option<ScheduledJobEntry>> {
        let identity_key = identity_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM jobs WHERE identity_key = ?1"),
                params![identity_key],
                EntryRow::read,
            )
            .optional()?
            .map(EntryRow::into_entry)
            .transpose()
        })
        .await
    }

    async fn update(
        &self,
        entry: &ScheduledJobEntry,
        expected_version: u64,
    ) -> anyhow::Result<bool> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE jobs SET priority = ?2, eligible_at = ?3, attempts = ?4, \
                 last_failure = ?5, failure_history = ?6, claimed_by = ?7, \
                 claim_expires_at = ?8, version = ?9 \
                 WHERE id = ?1 AND version = ?10",
                params![
                    entry.id.to_string(),
                    entry.priority.value(),
                    ts(entry.eligible_at),
                    entry.attempts,
                    entry.last_failure,
                    serde_json::to_string(&entry.failure_history)?,
                    entry.claimed_by,
                    entry.claim_expires_at.map(ts),
                    i64::try_from(entry.version)?,
                    i64::try_from(expected_version)?,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn extend_claim(
        &self,
        id: JobId,
        worker_id: &str,
        until: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let worker_id = worker_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE jobs SET claim_expires_at = ?3 WHERE id = ?1 AND claimed_by = ?2",
                params![id.to_string(), worker_id, ts(until)],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn delete(&self, id: JobId) -> anyhow::Result<bool> {
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])? > 0)
        })
        .await
    }

    async fn query_eligible(
        &self,
        now: DateTime<Utc>,
        excluded: &HashSet<JobKind>,
        limit: usize,
    ) -> anyhow::Result<Vec<ScheduledJobEntry>> {
        let excluded: HashSet<String> =
            excluded.iter().map(|kind| kind.as_str().to_string()).collect();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM jobs \
                 WHERE claimed_by IS NULL AND eligible_at <= ?1 \
                 ORDER BY priority DESC, submitted_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![ts(now)], EntryRow::read)?;

            let mut eligible = Vec::new();
            for row in rows {
                let row = row?;
                if excluded.contains(&row.kind) {
                    continue;
                }
                eligible.push(row.into_entry()?);
                if eligible.len() >= limit {
                    break;
                }
            }
            Ok(eligible)
        })
        .await
    }

    async fn expired_claims(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledJobEntry>> {
        self.with_conn(move |conn| {
            query_entries(
                conn,
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM jobs \
                     WHERE claimed_by IS NOT NULL AND claim_expires_at IS NOT NULL \
                     AND claim_expires_at < ?1"
                ),
                params![ts(now)],
            )
        })
        .await
    }

    async fn active_entries(&self) -> anyhow::Result<Vec<ScheduledJobEntry>> {
        self.with_conn(|conn| {
            query_entries(conn, &format!("SELECT {ENTRY_COLUMNS} FROM jobs"), [])
        })
        .await
    }

    async fn archive(
        &self,
        record: &ArchivedJobRecord,
        expected_version: u64,
    ) -> anyhow::Result<bool> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM jobs WHERE id = ?1 AND version = ?2",
                params![record.id.to_string(), i64::try_from(expected_version)?],
            )?;
            if removed == 0 {
                return Ok(false);
            }
            tx.execute(
                "INSERT OR REPLACE INTO job_archive (id, identity_key, job_kind, input, \
                 priority, outcome, attempts, reason, failure_history, finished_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id.to_string(),
                    record.identity_key,
                    record.kind.as_str(),
                    serde_json::to_string(&record.input)?,
                    record.priority.value(),
                    record.outcome.as_str(),
                    record.attempts,
                    record.reason,
                    serde_json::to_string(&record.failure_history)?,
                    ts(record.finished_at),
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn archived(&self, id: JobId) -> anyhow::Result<Option<ArchivedJobRecord>> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ARCHIVE_COLUMNS} FROM job_archive WHERE id = ?1"),
                params![id.to_string()],
                ArchiveRow::read,
            )
            .optional()?
            .map(ArchiveRow::into_record)
            .transpose()
        })
        .await
    }

    async fn last_success(&self, identity_key: &str) -> anyhow::Result<Option<ArchivedJobRecord>> {
        let identity_key = identity_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {ARCHIVE_COLUMNS} FROM job_archive \
                     WHERE identity_key = ?1 AND outcome = 'succeeded' \
                     ORDER BY finished_at DESC LIMIT 1"
                ),
                params![identity_key],
                ArchiveRow::read,
            )
            .optional()?
            .map(ArchiveRow::into_record)
            .transpose()
        })
        .await
    }

    async fn failed(&self) -> anyhow::Result<Vec<ArchivedJobRecord>> {
        self.with_conn(|conn| {
            query_records(
                conn,
                &format!(
                    "SELECT {ARCHIVE_COLUMNS} FROM job_archive \
                     WHERE outcome = 'failed' ORDER BY finished_at ASC, id ASC"
                ),
                [],
            )
        })
        .await
    }

    async fn clear_failed(&self, id: JobId) -> anyhow::Result<bool> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM job_archive WHERE id = ?1 AND outcome = 'failed'",
                params![id.to_string()],
            )? > 0)
        })
        .await
    }

    async fn is_paused(&self) -> anyhow::Result<bool> {
        self.with_conn(|conn| {
            let enabled: Option<bool> = conn
                .query_row(
                    "SELECT enabled FROM scheduler_flags WHERE name = 'paused'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(enabled.unwrap_or(false))
        })
        .await
    }

    async fn set_paused(&self, paused: bool) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO scheduler_flags (name, enabled) VALUES ('paused', ?1) \
                 ON CONFLICT (name) DO UPDATE SET enabled = excluded.enabled",
                params![paused],
            )?;
            Ok(())
        })
        .await
    }

    async fn prune_archive(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        self.with_conn(move |conn| {
            let pruned = conn.execute(
                "DELETE FROM job_archive \
                 WHERE outcome IN ('succeeded', 'cancelled') AND finished_at < ?1",
                params![ts(before)],
            )?;
            Ok(pruned as u64)
        })
        .await
    }
}

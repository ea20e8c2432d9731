use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::job::{JobId, JobInput, JobKind, Priority};
use crate::lock::LockKind;
use crate::store::{
    ArchiveOutcome, ArchivedJobRecord, FailureRecord, JobStore, ScheduledJobEntry,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS anisync_jobs (
    id UUID PRIMARY KEY,
    identity_key TEXT NOT NULL,
    job_kind TEXT NOT NULL,
    input JSONB NOT NULL,
    priority INTEGER NOT NULL,
    submitted_at TIMESTAMPTZ NOT NULL,
    eligible_at TIMESTAMPTZ NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_failure TEXT,
    failure_history JSONB NOT NULL DEFAULT '[]'::jsonb,
    claimed_by TEXT,
    claim_expires_at TIMESTAMPTZ,
    version BIGINT NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS anisync_jobs_identity_key
    ON anisync_jobs (identity_key);
CREATE INDEX IF NOT EXISTS anisync_jobs_eligible
    ON anisync_jobs (priority DESC, submitted_at, id)
    WHERE claimed_by IS NULL;
CREATE TABLE IF NOT EXISTS anisync_job_archive (
    id UUID PRIMARY KEY,
    identity_key TEXT NOT NULL,
    job_kind TEXT NOT NULL,
    input JSONB NOT NULL,
    priority INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    reason TEXT,
    failure_history JSONB NOT NULL,
    finished_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS anisync_job_archive_key
    ON anisync_job_archive (identity_key, outcome, finished_at DESC);
CREATE TABLE IF NOT EXISTS anisync_scheduler_flags (
    name TEXT PRIMARY KEY,
    enabled BOOLEAN NOT NULL
);
"#;

const ENTRY_COLUMNS: &str = "id, identity_key, job_kind, input, priority, submitted_at, \
     eligible_at, attempts, last_failure, failure_history, claimed_by, claim_expires_at, version";

const ARCHIVE_COLUMNS: &str =
    "id, identity_key, job_kind, input, priority, outcome, attempts, reason, failure_history, finished_at";

/// PostgreSQL-backed job store.
///
/// Safe to share between processes: every state change is a conditional
/// update on the `version` column, so it pairs with [`LockKind::Noop`].
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool from the persistence settings and creates the tables.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await
            .context("failed to connect to postgres")?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Creates the tables and indexes if they do not exist.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to create job tables")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn entry_from_row(row: &PgRow) -> anyhow::Result<ScheduledJobEntry> {
    let input: serde_json::Value = row.try_get("input")?;
    let history: serde_json::Value = row.try_get("failure_history")?;
    let attempts: i32 = row.try_get("attempts")?;
    let version: i64 = row.try_get("version")?;

    Ok(ScheduledJobEntry {
        id: JobId(row.try_get::<Uuid, _>("id")?),
        identity_key: row.try_get("identity_key")?,
        kind: JobKind::new(row.try_get::<String, _>("job_kind")?),
        input: serde_json::from_value::<JobInput>(input)?,
        priority: Priority::new(row.try_get("priority")?),
        submitted_at: row.try_get("submitted_at")?,
        eligible_at: row.try_get("eligible_at")?,
        attempts: u32::try_from(attempts)?,
        last_failure: row.try_get("last_failure")?,
        failure_history: serde_json::from_value::<Vec<FailureRecord>>(history)?,
        claimed_by: row.try_get("claimed_by")?,
        claim_expires_at: row.try_get("claim_expires_at")?,
        version: u64::try_from(version)?,
    })
}

fn record_from_row(row: &PgRow) -> anyhow::Result<ArchivedJobRecord> {
    let input: serde_json::Value = row.try_get("input")?;
    let history: serde_json::Value = row.try_get("failure_history")?;
    let outcome: String = row.try_get("outcome")?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(ArchivedJobRecord {
        id: JobId(row.try_get::<Uuid, _>("id")?),
        identity_key: row.try_get("identity_key")?,
        kind: JobKind::new(row.try_get::<String, _>("job_kind")?),
        input: serde_json::from_value::<JobInput>(input)?,
        priority: Priority::new(row.try_get("priority")?),
        outcome: ArchiveOutcome::parse(&outcome)
            .ok_or_else(|| anyhow::anyhow!("invalid archive outcome: {outcome}"))?,
        attempts: u32::try_from(attempts)?,
        reason: row.try_get("reason")?,
        failure_history: serde_json::from_value::<Vec<FailureRecord>>(history)?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn to_i32(value: u32) -> anyhow::Result<i32> {
    i32::try_from(value).context("attempt count out of range")
}

fn to_i64(value: u64) -> anyhow::Result<i64> {
    i64::try_from(value).context("version out of range")
}

#[async_trait]
impl JobStore for PostgresJobStore {
    fn lock_kind(&self) -> LockKind {
        LockKind::Noop
    }

    async fn insert(&self, entry: &ScheduledJobEntry) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO anisync_jobs (
                id, identity_key, job_kind, input, priority, submitted_at, eligible_at,
                attempts, last_failure, failure_history, claimed_by, claim_expires_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id.0)
        .bind(&entry.identity_key)
        .bind(entry.kind.as_str())
        .bind(serde_json::to_value(&entry.input)?)
        .bind(entry.priority.value())
        .bind(entry.submitted_at)
        .bind(entry.eligible_at)
        .bind(to_i32(entry.attempts)?)
        .bind(&entry.last_failure)
        .bind(serde_json::to_value(&entry.failure_history)?)
        .bind(&entry.claimed_by)
        .bind(entry.claim_expires_at)
        .bind(to_i64(entry.version)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some("23505") =>
            {
                Err(anyhow::anyhow!(
                    "an active job with key {} already exists",
                    entry.identity_key
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<ScheduledJobEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM anisync_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn find_active_by_key(
        &self,
        identity_key: &str,
    ) -> anyhow::Result<Option<ScheduledJobEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM anisync_jobs WHERE identity_key = $1"
        ))
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn update(
        &self,
        entry: &ScheduledJobEntry,
        expected_version: u64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE anisync_jobs
            SET priority = $2,
                eligible_at = $3,
                attempts = $4,
                last_failure = $5,
                failure_history = $6,
                claimed_by = $7,
                claim_expires_at = $8,
                version = $9
            WHERE id = $1
              AND version = $10
            "#,
        )
        .bind(entry.id.0)
        .bind(entry.priority.value())
        .bind(entry.eligible_at)
        .bind(to_i32(entry.attempts)?)
        .bind(&entry.last_failure)
        .bind(serde_json::to_value(&entry.failure_history)?)
        .bind(&entry.claimed_by)
        .bind(entry.claim_expires_at)
        .bind(to_i64(entry.version)?)
        .bind(to_i64(expected_version)?)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn extend_claim(
        &self,
        id: JobId,
        worker_id: &str,
        until: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE anisync_jobs
            SET claim_expires_at = $3
            WHERE id = $1
              AND claimed_by = $2
            "#,
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(until)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn delete(&self, id: JobId) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM anisync_jobs WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn query_eligible(
        &self,
        now: DateTime<Utc>,
        excluded: &HashSet<JobKind>,
        limit: usize,
    ) -> anyhow::Result<Vec<ScheduledJobEntry>> {
        let excluded: Vec<String> = excluded.iter().map(|kind| kind.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM anisync_jobs
            WHERE claimed_by IS NULL
              AND eligible_at <= $1
              AND NOT (job_kind = ANY($2))
            ORDER BY priority DESC, submitted_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(now)
        .bind(&excluded)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn expired_claims(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledJobEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM anisync_jobs
            WHERE claimed_by IS NOT NULL
              AND claim_expires_at IS NOT NULL
              AND claim_expires_at < $1
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn active_entries(&self) -> anyhow::Result<Vec<ScheduledJobEntry>> {
        let rows = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM anisync_jobs"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn archive(
        &self,
        record: &ArchivedJobRecord,
        expected_version: u64,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM anisync_jobs WHERE id = $1 AND version = $2")
            .bind(record.id.0)
            .bind(to_i64(expected_version)?)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() == 0 {
            drop(tx);
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO anisync_job_archive (
                id, identity_key, job_kind, input, priority, outcome, attempts,
                reason, failure_history, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id.0)
        .bind(&record.identity_key)
        .bind(record.kind.as_str())
        .bind(serde_json::to_value(&record.input)?)
        .bind(record.priority.value())
        .bind(record.outcome.as_str())
        .bind(to_i32(record.attempts)?)
        .bind(&record.reason)
        .bind(serde_json::to_value(&record.failure_history)?)
        .bind(record.finished_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(job_id = %record.id, outcome = record.outcome.as_str(), "archived job");
        Ok(true)
    }

    async fn archived(&self, id: JobId) -> anyhow::Result<Option<ArchivedJobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM anisync_job_archive WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn last_success(&self, identity_key: &str) -> anyhow::Result<Option<ArchivedJobRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {ARCHIVE_COLUMNS}
            FROM anisync_job_archive
            WHERE identity_key = $1
              AND outcome = 'succeeded'
            ORDER BY finished_at DESC
            LIMIT 1
            "#
        ))
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn failed(&self) -> anyhow::Result<Vec<ArchivedJobRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ARCHIVE_COLUMNS}
            FROM anisync_job_archive
            WHERE outcome = 'failed'
            ORDER BY finished_at ASC, id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn clear_failed(&self, id: JobId) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM anisync_job_archive WHERE id = $1 AND outcome = 'failed'")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn is_paused(&self) -> anyhow::Result<bool> {
        let enabled: Option<bool> = sqlx::query_scalar(
            "SELECT enabled FROM anisync_scheduler_flags WHERE name = 'paused'",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(enabled.unwrap_or(false))
    }

    async fn set_paused(&self, paused: bool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO anisync_scheduler_flags (name, enabled) VALUES ('paused', $1)
            ON CONFLICT (name) DO UPDATE SET enabled = EXCLUDED.enabled
            "#,
        )
        .bind(paused)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_archive(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM anisync_job_archive
            WHERE outcome IN ('succeeded', 'cancelled')
              AND finished_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

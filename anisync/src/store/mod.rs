use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobInput, JobKind, JobState, Priority, Submission};
use crate::lock::LockKind;

/// In-memory store used by tests and single-process deployments.
pub mod memory;

pub use memory::MemoryJobStore;

/// One failed attempt in an entry's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub attempt: u32,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Active, persisted job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobEntry {
    pub id: JobId,
    pub identity_key: String,
    pub kind: JobKind,
    pub input: JobInput,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub eligible_at: DateTime<Utc>,
    /// Failed executions so far. Deferrals do not count.
    pub attempts: u32,
    pub last_failure: Option<String>,
    pub failure_history: Vec<FailureRecord>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// Bumped on every state change. Conditional updates compare against it.
    pub version: u64,
}

impl ScheduledJobEntry {
    pub fn new(identity_key: String, submission: Submission, now: DateTime<Utc>) -> Self {
        let eligible_at = submission.not_before.map_or(now, |at| at.max(now));
        Self {
            id: JobId::new(),
            identity_key,
            kind: submission.kind,
            input: submission.input,
            priority: submission.priority,
            submitted_at: now,
            eligible_at,
            attempts: 0,
            last_failure: None,
            failure_history: Vec::new(),
            claimed_by: None,
            claim_expires_at: None,
            version: 0,
        }
    }

    pub fn is_dispatched(&self) -> bool {
        self.claimed_by.is_some()
    }

    /// State derived from timestamps and claim ownership alone. The
    /// scheduler additionally reports `Pending` while a precondition blocks.
    pub fn state_at(&self, now: DateTime<Utc>) -> JobState {
        if self.is_dispatched() {
            JobState::Dispatched
        } else if self.eligible_at > now {
            JobState::Pending
        } else {
            JobState::Eligible
        }
    }

    pub(crate) fn record_failure(&mut self, reason: String, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.failure_history.push(FailureRecord {
            attempt: self.attempts,
            reason: reason.clone(),
            at: now,
        });
        self.last_failure = Some(reason);
    }

    pub(crate) fn release_claim(&mut self) {
        self.claimed_by = None;
        self.claim_expires_at = None;
    }
}

/// How an archived job ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Succeeded,
    Cancelled,
    Failed,
}

impl ArchiveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveOutcome::Succeeded => "succeeded",
            ArchiveOutcome::Cancelled => "cancelled",
            ArchiveOutcome::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "succeeded" => Some(ArchiveOutcome::Succeeded),
            "cancelled" => Some(ArchiveOutcome::Cancelled),
            "failed" => Some(ArchiveOutcome::Failed),
            _ => None,
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            ArchiveOutcome::Succeeded => JobState::Succeeded,
            ArchiveOutcome::Cancelled => JobState::Cancelled,
            ArchiveOutcome::Failed => JobState::FailedTerminal,
        }
    }
}

/// Terminal record of a job that left the active pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchivedJobRecord {
    pub id: JobId,
    pub identity_key: String,
    pub kind: JobKind,
    pub input: JobInput,
    pub priority: Priority,
    pub outcome: ArchiveOutcome,
    pub attempts: u32,
    pub reason: Option<String>,
    pub failure_history: Vec<FailureRecord>,
    pub finished_at: DateTime<Utc>,
}

impl ArchivedJobRecord {
    pub fn from_entry(
        entry: ScheduledJobEntry,
        outcome: ArchiveOutcome,
        reason: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: entry.id,
            identity_key: entry.identity_key,
            kind: entry.kind,
            input: entry.input,
            priority: entry.priority,
            outcome,
            attempts: entry.attempts,
            reason: reason.or(entry.last_failure),
            failure_history: entry.failure_history,
            finished_at,
        }
    }
}

/// Persistence boundary of the scheduler.
///
/// Mutations that change an entry's state go through [`JobStore::update`],
/// which only applies when the stored version still matches. This is what
/// keeps concurrent claimers honest on stores that use [`LockKind::Noop`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Lock the scheduler should serialize mutations with.
    fn lock_kind(&self) -> LockKind {
        LockKind::Process
    }

    async fn insert(&self, entry: &ScheduledJobEntry) -> anyhow::Result<()>;

    async fn get(&self, id: JobId) -> anyhow::Result<Option<ScheduledJobEntry>>;

    async fn find_active_by_key(
        &self,
        identity_key: &str,
    ) -> anyhow::Result<Option<ScheduledJobEntry>>;

    /// Writes `entry` if the stored version equals `expected_version`.
    /// The caller has already set `entry.version` to the new value.
    async fn update(
        &self,
        entry: &ScheduledJobEntry,
        expected_version: u64,
    ) -> anyhow::Result<bool>;

    /// Pushes the claim expiry of a dispatched entry forward without
    /// touching its version. Returns false if `worker_id` lost the claim.
    async fn extend_claim(
        &self,
        id: JobId,
        worker_id: &str,
        until: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn delete(&self, id: JobId) -> anyhow::Result<bool>;

    /// Unclaimed entries with `eligible_at <= now` whose kind is not
    /// excluded, ordered by priority desc, submitted_at asc, id asc.
    async fn query_eligible(
        &self,
        now: DateTime<Utc>,
        excluded: &HashSet<JobKind>,
        limit: usize,
    ) -> anyhow::Result<Vec<ScheduledJobEntry>>;

    /// Dispatched entries whose claim expired before `now`.
    async fn expired_claims(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledJobEntry>>;

    async fn active_entries(&self) -> anyhow::Result<Vec<ScheduledJobEntry>>;

    /// Removes the active entry and stores the terminal record atomically.
    /// Returns false when the entry was already gone or its version moved.
    async fn archive(
        &self,
        record: &ArchivedJobRecord,
        expected_version: u64,
    ) -> anyhow::Result<bool>;

    async fn archived(&self, id: JobId) -> anyhow::Result<Option<ArchivedJobRecord>>;

    /// Most recent successful record for the key.
    async fn last_success(&self, identity_key: &str) -> anyhow::Result<Option<ArchivedJobRecord>>;

    async fn failed(&self) -> anyhow::Result<Vec<ArchivedJobRecord>>;

    async fn clear_failed(&self, id: JobId) -> anyhow::Result<bool>;

    /// Deletes succeeded and cancelled records finished before `before`.
    async fn prune_archive(&self, before: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Whether claiming is paused. Durable stores keep the flag across
    /// restarts.
    async fn is_paused(&self) -> anyhow::Result<bool>;

    async fn set_paused(&self, paused: bool) -> anyhow::Result<()>;
}

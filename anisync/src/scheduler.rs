//! Gated, concurrency-aware job scheduler.
//!
//! Entries live in a [`JobStore`]. Every mutation runs under the
//! [`CLAIM_LOCK`] execution lock and goes through a version-checked update,
//! so stores with a no-op lock stay correct when several processes claim
//! from the same tables. In-flight counts live in a process-local
//! [`SlotTable`] and are released when a [`ClaimedJob`] is finished or
//! dropped.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::Instrument;

use crate::clock::{Clock, to_time_delta};
use crate::config::SchedulerSettings;
use crate::descriptor::{JobDescriptor, JobExecutor, JobRegistry};
use crate::error::SchedulerError;
use crate::events::{InProcEventBus, JobEvent, JobEventPayload};
use crate::job::{
    JobId, JobInput, JobKind, JobOutcome, JobState, JobStatus, Priority, SubmitOutcome,
    Submission,
};
use crate::lock::{ExecutionLock, ExecutionLockGuard};
use crate::precondition::PreconditionGate;
use crate::retry::{RetryDecision, RetryPolicy, decide};
use crate::runtime::CancellationToken;
use crate::slots::{SlotPermit, SlotTable};
use crate::store::{ArchiveOutcome, ArchivedJobRecord, JobStore, ScheduledJobEntry};
use crate::telemetry;

/// Name of the execution lock that serialises scheduler mutations.
pub const CLAIM_LOCK: &str = "anisync.claim";

/// Scheduler tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub retry: RetryPolicy,
    /// How long a claim stays valid without renewal.
    pub claim_ttl: Duration,
    /// Resubmissions of a key that succeeded within this window are
    /// answered with `AlreadySucceeded`. Zero disables the check.
    pub success_dedupe_window: Duration,
    /// Eligible entries fetched per claim attempt.
    pub claim_batch: usize,
    pub archive_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            retry: RetryPolicy::from(settings),
            claim_ttl: Duration::from_secs(settings.claim_ttl_secs),
            success_dedupe_window: Duration::from_secs(settings.success_dedupe_window_secs),
            claim_batch: settings.claim_batch.max(1),
            archive_retention: Duration::from_secs(settings.archive_retention_secs),
        }
    }
}

/// A job handed to a worker.
///
/// Holds the concurrency slot; dropping it without calling
/// [`Scheduler::finish`] frees the slot and leaves the entry to claim
/// recovery.
pub struct ClaimedJob {
    pub entry: ScheduledJobEntry,
    pub descriptor: Arc<JobDescriptor>,
    pub executor: Arc<dyn JobExecutor>,
    pub worker_id: String,
    pub cancel: CancellationToken,
    permit: SlotPermit,
}

impl ClaimedJob {
    pub fn id(&self) -> JobId {
        self.entry.id
    }

    pub fn kind(&self) -> &JobKind {
        &self.entry.kind
    }

    pub fn input(&self) -> &JobInput {
        &self.entry.input
    }

    pub fn permit(&self) -> &SlotPermit {
        &self.permit
    }
}

impl fmt::Debug for ClaimedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedJob")
            .field("id", &self.entry.id)
            .field("kind", &self.entry.kind)
            .field("attempts", &self.entry.attempts)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// Per-kind counts in a [`SchedulerSnapshot`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KindSnapshot {
    /// Waiting for their eligible time (backoff, deferral, `not_before`).
    pub pending: usize,
    pub eligible: usize,
    /// Eligible but held back by a failing precondition.
    pub blocked: usize,
    pub dispatched: usize,
    /// Slots held by this process.
    pub in_flight: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SchedulerSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub paused: bool,
    pub kinds: BTreeMap<JobKind, KindSnapshot>,
    pub failed: usize,
}

impl SchedulerSnapshot {
    pub fn kind(&self, kind: &JobKind) -> KindSnapshot {
        self.kinds.get(kind).cloned().unwrap_or_default()
    }

    pub fn active(&self) -> usize {
        self.kinds
            .values()
            .map(|k| k.pending + k.eligible + k.blocked + k.dispatched)
            .sum()
    }
}

/// One active entry in a [`QueueSummary`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: JobId,
    pub kind: JobKind,
    pub identity_key: String,
    pub priority: Priority,
    /// `Dispatched`, `Eligible` or `Pending`.
    pub state: JobState,
    /// Eligible, but its kind is gated or has no free slot.
    pub blocked: bool,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub eligible_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
}

/// A page of the active queue. Dispatched entries come first, the rest in
/// claim order.
#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueSummary {
    /// Matching entries before paging.
    pub total: usize,
    pub items: Vec<QueueItem>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobStore>,
    lock: Arc<dyn ExecutionLock>,
    gate: PreconditionGate,
    slots: Arc<SlotTable>,
    clock: Arc<dyn Clock>,
    events: InProcEventBus,
    wake: Notify,
    /// Claims executing in this process: claim version and cancel handle.
    running: Mutex<HashMap<JobId, (u64, CancellationToken)>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Scheduler");
        debug.field("config", &self.config);
        debug.field("kinds", &self.registry.len());
        debug.field("lock", &self.lock);
        debug.field("slots", &self.slots);
        match self.running.try_lock() {
            Some(running) => {
                debug.field("running", &running.len());
            }
            None => {
                debug.field("running", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        lock: Arc<dyn ExecutionLock>,
        clock: Arc<dyn Clock>,
        events: InProcEventBus,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            lock,
            gate: PreconditionGate::new(Arc::clone(&clock)),
            slots: SlotTable::new(),
            clock,
            events,
            wake: Notify::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn slots(&self) -> &Arc<SlotTable> {
        &self.slots
    }

    pub fn events(&self) -> &InProcEventBus {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Wakes workers waiting in [`wait_for_work`](Self::wait_for_work).
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Returns after a wake-up or after `timeout`, whichever comes first.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.wake.notified()).await;
    }

    pub async fn submit(
        &self,
        kind: impl Into<JobKind>,
        input: JobInput,
        priority: Priority,
    ) -> Result<SubmitOutcome, SchedulerError> {
        self.submit_with(Submission::new(kind, input).with_priority(priority))
            .await
    }

    /// Stores a submission unless an identical job is already known.
    ///
    /// A waiting duplicate takes the higher of both priorities and the
    /// existing id is returned as `Merged`; a running duplicate is reported
    /// as `Duplicate`.
    pub async fn submit_with(&self, submission: Submission) -> Result<SubmitOutcome, SchedulerError> {
        let span = telemetry::job_submit_span(submission.kind.as_str(), submission.priority.value());
        let kind = submission.kind.clone();
        let outcome = self.submit_inner(submission).instrument(span).await?;

        let resolution = match outcome {
            SubmitOutcome::Created(_) => "created",
            SubmitOutcome::Merged(_) => "merged",
            SubmitOutcome::Duplicate(_) => "duplicate",
            SubmitOutcome::AlreadySucceeded(_) => "already_succeeded",
        };
        telemetry::record_job_submitted(kind.as_str(), resolution);
        if outcome.is_created() {
            self.wake();
        }
        Ok(outcome)
    }

    async fn submit_inner(&self, submission: Submission) -> Result<SubmitOutcome, SchedulerError> {
        let descriptor = self
            .registry
            .descriptor(&submission.kind)
            .ok_or_else(|| SchedulerError::UnknownJobKind(submission.kind.clone()))?;
        let identity_key = descriptor.identity_key(&submission.input)?;

        let _guard = self.acquire_lock().await?;
        let now = self.clock.now();

        while let Some(mut existing) = self.store.find_active_by_key(&identity_key).await? {
            if existing.is_dispatched() {
                tracing::debug!(job_id = %existing.id, key = %identity_key, "identical job is running");
                return Ok(SubmitOutcome::Duplicate(existing.id));
            }
            if submission.priority <= existing.priority {
                return Ok(SubmitOutcome::Merged(existing.id));
            }

            let expected = existing.version;
            existing.priority = submission.priority;
            existing.version = expected + 1;
            if self.store.update(&existing, expected).await? {
                tracing::debug!(job_id = %existing.id, priority = %existing.priority, "raised priority of waiting duplicate");
                self.publish(
                    now,
                    JobEventPayload::Merged {
                        job_id: existing.id,
                        kind: existing.kind.clone(),
                        priority: existing.priority,
                    },
                );
                return Ok(SubmitOutcome::Merged(existing.id));
            }
            // Lost a race against a claim from another process.
        }

        if !self.config.success_dedupe_window.is_zero()
            && let Some(record) = self.store.last_success(&identity_key).await?
            && record.finished_at + to_time_delta(self.config.success_dedupe_window) > now
        {
            return Ok(SubmitOutcome::AlreadySucceeded(record.id));
        }

        let entry = ScheduledJobEntry::new(identity_key, submission, now);
        self.store.insert(&entry).await?;
        tracing::debug!(job_id = %entry.id, key = %entry.identity_key, "job submitted");
        self.publish(
            now,
            JobEventPayload::Submitted {
                job_id: entry.id,
                kind: entry.kind.clone(),
                priority: entry.priority,
            },
        );
        Ok(SubmitOutcome::Created(entry.id))
    }

    /// Cancels a job.
    ///
    /// Waiting entries are archived immediately. Entries running in this
    /// process get their cancellation token signalled and end when the
    /// executor returns. Returns `false` for unknown, finished or remotely
    /// running jobs.
    pub async fn cancel(&self, id: JobId) -> Result<bool, SchedulerError> {
        let _guard = self.acquire_lock().await?;
        let Some(entry) = self.store.get(id).await? else {
            return Ok(false);
        };

        if entry.is_dispatched() {
            return Ok(match self.running.lock().get(&id) {
                Some((_, token)) => {
                    token.cancel();
                    true
                }
                None => {
                    tracing::debug!(job_id = %id, worker = ?entry.claimed_by, "cannot cancel a job running elsewhere");
                    false
                }
            });
        }

        let now = self.clock.now();
        let kind = entry.kind.clone();
        if !self
            .archive_entry(entry, ArchiveOutcome::Cancelled, None, now)
            .await?
        {
            return Ok(false);
        }
        self.publish(now, JobEventPayload::Cancelled { job_id: id, kind });
        Ok(true)
    }

    /// Current state of an active or archived job.
    pub async fn status(&self, id: JobId) -> Result<Option<JobStatus>, SchedulerError> {
        let now = self.clock.now();
        if let Some(entry) = self.store.get(id).await? {
            let mut state = entry.state_at(now);
            if state == JobState::Eligible
                && let Some(descriptor) = self.registry.descriptor(&entry.kind)
                && !self.gate.evaluate_at(descriptor, now).can_run
            {
                state = JobState::Pending;
            }
            return Ok(Some(JobStatus {
                id: entry.id,
                kind: entry.kind,
                identity_key: entry.identity_key,
                state,
                priority: entry.priority,
                attempts: entry.attempts,
                eligible_at: Some(entry.eligible_at),
                last_failure: entry.last_failure,
            }));
        }

        Ok(self.store.archived(id).await?.map(|record| JobStatus {
            id: record.id,
            kind: record.kind,
            identity_key: record.identity_key,
            state: record.outcome.state(),
            priority: record.priority,
            attempts: record.attempts,
            eligible_at: None,
            last_failure: record.reason,
        }))
    }

    /// Claims the best eligible entry whose kind has a free slot and whose
    /// preconditions pass.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>, SchedulerError> {
        let span = telemetry::job_claim_span(worker_id);
        self.claim_inner(worker_id).instrument(span).await
    }

    async fn claim_inner(&self, worker_id: &str) -> Result<Option<ClaimedJob>, SchedulerError> {
        let _guard = self.acquire_lock().await?;
        if self.store.is_paused().await? {
            return Ok(None);
        }
        let now = self.clock.now();

        let mut excluded = self.slots.saturated_kinds(&self.registry);
        for descriptor in self.registry.descriptors() {
            if excluded.contains(descriptor.kind()) {
                continue;
            }
            let decision = self.gate.evaluate_at(descriptor, now);
            if !decision.can_run {
                tracing::trace!(kind = %descriptor.kind(), blocked_by = ?decision.blocked_by, "kind gated");
                excluded.insert(descriptor.kind().clone());
            }
        }
        if excluded.len() >= self.registry.len() {
            return Ok(None);
        }

        let candidates = self
            .store
            .query_eligible(now, &excluded, self.config.claim_batch)
            .await?;

        for mut entry in candidates {
            let Some(registered) = self.registry.get(&entry.kind) else {
                self.fail_unregistered(entry, now).await?;
                continue;
            };
            let Some(permit) = self.slots.try_claim(&registered.descriptor) else {
                continue;
            };

            let expected = entry.version;
            entry.version = expected + 1;
            entry.claimed_by = Some(worker_id.to_string());
            entry.claim_expires_at = Some(now + to_time_delta(self.config.claim_ttl));
            if !self.store.update(&entry, expected).await? {
                tracing::debug!(job_id = %entry.id, "entry changed while claiming");
                continue;
            }

            if let Err(err) = self.slots.verify(&registered.descriptor) {
                tracing::error!(error = %err, job_id = %entry.id, "concurrency ceiling exceeded");
            }

            let cancel = CancellationToken::new();
            self.running
                .lock()
                .insert(entry.id, (entry.version, cancel.clone()));
            telemetry::set_in_flight(entry.kind.as_str(), self.slots.in_flight(&entry.kind));
            self.publish(
                now,
                JobEventPayload::Dispatched {
                    job_id: entry.id,
                    kind: entry.kind.clone(),
                    worker_id: worker_id.to_string(),
                    attempts: entry.attempts,
                },
            );

            return Ok(Some(ClaimedJob {
                entry,
                descriptor: Arc::clone(&registered.descriptor),
                executor: Arc::clone(&registered.executor),
                worker_id: worker_id.to_string(),
                cancel,
                permit,
            }));
        }

        Ok(None)
    }

    async fn fail_unregistered(&self, entry: ScheduledJobEntry, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let id = entry.id;
        let kind = entry.kind.clone();
        let reason = format!("job kind `{kind}` is not registered");
        tracing::warn!(job_id = %id, kind = %kind, "failing entry of unregistered kind");
        let attempts = entry.attempts;
        if self
            .archive_entry(entry, ArchiveOutcome::Failed, Some(reason.clone()), now)
            .await?
        {
            self.publish(
                now,
                JobEventPayload::Failed {
                    job_id: id,
                    kind,
                    attempts,
                    reason,
                },
            );
        }
        Ok(())
    }

    /// Applies an executor outcome and frees the slot.
    ///
    /// Returns the state the entry ended up in. An outcome for a claim that
    /// was lost in the meantime (expired and recovered) is discarded.
    pub async fn finish(
        &self,
        claimed: ClaimedJob,
        outcome: JobOutcome,
    ) -> Result<JobState, SchedulerError> {
        let span = telemetry::job_complete_span(
            claimed.entry.id.to_string(),
            claimed.entry.kind.as_str(),
            outcome.label(),
        );
        let kind = claimed.entry.kind.clone();
        let label = outcome.label();

        let state = self.finish_inner(claimed, outcome).instrument(span).await?;

        telemetry::set_in_flight(kind.as_str(), self.slots.in_flight(&kind));
        telemetry::record_job_completed(kind.as_str(), label);
        self.wake();
        Ok(state)
    }

    async fn finish_inner(
        &self,
        claimed: ClaimedJob,
        outcome: JobOutcome,
    ) -> Result<JobState, SchedulerError> {
        let ClaimedJob {
            entry: claimed_entry,
            worker_id,
            permit,
            ..
        } = claimed;
        let id = claimed_entry.id;

        let _guard = self.acquire_lock().await?;
        let now = self.clock.now();
        {
            let mut running = self.running.lock();
            if running
                .get(&id)
                .is_some_and(|(version, _)| *version == claimed_entry.version)
            {
                running.remove(&id);
            }
        }

        let Some(mut entry) = self.store.get(id).await? else {
            tracing::warn!(job_id = %id, "finished job is no longer active");
            drop(permit);
            return Ok(self
                .store
                .archived(id)
                .await?
                .map_or(JobState::Cancelled, |record| record.outcome.state()));
        };
        // The version written by the claim identifies it; a recovered and
        // re-claimed entry has moved on even when the worker id matches.
        if entry.version != claimed_entry.version
            || entry.claimed_by.as_deref() != Some(worker_id.as_str())
        {
            tracing::warn!(
                job_id = %id,
                worker_id = %worker_id,
                owner = ?entry.claimed_by,
                claim_version = claimed_entry.version,
                version = entry.version,
                "claim was lost; discarding outcome"
            );
            drop(permit);
            return Ok(entry.state_at(now));
        }

        let kind = entry.kind.clone();
        let expected = entry.version;
        let state = match outcome {
            JobOutcome::Success => {
                self.archive_or_warn(entry, ArchiveOutcome::Succeeded, None, now)
                    .await?;
                self.publish(now, JobEventPayload::Succeeded { job_id: id, kind });
                JobState::Succeeded
            }
            JobOutcome::Cancelled => {
                self.archive_or_warn(entry, ArchiveOutcome::Cancelled, None, now)
                    .await?;
                self.publish(now, JobEventPayload::Cancelled { job_id: id, kind });
                JobState::Cancelled
            }
            JobOutcome::Fail { reason } => {
                entry.record_failure(reason.clone(), now);
                let attempts = entry.attempts;
                self.archive_or_warn(entry, ArchiveOutcome::Failed, Some(reason.clone()), now)
                    .await?;
                self.publish(
                    now,
                    JobEventPayload::Failed {
                        job_id: id,
                        kind,
                        attempts,
                        reason,
                    },
                );
                JobState::FailedTerminal
            }
            JobOutcome::Retry { reason, retry_in } => {
                entry.record_failure(reason.clone(), now);
                match decide(entry.attempts, retry_in, &self.config.retry) {
                    RetryDecision::RetryAfter { delay } => {
                        let retry_at = now + to_time_delta(delay);
                        let attempts = entry.attempts;
                        entry.release_claim();
                        entry.eligible_at = retry_at;
                        entry.version = expected + 1;
                        self.update_or_warn(&entry, expected).await?;
                        tracing::info!(job_id = %id, attempts, ?delay, reason = %reason, "job will retry");
                        self.publish(
                            now,
                            JobEventPayload::Retrying {
                                job_id: id,
                                kind,
                                attempts,
                                retry_at,
                                reason,
                            },
                        );
                        JobState::Pending
                    }
                    RetryDecision::Terminal => {
                        let attempts = entry.attempts;
                        tracing::warn!(job_id = %id, attempts, reason = %reason, "retries exhausted");
                        self.archive_or_warn(entry, ArchiveOutcome::Failed, Some(reason.clone()), now)
                            .await?;
                        self.publish(
                            now,
                            JobEventPayload::Failed {
                                job_id: id,
                                kind,
                                attempts,
                                reason,
                            },
                        );
                        JobState::FailedTerminal
                    }
                }
            }
            JobOutcome::Deferred { reason, retry_in } => {
                let retry_at = now + to_time_delta(retry_in);
                entry.release_claim();
                entry.eligible_at = retry_at;
                entry.version = expected + 1;
                self.update_or_warn(&entry, expected).await?;
                tracing::info!(job_id = %id, ?retry_in, reason = %reason, "job deferred");
                self.publish(
                    now,
                    JobEventPayload::Deferred {
                        job_id: id,
                        kind,
                        retry_at,
                        reason,
                    },
                );
                JobState::Pending
            }
        };

        drop(permit);
        Ok(state)
    }

    /// Pushes the claim expiry of a running job forward. Returns `false`
    /// when the claim no longer belongs to `worker_id`.
    pub async fn renew_claim(&self, id: JobId, worker_id: &str) -> Result<bool, SchedulerError> {
        let until = self.clock.now() + to_time_delta(self.config.claim_ttl);
        Ok(self.store.extend_claim(id, worker_id, until).await?)
    }

    /// Returns dispatched entries whose claim expired to pending.
    ///
    /// An expired claim counts as a failed attempt, so a job that keeps
    /// taking its worker down ends up failed instead of looping. Jobs still
    /// running in this process are left alone.
    pub async fn recover_stale_claims(&self) -> Result<usize, SchedulerError> {
        let _guard = self.acquire_lock().await?;
        let now = self.clock.now();
        let expired = self.store.expired_claims(now).await?;

        let mut recovered = 0;
        for mut entry in expired {
            if self.running.lock().contains_key(&entry.id) {
                continue;
            }
            let id = entry.id;
            let kind = entry.kind.clone();
            let worker_id = entry.claimed_by.clone();
            let expected = entry.version;
            let reason = format!(
                "claim held by {} expired",
                worker_id.as_deref().unwrap_or("unknown worker")
            );
            entry.record_failure(reason.clone(), now);
            telemetry::record_claim_expired(kind.as_str());

            let applied = match decide(entry.attempts, None, &self.config.retry) {
                RetryDecision::RetryAfter { delay } => {
                    entry.release_claim();
                    entry.eligible_at = now + to_time_delta(delay);
                    entry.version = expected + 1;
                    self.store.update(&entry, expected).await?
                }
                RetryDecision::Terminal => {
                    let attempts = entry.attempts;
                    let archived = self
                        .archive_entry(entry, ArchiveOutcome::Failed, Some(reason.clone()), now)
                        .await?;
                    if archived {
                        self.publish(
                            now,
                            JobEventPayload::Failed {
                                job_id: id,
                                kind: kind.clone(),
                                attempts,
                                reason,
                            },
                        );
                    }
                    archived
                }
            };

            if applied {
                recovered += 1;
                self.publish(
                    now,
                    JobEventPayload::ClaimExpired {
                        job_id: id,
                        kind,
                        worker_id,
                    },
                );
            }
        }

        if recovered > 0 {
            tracing::info!(recovered, "recovered stale claims");
            self.wake();
        }
        Ok(recovered)
    }

    /// Stops handing out new claims. Running jobs finish normally and
    /// submissions are still accepted. The flag lives in the store.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        let _guard = self.acquire_lock().await?;
        self.store.set_paused(true).await?;
        tracing::info!("scheduler paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SchedulerError> {
        {
            let _guard = self.acquire_lock().await?;
            self.store.set_paused(false).await?;
        }
        tracing::info!("scheduler resumed");
        self.wake();
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, SchedulerError> {
        Ok(self.store.is_paused().await?)
    }

    /// Lists active entries, `offset` and `limit` applied after ordering.
    ///
    /// With `exclude_blocked`, eligible entries whose kind is gated or at
    /// its ceiling are left out.
    pub async fn queue_summary(
        &self,
        limit: usize,
        offset: usize,
        exclude_blocked: bool,
    ) -> Result<QueueSummary, SchedulerError> {
        let now = self.clock.now();
        let mut unavailable = self.slots.saturated_kinds(&self.registry);
        for descriptor in self.registry.descriptors() {
            if !self.gate.evaluate_at(descriptor, now).can_run {
                unavailable.insert(descriptor.kind().clone());
            }
        }

        let mut items: Vec<QueueItem> = self
            .store
            .active_entries()
            .await?
            .into_iter()
            .map(|entry| {
                let state = entry.state_at(now);
                let blocked = state == JobState::Eligible && unavailable.contains(&entry.kind);
                QueueItem {
                    id: entry.id,
                    kind: entry.kind,
                    identity_key: entry.identity_key,
                    priority: entry.priority,
                    state,
                    blocked,
                    attempts: entry.attempts,
                    submitted_at: entry.submitted_at,
                    eligible_at: entry.eligible_at,
                    claimed_by: entry.claimed_by,
                }
            })
            .filter(|item| !(exclude_blocked && item.blocked))
            .collect();

        items.sort_by(|a, b| {
            let running = |item: &QueueItem| item.state != JobState::Dispatched;
            running(a)
                .cmp(&running(b))
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.submitted_at.cmp(&b.submitted_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = items.len();
        let items = items.into_iter().skip(offset).take(limit).collect();
        Ok(QueueSummary { total, items })
    }

    pub async fn failed_jobs(&self) -> Result<Vec<ArchivedJobRecord>, SchedulerError> {
        Ok(self.store.failed().await?)
    }

    pub async fn clear_failed(&self, id: JobId) -> Result<bool, SchedulerError> {
        Ok(self.store.clear_failed(id).await?)
    }

    /// Deletes succeeded and cancelled records older than the retention.
    pub async fn prune_archive(&self) -> Result<u64, SchedulerError> {
        let before = self.clock.now() - to_time_delta(self.config.archive_retention);
        let pruned = self.store.prune_archive(before).await?;
        if pruned > 0 {
            tracing::debug!(pruned, "pruned archived jobs");
        }
        Ok(pruned)
    }

    /// Per-kind view of the active entries.
    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, SchedulerError> {
        let now = self.clock.now();
        let mut kinds: BTreeMap<JobKind, KindSnapshot> = self
            .registry
            .kinds()
            .map(|kind| {
                let snapshot = KindSnapshot {
                    in_flight: self.slots.in_flight(kind),
                    ..KindSnapshot::default()
                };
                (kind.clone(), snapshot)
            })
            .collect();

        let gated: HashMap<&JobKind, bool> = self
            .registry
            .descriptors()
            .map(|descriptor| (descriptor.kind(), !self.gate.evaluate_at(descriptor, now).can_run))
            .collect();

        for entry in self.store.active_entries().await? {
            let blocked = gated.get(&entry.kind).copied().unwrap_or(false);
            let counts = kinds.entry(entry.kind.clone()).or_default();
            match entry.state_at(now) {
                JobState::Pending => counts.pending += 1,
                JobState::Eligible if blocked => counts.blocked += 1,
                JobState::Eligible => counts.eligible += 1,
                JobState::Dispatched => counts.dispatched += 1,
                _ => {}
            }
        }

        for (kind, counts) in &kinds {
            telemetry::set_active_jobs(
                kind.as_str(),
                counts.pending + counts.eligible + counts.blocked + counts.dispatched,
            );
        }

        Ok(SchedulerSnapshot {
            taken_at: Some(now),
            paused: self.store.is_paused().await?,
            kinds,
            failed: self.store.failed().await?.len(),
        })
    }

    async fn acquire_lock(&self) -> Result<ExecutionLockGuard, SchedulerError> {
        ExecutionLockGuard::acquire(&self.lock, CLAIM_LOCK)
            .await?
            .ok_or_else(|| SchedulerError::LockUnavailable {
                name: CLAIM_LOCK.to_string(),
            })
    }

    async fn archive_entry(
        &self,
        entry: ScheduledJobEntry,
        outcome: ArchiveOutcome,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let expected = entry.version;
        let record = ArchivedJobRecord::from_entry(entry, outcome, reason, now);
        Ok(self.store.archive(&record, expected).await?)
    }

    async fn archive_or_warn(
        &self,
        entry: ScheduledJobEntry,
        outcome: ArchiveOutcome,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let id = entry.id;
        if !self.archive_entry(entry, outcome, reason, now).await? {
            tracing::warn!(job_id = %id, outcome = outcome.as_str(), "entry changed before it could be archived");
        }
        Ok(())
    }

    async fn update_or_warn(
        &self,
        entry: &ScheduledJobEntry,
        expected: u64,
    ) -> Result<(), SchedulerError> {
        if !self.store.update(entry, expected).await? {
            tracing::warn!(job_id = %entry.id, "entry changed before its outcome was stored");
        }
        Ok(())
    }

    fn publish(&self, at: DateTime<Utc>, payload: JobEventPayload) {
        self.events.publish(JobEvent::new(at, payload));
    }
}

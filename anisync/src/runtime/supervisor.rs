use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::clock::{Clock, remaining};
use crate::config::SchedulerSettings;
use crate::job::JobOutcome;
use crate::penalty::{PenaltyEvent, PenaltyTracker};
use crate::scheduler::{ClaimedJob, Scheduler, SchedulerConfig};
use crate::telemetry;

use super::worker::WorkerConfig;

/// Configuration for the scheduler runtime.
#[derive(Clone, Debug)]
pub struct SchedulerRuntimeConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Longest a worker idles before polling the store again.
    pub poll_interval_ms: u64,
    /// Interval between housekeeper runs in milliseconds.
    pub housekeeper_interval_ms: u64,
    /// How long shutdown waits for each task.
    pub shutdown_timeout_secs: u64,
    pub scheduler: SchedulerConfig,
}

impl Default for SchedulerRuntimeConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for SchedulerRuntimeConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            workers: settings.workers.max(1),
            poll_interval_ms: settings.poll_interval_ms,
            housekeeper_interval_ms: settings.housekeeper_interval_ms,
            shutdown_timeout_secs: 30,
            scheduler: SchedulerConfig::from(settings),
        }
    }
}

/// Cooperative cancellation signal shared between clones.
///
/// Used both for runtime shutdown and for cancelling a single running job.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    inner: Arc<CancellationTokenInner>,
}

#[derive(Debug)]
struct CancellationTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker pool, housekeeper and penalty watcher around a [`Scheduler`].
pub struct SchedulerRuntime {
    config: SchedulerRuntimeConfig,
    scheduler: Arc<Scheduler>,
    penalties: Option<Arc<PenaltyTracker>>,
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for SchedulerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("SchedulerRuntime")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .field("watches_penalties", &self.penalties.is_some())
            .field("task_count", &task_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl SchedulerRuntime {
    pub fn new(
        config: SchedulerRuntimeConfig,
        scheduler: Arc<Scheduler>,
        penalties: Option<Arc<PenaltyTracker>>,
    ) -> Self {
        Self {
            config,
            scheduler,
            penalties,
            shutdown_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerRuntimeConfig {
        &self.config
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Recovers claims left behind by a previous run, then spawns the
    /// workers and background tasks.
    pub async fn start(&self) -> anyhow::Result<()> {
        let recovered = self.scheduler.recover_stale_claims().await?;
        tracing::info!(
            workers = self.config.workers,
            recovered,
            "starting scheduler runtime"
        );

        self.spawn_worker_pool(self.config.workers).await;
        self.spawn_housekeeper().await;
        if let Some(penalties) = &self.penalties {
            self.spawn_penalty_watcher(Arc::clone(penalties)).await;
        }
        Ok(())
    }

    /// Stops claiming new work and waits for running jobs to finish.
    ///
    /// Running executors are not cancelled; they see the shutdown only
    /// through their own cancellation token if a caller cancels the job.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of scheduler runtime");

        self.shutdown_token.cancel();
        self.scheduler.wake();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => {
                    tracing::warn!("Worker task timed out during shutdown")
                }
            }
        }

        tracing::info!("Scheduler runtime shutdown complete");
        Ok(())
    }

    /// Spawns `parallelism` workers.
    pub async fn spawn_worker_pool(&self, parallelism: usize) {
        let worker_group = format!("anisync-{}", std::process::id());
        let renew_interval = (self.config.scheduler.claim_ttl / 2).max(Duration::from_millis(1));

        for i in 0..parallelism {
            let worker = WorkerConfig::new(format!("{worker_group}-w{i}"))
                .with_poll_interval(self.config.poll_interval_ms)
                .with_renew_interval(renew_interval);
            let scheduler = Arc::clone(&self.scheduler);
            let shutdown = self.shutdown_token.clone();

            let handle = tokio::spawn(async move {
                worker_loop(worker, scheduler, shutdown).await;
            });

            self.handles.lock().await.push(handle);
        }
    }

    /// Spawns the task that recovers expired claims and prunes the archive.
    pub async fn spawn_housekeeper(&self) {
        let scheduler = Arc::clone(&self.scheduler);
        let interval = Duration::from_millis(self.config.housekeeper_interval_ms);
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = scheduler.recover_stale_claims().await {
                            tracing::warn!("housekeeper recover_stale_claims error: {err}");
                        }
                        if let Err(err) = scheduler.prune_archive().await {
                            tracing::warn!("housekeeper prune_archive error: {err}");
                        }
                        // Refreshes the active-jobs gauges.
                        if cfg!(feature = "metrics")
                            && let Err(err) = scheduler.snapshot().await
                        {
                            tracing::warn!("housekeeper snapshot error: {err}");
                        }
                    }
                }
            }
        });

        self.handles.lock().await.push(handle);
    }

    /// Spawns the task that wakes workers when a penalty lifts, either
    /// because it was cleared or because its window ran out.
    pub async fn spawn_penalty_watcher(&self, penalties: Arc<PenaltyTracker>) {
        let scheduler = Arc::clone(&self.scheduler);
        let idle = Duration::from_millis(self.config.housekeeper_interval_ms);
        let shutdown = self.shutdown_token.clone();
        let mut penalty_rx = penalties.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let sleep_for = penalties
                    .next_unblock_at()
                    .map_or(idle, |at| remaining(scheduler.clock().now(), at));

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Penalty watcher shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(sleep_for) => {
                        scheduler.wake();
                    }
                    event = penalty_rx.recv() => match event {
                        Ok(PenaltyEvent::Cleared { sub_protocol }) => {
                            tracing::debug!(sub_protocol = %sub_protocol, "penalty cleared, waking workers");
                            scheduler.wake();
                        }
                        Ok(_) => {}
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("penalty watcher lagged, skipped {skipped} events");
                            scheduler.wake();
                        }
                    }
                }
            }
        });

        self.handles.lock().await.push(handle);
    }
}

async fn worker_loop(worker: WorkerConfig, scheduler: Arc<Scheduler>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            tracing::info!("Worker {} shutting down", worker.worker_id);
            break;
        }

        match scheduler.claim_next(&worker.worker_id).await {
            Ok(Some(claimed)) => run_claimed(&worker, &scheduler, claimed).await,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = scheduler.wait_for_work(worker.poll_interval()) => {}
                }
            }
            Err(err) => {
                tracing::warn!(worker_id = %worker.worker_id, "claim error: {err}");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(worker.error_backoff()) => {}
                }
            }
        }
    }
}

async fn run_claimed(worker: &WorkerConfig, scheduler: &Arc<Scheduler>, claimed: ClaimedJob) {
    let job_id = claimed.id();
    let kind = claimed.kind().clone();
    let timing = telemetry::record_job_start(job_id.to_string());

    let (cancel_tx, mut cancel_rx) = tokio::sync::mpsc::channel::<()>(1);
    let renewer = Arc::clone(scheduler);
    let renew_worker_id = worker.worker_id.clone();
    let renew_interval = worker.renew_interval();
    let renew_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(renew_interval) => {}
                _ = cancel_rx.recv() => { break; }
            }

            match renewer.renew_claim(job_id, &renew_worker_id).await {
                Ok(true) => tracing::trace!(job_id = %job_id, "claim renewed"),
                Ok(false) => {
                    tracing::warn!(job_id = %job_id, "claim lost while running");
                    break;
                }
                Err(err) => tracing::warn!(job_id = %job_id, "claim renew error: {err}"),
            }
        }
    });

    let executor = Arc::clone(&claimed.executor);
    let input = claimed.input().clone();
    let cancel = claimed.cancel.clone();
    let execution = tokio::spawn(
        async move { executor.execute(&input, cancel).await }
            .instrument(telemetry::job_dispatch_span(job_id.to_string(), kind.as_str())),
    );

    let outcome = match execution.await {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => {
            tracing::error!(job_id = %job_id, kind = %kind, "executor panicked");
            JobOutcome::retry("executor panicked")
        }
        Err(err) => JobOutcome::retry(format!("executor task failed: {err}")),
    };

    let _ = cancel_tx.try_send(());
    let _ = renew_handle.await;

    telemetry::record_job_end(timing, kind.as_str(), outcome.label());
    if let Err(err) = scheduler.finish(claimed, outcome).await {
        tracing::error!(job_id = %job_id, "recording job outcome failed: {err}");
    }
}

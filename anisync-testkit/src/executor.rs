use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anisync::{CancellationToken, JobExecutor, JobInput, JobOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Tracks how many executions overlap. Share one gauge between executors
/// to observe a whole concurrency group.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counts the caller as running until the guard is dropped.
    pub fn track(self: &Arc<Self>) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            gauge: Arc::clone(self),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[must_use]
#[derive(Debug)]
pub struct GaugeGuard {
    gauge: Arc<ConcurrencyGauge>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub input: JobInput,
    pub started_at: DateTime<Utc>,
    pub outcome: JobOutcome,
}

/// [`JobExecutor`] that records every call and answers from a script.
///
/// Queued outcomes are returned first, in order; once the queue is empty
/// every call gets the fallback outcome (`Success` unless changed). An input
/// field `delay_ms` overrides the configured delay for that call.
#[derive(Clone)]
pub struct RecordingExecutor {
    calls: Arc<Mutex<Vec<ExecutionRecord>>>,
    script: Arc<Mutex<VecDeque<JobOutcome>>>,
    fallback: Arc<Mutex<JobOutcome>>,
    delay: Duration,
    gauge: Arc<ConcurrencyGauge>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::with_outcome(JobOutcome::Success)
    }

    pub fn with_outcome(outcome: JobOutcome) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(outcome)),
            delay: Duration::ZERO,
            gauge: ConcurrencyGauge::new(),
        }
    }

    /// Holds every execution for `delay` unless it is cancelled first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn sharing_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = gauge;
        self
    }

    pub fn push_outcome(&self, outcome: JobOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn set_outcome(&self, outcome: JobOutcome) {
        *self.fallback.lock() = outcome;
    }

    pub fn gauge(&self) -> &Arc<ConcurrencyGauge> {
        &self.gauge
    }

    pub fn calls(&self) -> Vec<ExecutionRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(
            actual, expected,
            "Expected {} executions, got {}",
            expected, actual
        );
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn next_outcome(&self) -> JobOutcome {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone())
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn execute(&self, input: &JobInput, cancel: CancellationToken) -> JobOutcome {
        let started_at = Utc::now();
        let running = self.gauge.track();

        let delay = input
            .get_u64("delay_ms")
            .map_or(self.delay, Duration::from_millis);

        let outcome = if delay.is_zero() {
            self.next_outcome()
        } else {
            tokio::select! {
                _ = cancel.cancelled() => JobOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => self.next_outcome(),
            }
        };

        drop(running);
        tracing::debug!(outcome = outcome.label(), "recording executor finished");
        self.calls.lock().push(ExecutionRecord {
            input: input.clone(),
            started_at,
            outcome: outcome.clone(),
        });
        outcome
    }
}

use std::time::Duration;

/// Timing for one worker task spawned by the runtime.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Longest idle wait before the worker polls the scheduler again.
    pub poll_interval: Duration,
    /// How often a running job's claim is extended.
    pub renew_interval: Duration,
    /// Pause after a failed claim attempt.
    pub error_backoff: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: Duration::from_millis(500),
            renew_interval: Duration::from_secs(30),
            error_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval = Duration::from_millis(ms);
        self
    }

    /// Clamped to at least one millisecond so the renew ticker never spins.
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    pub fn error_backoff(&self) -> Duration {
        self.error_backoff
    }
}

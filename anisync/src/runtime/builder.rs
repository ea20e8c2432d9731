use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::descriptor::JobRegistry;
use crate::events::InProcEventBus;
use crate::lock::ExecutionLock;
use crate::penalty::PenaltyTracker;
use crate::scheduler::Scheduler;
use crate::store::JobStore;

use super::supervisor::{SchedulerRuntime, SchedulerRuntimeConfig};

/// Builder for constructing a [`SchedulerRuntime`] with explicit dependencies.
///
/// The registry and the store are required. The lock defaults to whatever
/// the store asks for through [`JobStore::lock_kind`], the clock to
/// [`SystemClock`] and the event bus to a fresh [`InProcEventBus`].
///
/// # Example
///
/// ```ignore
/// use anisync::*;
///
/// let runtime = SchedulerRuntimeBuilder::from_settings(&settings)
///     .with_registry(registry)
///     .with_store(store)
///     .with_penalties(penalties)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct SchedulerRuntimeBuilder {
    config: SchedulerRuntimeConfig,
    registry: Option<Arc<JobRegistry>>,
    store: Option<Arc<dyn JobStore>>,
    lock: Option<Arc<dyn ExecutionLock>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<InProcEventBus>,
    penalties: Option<Arc<PenaltyTracker>>,
}

impl fmt::Debug for SchedulerRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SchedulerRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("registry_set", &self.registry.is_some());
        debug.field("store_set", &self.store.is_some());
        debug.field("lock_set", &self.lock.is_some());
        debug.field("clock_set", &self.clock.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("penalties_set", &self.penalties.is_some());

        if let Some(registry) = &self.registry {
            debug.field("registered_kinds", &registry.len());
        }

        debug.finish()
    }
}

impl SchedulerRuntimeBuilder {
    pub fn new(config: SchedulerRuntimeConfig) -> Self {
        Self {
            config,
            registry: None,
            store: None,
            lock: None,
            clock: None,
            events: None,
            penalties: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(SchedulerRuntimeConfig::from(&settings.scheduler))
    }

    pub fn with_registry(mut self, registry: impl Into<Arc<JobRegistry>>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Overrides the lock the store would choose.
    pub fn with_lock(mut self, lock: Arc<dyn ExecutionLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_events(mut self, events: InProcEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Lets the runtime wake workers as soon as a ban or backoff lifts.
    pub fn with_penalties(mut self, penalties: Arc<PenaltyTracker>) -> Self {
        self.penalties = Some(penalties);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    pub fn build(self) -> anyhow::Result<SchedulerRuntime> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry dependency missing"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        if registry.is_empty() {
            anyhow::bail!("registry has no job kinds");
        }

        let lock = self.lock.unwrap_or_else(|| store.lock_kind().build());
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_default();

        let scheduler = Scheduler::new(
            self.config.scheduler.clone(),
            registry,
            store,
            lock,
            clock,
            events,
        );

        Ok(SchedulerRuntime::new(
            self.config,
            Arc::new(scheduler),
            self.penalties,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::descriptor::{JobDescriptor, JobExecutor};
    use crate::job::{JobInput, JobOutcome};
    use crate::runtime::CancellationToken;
    use crate::store::MemoryJobStore;

    struct Noop;

    #[async_trait]
    impl JobExecutor for Noop {
        async fn execute(&self, _input: &JobInput, _cancel: CancellationToken) -> JobOutcome {
            JobOutcome::Success
        }
    }

    fn registry() -> JobRegistry {
        JobRegistry::builder()
            .register(JobDescriptor::new("noop"), Noop)
            .build()
            .unwrap()
    }

    #[test]
    fn missing_dependencies_are_reported() {
        let err = SchedulerRuntimeBuilder::new(SchedulerRuntimeConfig::default())
            .with_store(Arc::new(MemoryJobStore::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("registry dependency missing"));

        let err = SchedulerRuntimeBuilder::new(SchedulerRuntimeConfig::default())
            .with_registry(registry())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("store dependency missing"));
    }

    #[test]
    fn builds_with_defaults() {
        let builder = SchedulerRuntimeBuilder::new(SchedulerRuntimeConfig::default())
            .with_registry(registry())
            .with_store(Arc::new(MemoryJobStore::new()))
            .workers(0);
        assert!(format!("{builder:?}").contains("registry_set: true"));

        let runtime = builder.build().unwrap();
        assert_eq!(runtime.config().workers, 1);
        assert_eq!(runtime.scheduler().registry().len(), 1);
    }
}

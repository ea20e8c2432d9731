use std::sync::Arc;

use anisync::{
    InProcEventBus, JobId, JobInput, JobRegistryBuilder, JobState, ManualClock, MemoryJobStore,
    PenaltyConfig, PenaltyTracker, ProcessLock, Scheduler, SchedulerConfig, SchedulerError,
};
use serde::{Deserialize, Serialize};

/// A scheduler over an in-memory store, a manual clock and a penalty
/// tracker that preconditions can be wired to.
pub struct SchedulerFixture {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<MemoryJobStore>,
    pub clock: Arc<ManualClock>,
    pub penalties: Arc<PenaltyTracker>,
    pub events: InProcEventBus,
}

impl SchedulerFixture {
    /// `register` receives the fixture's penalty tracker so descriptors can
    /// require a sub-protocol.
    pub fn build<F>(config: SchedulerConfig, register: F) -> anyhow::Result<Self>
    where
        F: FnOnce(Arc<PenaltyTracker>) -> JobRegistryBuilder,
    {
        let clock = Arc::new(ManualClock::starting_now());
        let penalties = Arc::new(PenaltyTracker::new(PenaltyConfig::default(), clock.clone()));
        let registry = register(penalties.clone()).build()?;
        let store = Arc::new(MemoryJobStore::new());
        let events = InProcEventBus::default();

        let scheduler = Scheduler::new(
            config,
            Arc::new(registry),
            store.clone(),
            Arc::new(ProcessLock::default()),
            clock.clone(),
            events.clone(),
        );

        Ok(Self {
            scheduler: Arc::new(scheduler),
            store,
            clock,
            penalties,
            events,
        })
    }
}

/// Claims one job, runs its executor inline and applies the outcome.
pub async fn run_once(
    scheduler: &Scheduler,
    worker_id: &str,
) -> Result<Option<(JobId, JobState)>, SchedulerError> {
    let Some(claimed) = scheduler.claim_next(worker_id).await? else {
        return Ok(None);
    };
    let id = claimed.id();
    let executor = Arc::clone(&claimed.executor);
    let input = claimed.input().clone();
    let outcome = executor.execute(&input, claimed.cancel.clone()).await;
    let state = scheduler.finish(claimed, outcome).await?;
    Ok(Some((id, state)))
}

/// Input of an anime lookup.
pub fn aid(id: u64) -> JobInput {
    JobInput::new().with("aid", id)
}

/// File identity as submitted by the import pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub size: u64,
    pub ed2k: String,
}

/// Input of a file lookup.
pub fn file_ref(size: u64, ed2k: &str) -> JobInput {
    let file = FileRef {
        size,
        ed2k: ed2k.to_string(),
    };
    JobInput::from_serializable(&file).expect("file reference serializes to an object")
}

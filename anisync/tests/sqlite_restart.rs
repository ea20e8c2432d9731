//! Jobs and the pause flag stored in a sqlite file outlive the scheduler
//! that wrote them.

#![cfg(feature = "sqlite")]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anisync::persistence::SqliteJobStore;
use anisync::{
    InProcEventBus, JobDescriptor, JobRegistry, JobState, ManualClock, Priority, ProcessLock,
    Scheduler, SchedulerConfig,
};
use anisync_testkit::{aid, RecordingExecutor};

fn open_scheduler(path: &Path, clock: Arc<ManualClock>) -> Scheduler {
    let registry = JobRegistry::builder()
        .register(
            JobDescriptor::new("refresh").key_field("aid"),
            RecordingExecutor::new(),
        )
        .build()
        .unwrap();
    Scheduler::new(
        SchedulerConfig::default(),
        Arc::new(registry),
        Arc::new(SqliteJobStore::open(path).unwrap()),
        Arc::new(ProcessLock::default()),
        clock,
        InProcEventBus::default(),
    )
}

#[tokio::test]
async fn claimed_job_is_requeued_once_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let clock = Arc::new(ManualClock::starting_now());

    let (claimed_id, waiting_id) = {
        let scheduler = open_scheduler(&path, clock.clone());
        let claimed = scheduler
            .submit("refresh", aid(1), Priority::HIGH)
            .await
            .unwrap()
            .job_id();
        let waiting = scheduler
            .submit("refresh", aid(2), Priority::LOW)
            .await
            .unwrap()
            .job_id();

        let job = scheduler.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(job.id(), claimed);
        // The process dies with the job still running.
        drop(job);
        (claimed, waiting)
    };

    let config = SchedulerConfig::default();
    clock.advance(config.claim_ttl + Duration::from_secs(1));
    let scheduler = open_scheduler(&path, clock.clone());

    let status = scheduler.status(claimed_id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Dispatched);

    assert_eq!(scheduler.recover_stale_claims().await.unwrap(), 1);
    assert_eq!(scheduler.recover_stale_claims().await.unwrap(), 0);

    let status = scheduler.status(claimed_id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Pending);
    assert_eq!(status.attempts, 1);

    let waiting = scheduler.status(waiting_id).await.unwrap().unwrap();
    assert_eq!(waiting.attempts, 0);
    assert_eq!(waiting.state, JobState::Eligible);

    clock.advance(Duration::from_millis(config.retry.max_backoff_ms));
    let mut claimed = Vec::new();
    while let Some(job) = scheduler.claim_next("w2").await.unwrap() {
        claimed.push(job.id());
        scheduler.finish(job, anisync::JobOutcome::Success).await.unwrap();
    }
    assert_eq!(claimed, vec![claimed_id, waiting_id]);
    assert_eq!(scheduler.snapshot().await.unwrap().active(), 0);
}

#[tokio::test]
async fn pause_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let clock = Arc::new(ManualClock::starting_now());

    {
        let scheduler = open_scheduler(&path, clock.clone());
        scheduler.submit("refresh", aid(1), Priority::NORMAL).await.unwrap();
        scheduler.pause().await.unwrap();
    }

    let scheduler = open_scheduler(&path, clock.clone());
    assert!(scheduler.is_paused().await.unwrap());
    assert!(scheduler.claim_next("w1").await.unwrap().is_none());

    scheduler.resume().await.unwrap();
    assert!(scheduler.claim_next("w1").await.unwrap().is_some());
}

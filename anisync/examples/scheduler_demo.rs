//! Offline walkthrough of the scheduler.
//!
//! A simulated provider stands in for the UDP API: it bans the client on
//! the third lookup, which defers the job and gates every UDP kind until
//! the demo clears the ban. Run with `RUST_LOG=anisync=debug` for the
//! scheduler's own logs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anisync::*;
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

const SETTINGS: &str = r#"
[scheduler]
workers = 3
retry_base_delay_ms = 200
poll_interval_ms = 100

[penalty]
udp_ban_window_secs = 2

[concurrency.overrides]
"local.rehash" = 2
"#;

/// Pretends to talk to the provider; the third call gets the client banned.
struct SimulatedLookup {
    penalties: Arc<PenaltyTracker>,
    calls: AtomicU32,
}

#[async_trait]
impl JobExecutor for SimulatedLookup {
    async fn execute(&self, input: &JobInput, cancel: CancellationToken) -> JobOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::select! {
            _ = cancel.cancelled() => return JobOutcome::Cancelled,
            _ = tokio::time::sleep(Duration::from_millis(150)) => {}
        }

        if call == 3 {
            self.penalties
                .mark_banned_because(SubProtocol::Udp, None, Some("simulated flood ban"));
            let err = ProtocolError::Banned {
                sub_protocol: SubProtocol::Udp,
                retry_in: self.penalties.retry_after(SubProtocol::Udp),
            };
            return err.outcome();
        }

        tracing::info!(aid = input.get_u64("aid"), "looked up anime");
        JobOutcome::Success
    }
}

/// Local work that never touches the provider.
struct Rehash;

#[async_trait]
impl JobExecutor for Rehash {
    async fn execute(&self, input: &JobInput, _cancel: CancellationToken) -> JobOutcome {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracing::info!(path = input.get_str("path"), "rehashed file");
        JobOutcome::Success
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_toml_str(SETTINGS)?;
    let penalties = Arc::new(PenaltyTracker::new(
        PenaltyConfig::from(&settings.penalty),
        Arc::new(SystemClock),
    ));

    let registry = JobRegistry::builder()
        .register(
            JobDescriptor::new("anidb.get_anime")
                .key_field("aid")
                .in_group(ConcurrencyGroup::new(ANIDB_UDP_GROUP))
                .requires(SubProtocolAvailable::new(penalties.clone(), SubProtocol::Udp)),
            SimulatedLookup {
                penalties: penalties.clone(),
                calls: AtomicU32::new(0),
            },
        )
        .register(
            JobDescriptor::new("local.rehash")
                .key_field("path")
                .max_concurrent(1)
                .max_allowed_concurrent(4),
            Rehash,
        )
        .with_overrides(settings.concurrency.clone())
        .build()?;

    let runtime = SchedulerRuntimeBuilder::from_settings(&settings)
        .with_registry(registry)
        .with_store(persistence::connect(&settings.persistence).await?)
        .with_penalties(penalties.clone())
        .build()?;
    let scheduler = runtime.scheduler();

    let mut events = scheduler.events().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("event: {:?}", event.payload),
                Err(RecvError::Lagged(skipped)) => println!("event printer skipped {skipped}"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for aid in [1, 2, 3, 4] {
        scheduler
            .submit("anidb.get_anime", JobInput::new().with("aid", aid), Priority::new(aid as i32))
            .await?;
    }
    // Folded into the waiting entry for aid 1.
    let merged = scheduler
        .submit("anidb.get_anime", JobInput::new().with("aid", 1), Priority::HIGH)
        .await?;
    println!("resubmitting aid 1: {merged:?}");

    for path in ["/media/a.mkv", "/media/b.mkv", "/media/c.mkv"] {
        scheduler
            .submit("local.rehash", JobInput::new().with("path", path), Priority::LOW)
            .await?;
    }

    runtime.start().await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let snapshot = scheduler.snapshot().await?;
    println!(
        "after 1s: udp banned = {}, snapshot = {}",
        penalties.is_banned(SubProtocol::Udp),
        serde_json::to_string_pretty(&snapshot)?
    );

    penalties.mark_clear(SubProtocol::Udp);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let snapshot = scheduler.snapshot().await?;
    println!("remaining active jobs: {}", snapshot.active());

    runtime.shutdown().await?;
    printer.abort();
    Ok(())
}

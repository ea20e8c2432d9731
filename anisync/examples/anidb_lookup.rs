//! Looks up anime ids against the live provider through the scheduler.
//!
//! ```text
//! ANIDB_USER=me ANIDB_PASS=secret cargo run --example anidb_lookup -- [settings.toml] 1 2 3
//! ```
//!
//! Respect the provider's flood rules: keep `command_interval_ms` at two
//! seconds or more.

use std::sync::Arc;
use std::time::Duration;

use anisync::protocol::{ClientConfig, Credentials, GetAnime, UdpClient, UdpTransport};
use anisync::*;
use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

struct AnimeLookup {
    client: Arc<UdpClient>,
}

#[async_trait]
impl JobExecutor for AnimeLookup {
    async fn execute(&self, input: &JobInput, cancel: CancellationToken) -> JobOutcome {
        let Some(aid) = input.get_u64("aid") else {
            return JobOutcome::fail("input has no aid");
        };
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        match self.client.send_with_relogin(&GetAnime::new(aid)).await {
            Ok(response) => {
                match response.payload {
                    Some(anime) => println!("{} ({}, {})", anime.romaji_name, anime.year, anime.kind),
                    None => println!("anime {aid} does not exist"),
                }
                JobOutcome::Success
            }
            Err(err) => {
                tracing::warn!(aid, error = %err, "lookup failed");
                err.outcome()
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,anisync=debug")),
        )
        .init();

    let mut args = std::env::args().skip(1).peekable();
    let settings = match args.peek() {
        Some(first) if first.ends_with(".toml") => {
            let path = args.next().unwrap_or_default();
            Settings::load(path)?
        }
        _ => Settings::default(),
    };
    let ids = args
        .map(|raw| raw.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        anyhow::bail!("pass at least one anime id");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let penalties = Arc::new(PenaltyTracker::new(
        PenaltyConfig::from(&settings.penalty),
        clock.clone(),
    ));

    let mut config = ClientConfig::from_settings(&settings.anidb, &settings.penalty);
    if let (Ok(user), Ok(pass)) = (std::env::var("ANIDB_USER"), std::env::var("ANIDB_PASS")) {
        config.credentials = Credentials::new(user, pass);
    }
    let transport = Arc::new(UdpTransport::connect(&settings.anidb).await?);
    let client = Arc::new(UdpClient::new(config, transport, penalties.clone(), clock.clone()));

    let registry = JobRegistry::builder()
        .register(
            JobDescriptor::new("anidb.get_anime")
                .key_field("aid")
                .in_group(ConcurrencyGroup::new(ANIDB_UDP_GROUP))
                .requires(SubProtocolAvailable::new(penalties.clone(), SubProtocol::Udp)),
            AnimeLookup {
                client: client.clone(),
            },
        )
        .with_overrides(settings.concurrency.clone())
        .build()?;

    let runtime = SchedulerRuntimeBuilder::from_settings(&settings)
        .with_registry(registry)
        .with_store(persistence::connect(&settings.persistence).await?)
        .with_clock(clock)
        .with_penalties(penalties)
        .build()?;
    let scheduler = runtime.scheduler();

    for aid in ids {
        scheduler
            .submit("anidb.get_anime", JobInput::new().with("aid", aid), Priority::NORMAL)
            .await?;
    }

    let keepalive = client.spawn_keepalive(runtime.shutdown_token());
    runtime.start().await?;

    while scheduler.snapshot().await?.active() > 0 {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    runtime.shutdown().await?;
    let _ = keepalive.await;
    client.logout().await?;
    Ok(())
}

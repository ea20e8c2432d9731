//! anisync - upstream session client and gated job scheduler for media
//! metadata import.
//!
//! The crate talks to a rate-limited, ban-happy metadata provider over a
//! session-based UDP protocol (plus an HTTP side channel) and schedules the
//! work that needs it so that bans, concurrency ceilings and restarts are
//! handled in one place.
//!
//! # Core Concepts
//!
//! - **Protocol**: [`protocol::UdpClient`] owns the single provider session,
//!   logs in on demand and feeds ban and busy replies into the
//!   [`PenaltyTracker`]. Typed commands implement [`protocol::Request`].
//!
//! - **Penalties**: the [`PenaltyTracker`] records bans and backoffs per
//!   [`SubProtocol`] and broadcasts changes.
//!
//! - **Jobs**: every job type registers a [`JobDescriptor`] (identity key
//!   fields, concurrency ceiling, group, preconditions) and a
//!   [`JobExecutor`] in the [`JobRegistry`].
//!
//! - **Scheduler**: the [`Scheduler`] deduplicates submissions by identity
//!   key, claims eligible entries whose kind has a free slot and whose
//!   preconditions pass, and applies retries with exponential backoff.
//!
//! - **Runtime**: the [`SchedulerRuntime`] runs the worker pool, renews
//!   claims, recovers expired ones and wakes workers when penalties lift.
//!
//! # Feature Flags
//!
//! - `sqlite` - embedded job store via rusqlite
//! - `postgres` - PostgreSQL job store via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use anisync::*;
//!
//! let registry = JobRegistry::builder()
//!     .register(
//!         JobDescriptor::new("anidb.get_anime")
//!             .key_field("aid")
//!             .in_group(ConcurrencyGroup::new(ANIDB_UDP_GROUP))
//!             .requires(SubProtocolAvailable::new(penalties.clone(), SubProtocol::Udp)),
//!         GetAnimeExecutor::new(client.clone()),
//!     )
//!     .build()?;
//!
//! let runtime = SchedulerRuntimeBuilder::from_settings(&settings)
//!     .with_registry(registry)
//!     .with_store(persistence::connect(&settings.persistence).await?)
//!     .with_penalties(penalties)
//!     .build()?;
//! runtime.start().await?;
//! runtime
//!     .scheduler()
//!     .submit("anidb.get_anime", JobInput::new().with("aid", 1), Priority::NORMAL)
//!     .await?;
//! ```

/// Injectable wall clock.
pub mod clock;

/// Settings loaded from TOML.
///
/// [`Settings`] groups the provider connection, penalty windows, scheduler
/// tuning, concurrency overrides and the [`PersistenceConfig`].
pub mod config;

/// Job descriptors, executors and the registry built at startup.
pub mod descriptor;

pub mod error;

/// Job lifecycle events.
///
/// The scheduler publishes a [`JobEvent`] for every state change on an
/// [`InProcEventBus`].
pub mod events;

/// Core job vocabulary: ids, kinds, priorities, identity keys, inputs and
/// executor outcomes.
pub mod job;

/// Named execution locks that serialise scheduler mutations.
pub mod lock;

/// Per sub-protocol ban and backoff bookkeeping.
pub mod penalty;

/// Job store backends selected from [`PersistenceConfig`].
pub mod persistence;

/// Preconditions and the gate that evaluates them.
pub mod precondition;

pub mod protocol;

/// Retry limits and exponential backoff.
pub mod retry;

/// Worker pool, housekeeping and the cancellation token.
pub mod runtime;

pub mod scheduler;

/// In-flight counters per kind and concurrency group.
pub mod slots;

/// Job store trait, persisted records and the in-memory store.
pub mod store;

/// Tracing spans and metric helpers.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

pub use clock::*;
pub use config::*;
pub use descriptor::*;
pub use error::*;
pub use events::*;
pub use job::*;
pub use lock::*;
pub use penalty::*;
pub use precondition::*;
pub use retry::*;
pub use runtime::*;
pub use scheduler::*;
pub use slots::*;
pub use store::*;

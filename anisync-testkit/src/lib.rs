//! Test doubles for anisync: scripted provider transports, recording job
//! executors and a scheduler fixture driven by a manual clock.

mod executor;
mod fixtures;
mod transport;

pub use executor::{ConcurrencyGauge, ExecutionRecord, GaugeGuard, RecordingExecutor};
pub use fixtures::{aid, file_ref, run_once, FileRef, SchedulerFixture};
pub use transport::ScriptedTransport;

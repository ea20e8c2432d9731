/// Runtime builder for constructing scheduler runtimes.
pub mod builder;
/// Runtime supervisor managing worker pools and job execution.
pub mod supervisor;
/// Worker configuration.
pub mod worker;

pub use builder::SchedulerRuntimeBuilder;
pub use supervisor::{CancellationToken, SchedulerRuntime, SchedulerRuntimeConfig};
pub use worker::WorkerConfig;

//! Tracing and telemetry instrumentation for anisync.
//!
//! Span constructors and `record_*` helpers used by the scheduler, the worker
//! runtime and the protocol client. Every helper logs through `tracing` and,
//! with the `metrics` feature enabled, also updates the Prometheus series in
//! [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use anisync::telemetry::{job_dispatch_span, record_job_submitted};
//!
//! let span = job_dispatch_span(job_id, job_kind);
//! let _enter = span.enter();
//! record_job_submitted(job_kind, "created");
//! ```

use std::time::{Duration, Instant};

use tracing::{Span, info_span};

/// Span around a single executor invocation.
#[must_use]
pub fn job_dispatch_span(job_id: impl AsRef<str>, kind: impl AsRef<str>) -> Span {
    info_span!(
        "anisync.dispatch",
        job_id = %job_id.as_ref(),
        job_kind = %kind.as_ref(),
    )
}

/// Span around one claim pass of a worker.
#[must_use]
pub fn job_claim_span(worker_id: impl AsRef<str>) -> Span {
    info_span!("anisync.claim", worker_id = %worker_id.as_ref())
}

/// Span around a submission.
///
/// # Arguments
/// * `job_kind` - The job kind being submitted
/// * `priority` - The requested priority
#[must_use]
pub fn job_submit_span(job_kind: impl AsRef<str>, priority: i32) -> Span {
    info_span!(
        "anisync.submit",
        job_kind = %job_kind.as_ref(),
        priority = priority,
    )
}

/// Span around recording the outcome of a dispatched job.
#[must_use]
pub fn job_complete_span(
    job_id: impl AsRef<str>,
    job_kind: impl AsRef<str>,
    status: impl AsRef<str>,
) -> Span {
    info_span!(
        "anisync.complete",
        job_id = %job_id.as_ref(),
        job_kind = %job_kind.as_ref(),
        status = %status.as_ref(),
    )
}

/// Span around one upstream protocol exchange.
#[must_use]
pub fn protocol_span(command: impl AsRef<str>, sub_protocol: impl AsRef<str>) -> Span {
    info_span!(
        "anisync.protocol",
        command = %command.as_ref(),
        sub_protocol = %sub_protocol.as_ref(),
    )
}

/// Record a submission and how it was resolved (created, merged, duplicate,
/// already_succeeded).
pub fn record_job_submitted(job_kind: impl AsRef<str>, resolution: impl AsRef<str>) {
    tracing::debug!(
        job_kind = %job_kind.as_ref(),
        resolution = %resolution.as_ref(),
        "job submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted(job_kind.as_ref(), resolution.as_ref());
}

/// Record the outcome of one execution.
///
/// # Arguments
/// * `job_kind` - The job kind
/// * `status` - success, retry, deferred, failed or cancelled
pub fn record_job_completed(job_kind: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::info!(
        job_kind = %job_kind.as_ref(),
        status = %status.as_ref(),
        "job completed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_completed(job_kind.as_ref(), status.as_ref());
}

/// Record a claim that expired without its worker finishing the job.
pub fn record_claim_expired(job_kind: impl AsRef<str>) {
    tracing::warn!(job_kind = %job_kind.as_ref(), "claim expired");

    #[cfg(feature = "metrics")]
    crate::metrics::record_claim_expired(job_kind.as_ref());
}

/// Update the number of jobs currently executing for a kind.
pub fn set_in_flight(job_kind: impl AsRef<str>, in_flight: usize) {
    tracing::trace!(
        job_kind = %job_kind.as_ref(),
        in_flight = in_flight,
        "in-flight count updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_in_flight(job_kind.as_ref(), in_flight as f64);
}

/// Update the number of active entries for a kind.
pub fn set_active_jobs(job_kind: impl AsRef<str>, active: usize) {
    tracing::debug!(
        job_kind = %job_kind.as_ref(),
        active = active,
        "active job count updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_active_jobs(job_kind.as_ref(), active as f64);
}

/// Observe the wall-clock duration of one execution.
pub fn observe_job_duration(
    job_kind: impl AsRef<str>,
    status: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::debug!(
        job_kind = %job_kind.as_ref(),
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(job_kind.as_ref(), status.as_ref(), duration_secs);
}

/// Start timing an execution. Pass the handle to [`record_job_end`].
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: Instant::now(),
    }
}

/// Finish timing an execution and observe its duration.
pub fn record_job_end(
    handle: JobTimingHandle,
    job_kind: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    observe_job_duration(job_kind, status, handle.elapsed().as_secs_f64());
}

/// Opaque timer returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_names_are_namespaced() {
        let spans = [
            (job_dispatch_span("job-1", "anime"), "anisync.dispatch"),
            (job_claim_span("worker-0"), "anisync.claim"),
            (job_submit_span("anime", 0), "anisync.submit"),
            (job_complete_span("job-1", "anime", "success"), "anisync.complete"),
            (protocol_span("AUTH", "udp"), "anisync.protocol"),
        ];
        for (span, name) in spans {
            if let Some(metadata) = span.metadata() {
                assert_eq!(metadata.name(), name);
            }
        }
    }

    #[test]
    fn timing_handle_tracks_elapsed() {
        let handle = record_job_start("job-1");
        assert_eq!(handle.job_id(), "job-1");

        std::thread::sleep(Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);

        record_job_end(handle, "anime", "success");
    }
}

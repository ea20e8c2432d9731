//! Prometheus metrics for anisync.
//!
//! Compiled only with the `metrics` feature.
//!
//! ## Counters
//! - `anisync_jobs_submitted_total` - Submissions by resolution
//! - `anisync_jobs_completed_total` - Executions by outcome
//! - `anisync_claims_expired_total` - Claims reclaimed after their worker vanished
//! - `anisync_upstream_penalties_total` - Bans and backoffs per sub-protocol
//!
//! ## Gauges
//! - `anisync_jobs_in_flight` - Executing jobs per kind
//! - `anisync_jobs_active` - Active (non-terminal) entries per kind
//!
//! ## Histograms
//! - `anisync_job_duration_seconds` - Executor wall-clock time
#![cfg(feature = "metrics")]

use std::sync::LazyLock;

use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets};

/// Global registry for anisync metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `job_kind`, `resolution` (created, merged, duplicate, already_succeeded).
pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("anisync_jobs_submitted_total", "Total number of job submissions");
    CounterVec::new(opts, &["job_kind", "resolution"])
        .expect("anisync_jobs_submitted_total metric creation failed")
});

/// Labels: `job_kind`, `status`.
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "anisync_jobs_completed_total",
        "Total number of job executions by outcome",
    );
    CounterVec::new(opts, &["job_kind", "status"])
        .expect("anisync_jobs_completed_total metric creation failed")
});

pub static CLAIMS_EXPIRED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "anisync_claims_expired_total",
        "Total number of claims that expired before completion",
    );
    CounterVec::new(opts, &["job_kind"]).expect("anisync_claims_expired_total metric creation failed")
});

/// Labels: `sub_protocol`, `penalty` (banned, backoff).
pub static UPSTREAM_PENALTIES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "anisync_upstream_penalties_total",
        "Total number of upstream bans and backoffs",
    );
    CounterVec::new(opts, &["sub_protocol", "penalty"])
        .expect("anisync_upstream_penalties_total metric creation failed")
});

pub static JOBS_IN_FLIGHT: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("anisync_jobs_in_flight", "Jobs currently executing");
    GaugeVec::new(opts, &["job_kind"]).expect("anisync_jobs_in_flight metric creation failed")
});

pub static JOBS_ACTIVE: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("anisync_jobs_active", "Active job entries");
    GaugeVec::new(opts, &["job_kind"]).expect("anisync_jobs_active metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "anisync_job_duration_seconds",
        "Job execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_kind", "status"])
        .expect("anisync_job_duration_seconds metric creation failed")
});

/// Registers every metric with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(CLAIMS_EXPIRED_TOTAL.clone()),
        Box::new(UPSTREAM_PENALTIES_TOTAL.clone()),
        Box::new(JOBS_IN_FLIGHT.clone()),
        Box::new(JOBS_ACTIVE.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted(job_kind: &str, resolution: &str) {
    JOBS_SUBMITTED_TOTAL
        .with_label_values(&[job_kind, resolution])
        .inc();
}

pub fn record_job_completed(job_kind: &str, status: &str) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[job_kind, status])
        .inc();
}

pub fn record_claim_expired(job_kind: &str) {
    CLAIMS_EXPIRED_TOTAL.with_label_values(&[job_kind]).inc();
}

pub fn record_penalty(sub_protocol: &str, penalty: &str) {
    UPSTREAM_PENALTIES_TOTAL
        .with_label_values(&[sub_protocol, penalty])
        .inc();
}

pub fn set_in_flight(job_kind: &str, in_flight: f64) {
    JOBS_IN_FLIGHT.with_label_values(&[job_kind]).set(in_flight);
}

pub fn set_active_jobs(job_kind: &str, active: f64) {
    JOBS_ACTIVE.with_label_values(&[job_kind]).set(active);
}

pub fn observe_job_duration(job_kind: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_kind, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn gathered_output_contains_recorded_series() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_submitted("anime", "created");
        record_job_completed("anime", "success");
        record_penalty("udp", "banned");
        set_in_flight("anime", 1.0);
        observe_job_duration("anime", "success", 0.25);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("anisync_jobs_submitted_total"));
        assert!(output.contains("anisync_jobs_completed_total"));
        assert!(output.contains("anisync_upstream_penalties_total"));
        assert!(output.contains("anisync_job_duration_seconds"));
    }
}

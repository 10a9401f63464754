//! Prometheus metrics for job execution, scheduling and the circuit breaker.
//!
//! Recording goes through the `metrics` facade, so every helper here is a
//! no-op until [`init_metrics`] installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: BTreeMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
    ]
}

/// Handle to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// Installs a global Prometheus recorder; the returned registry renders
/// its text exposition. Fails if a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    // Events
    describe_counter!("taskmill_events_total", "Engine events dispatched, by event name");
    describe_histogram!(
        "taskmill_pick_latency_seconds",
        "Time spent picking a job from storage"
    );

    // Jobs
    describe_counter!(
        "taskmill_jobs_processed_total",
        "Jobs processed, by handler and outcome"
    );
    describe_histogram!(
        "taskmill_job_duration_seconds",
        "Handler execution time in seconds"
    );
    describe_gauge!("taskmill_workers_active", "Worker loops currently running");
    describe_counter!(
        "taskmill_worker_panics_total",
        "Worker loops that terminated with a panic"
    );

    // Scheduling
    describe_histogram!(
        "taskmill_scheduler_tick_seconds",
        "Duration of one scheduling tick"
    );
    describe_counter!(
        "taskmill_scheduler_command_errors_total",
        "Scheduler command failures, by command"
    );

    // Circuit breaker
    describe_counter!(
        "taskmill_circuit_breaker_transitions_total",
        "Circuit breaker state transitions, by target state"
    );
    describe_gauge!(
        "taskmill_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half-open, 2=open)"
    );

    // Errors
    describe_counter!("taskmill_errors_total", "Engine errors, by code");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Recorders
// ═══════════════════════════════════════════════════════════════════════════════

/// Job execution metrics.
pub struct JobMetrics;

impl JobMetrics {
    /// Record one finished attempt.
    pub fn record_execution(handler: &str, outcome: &'static str, duration: Duration) {
        counter!(
            "taskmill_jobs_processed_total",
            "handler" => handler.to_string(),
            "outcome" => outcome,
        )
        .increment(1);

        histogram!(
            "taskmill_job_duration_seconds",
            "handler" => handler.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    pub fn set_active_workers(count: usize) {
        gauge!("taskmill_workers_active").set(count as f64);
    }

    pub fn record_worker_panic(pool: &str) {
        counter!("taskmill_worker_panics_total", "pool" => pool.to_string()).increment(1);
    }
}

/// Scheduling manager metrics.
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    pub fn record_tick(duration: Duration) {
        histogram!("taskmill_scheduler_tick_seconds").record(duration.as_secs_f64());
    }

    pub fn record_command_error(command: &'static str) {
        counter!("taskmill_scheduler_command_errors_total", "command" => command).increment(1);
    }
}

/// Circuit breaker state for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerGaugeState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerGaugeState {
    fn value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

/// Circuit breaker metrics.
pub struct BreakerMetrics;

impl BreakerMetrics {
    pub fn record_transition(to: BreakerGaugeState) {
        counter!(
            "taskmill_circuit_breaker_transitions_total",
            "to" => to.label(),
        )
        .increment(1);
        gauge!("taskmill_circuit_breaker_state").set(to.value());
    }
}

/// Times an operation with a monotonic clock.
#[derive(Debug)]
pub struct OperationTimer {
    start: Instant,
}

impl OperationTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

//! Telemetry: logging, metrics and engine events.
//!
//! - **Logging**: structured JSON/pretty logging through `tracing`
//! - **Metrics**: Prometheus metrics for job execution and scheduling
//! - **Events**: named engine events fanned out to pluggable dispatchers

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{
    CollectingDispatcher, EngineEvent, EventDispatcher, FanoutDispatcher, SharedDispatcher,
    TracingDispatcher,
};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use self::metrics::{
    init_metrics, BreakerGaugeState, BreakerMetrics, JobMetrics, MetricsConfig, MetricsRegistry,
    OperationTimer, SchedulerMetrics,
};

/// Initialize logging and metrics together.
///
/// Should be called once at application startup.
pub fn init_telemetry(
    logging: &LoggingConfig,
    metrics: &MetricsConfig,
    service_name: &str,
) -> anyhow::Result<MetricsRegistry> {
    init_logging(logging)?;
    let registry = init_metrics(metrics, service_name)?;
    ::tracing::info!(service_name = %service_name, metrics = registry.is_enabled(), "Telemetry initialized");
    Ok(registry)
}

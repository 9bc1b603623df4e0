//! Prometheus metrics for command handling, the event bus and the bridge channel.
//!
//! # Example
//!
//! ```rust,no_run
//! use consent_core::telemetry::metrics::{BridgeMetrics, CommandMetrics};
//!
//! let timer = CommandMetrics::start("consent:register");
//! timer.finish("ok");
//!
//! BridgeMetrics::event("request-valid", "published");
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Instant;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for command durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
}

/// Handle onto the installed Prometheus recorder.
///
/// Rendering a registry without a recorder yields an empty exposition.
#[derive(Clone, Default)]
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
    /// A registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self::default()
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
/// Installs the process-wide Prometheus recorder; call once at startup.
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

fn register_metric_descriptions() {
    describe_counter!("consent_commands_total", "Commands handled, by type and outcome");
    describe_histogram!(
        "consent_command_duration_seconds",
        "Command handling duration in seconds, retries included"
    );
    describe_counter!(
        "consent_command_conflicts_total",
        "Optimistic concurrency conflicts on append"
    );
    describe_counter!("consent_events_appended_total", "Events committed to the event log");
    describe_counter!(
        "consent_bus_handler_failures_total",
        "Event bus handler failures, by handler"
    );
    describe_counter!("consent_saga_commands_total", "Commands emitted by sagas");
    describe_counter!(
        "consent_bridge_events_total",
        "Bridge events handled or published, by name and outcome"
    );
    describe_counter!("consent_errors_total", "Errors constructed, by code");
}

/// Command handling metrics.
pub struct CommandMetrics;

impl CommandMetrics {
    /// Start timing a command; the timer records count and duration on finish.
    pub fn start(command_type: &str) -> CommandTimer {
        CommandTimer {
            start: Instant::now(),
            command_type: command_type.to_string(),
        }
    }

    /// Record an append that lost the optimistic version race.
    pub fn conflict(aggregate_type: &str) {
        counter!(
            "consent_command_conflicts_total",
            "aggregate_type" => aggregate_type.to_string(),
        )
        .increment(1);
    }

    /// Record committed events.
    pub fn appended(aggregate_type: &str, count: usize) {
        counter!(
            "consent_events_appended_total",
            "aggregate_type" => aggregate_type.to_string(),
        )
        .increment(count as u64);
    }
}

/// Timer for a single command dispatch.
pub struct CommandTimer {
    start: Instant,
    command_type: String,
}

impl CommandTimer {
    /// Finish timing and record the outcome.
    pub fn finish(self, outcome: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        histogram!(
            "consent_command_duration_seconds",
            "command_type" => self.command_type.clone(),
        )
        .record(duration);
        counter!(
            "consent_commands_total",
            "command_type" => self.command_type,
            "outcome" => outcome.to_string(),
        )
        .increment(1);
    }
}

/// Event bus and saga metrics.
pub struct BusMetrics;

impl BusMetrics {
    pub fn handler_failed(handler: &str) {
        counter!(
            "consent_bus_handler_failures_total",
            "handler" => handler.to_string(),
        )
        .increment(1);
    }

    pub fn saga_commands(saga: &str, count: usize) {
        counter!("consent_saga_commands_total", "saga" => saga.to_string()).increment(count as u64);
    }
}

/// Bridge channel metrics.
pub struct BridgeMetrics;

impl BridgeMetrics {
    /// Record a bridge event by name and outcome (`published`, `ignored`, `retry`, `errored`, ...).
    pub fn event(name: &str, outcome: &str) {
        counter!(
            "consent_bridge_events_total",
            "name" => name.to_string(),
            "outcome" => outcome.to_string(),
        )
        .increment(1);
    }
}

//! Prometheus metrics for plugin lifecycle execution.

use prometheus::{Counter, Histogram, HistogramOpts, HistogramVec, Registry};

use crate::error::{Error, Result};
use crate::lifecycle::Operation;

/// Configuration for plugin metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all plugin metrics.
    pub prefix: String,
    /// Whether to collect per-operation timing histograms.
    pub detailed_timing: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "stagehand_plugin".to_string(),
            detailed_timing: true,
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Enable or disable per-operation timing.
    pub fn with_detailed_timing(mut self, enabled: bool) -> Self {
        self.detailed_timing = enabled;
        self
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::configuration(format!("metrics: {}", e))
}

fn counter(registry: &Registry, name: String, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help).map_err(metric_error)?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(metric_error)?;
    Ok(counter)
}

/// Plugin lifecycle metrics collector.
pub struct PluginMetrics {
    config: MetricsConfig,
    registry: Registry,
    plugins_started: Counter,
    lifecycle_failures: Counter,
    timeouts: Counter,
    panics: Counter,
    loads_failed: Counter,
    rollbacks: Counter,
    rollback_failures: Counter,
    load_duration: Histogram,
    operation_duration: HistogramVec,
}

impl PluginMetrics {
    /// Create a collector with its own Prometheus registry.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let prefix = config.prefix.clone();

        let load_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_load_duration_seconds", prefix),
                "Duration of a full plugin load in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )
        .map_err(metric_error)?;
        registry
            .register(Box::new(load_duration.clone()))
            .map_err(metric_error)?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_operation_duration_seconds", prefix),
                "Duration of a single lifecycle operation in seconds",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["operation"],
        )
        .map_err(metric_error)?;
        registry
            .register(Box::new(operation_duration.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            plugins_started: counter(
                &registry,
                format!("{}_started_total", prefix),
                "Plugins that completed start",
            )?,
            lifecycle_failures: counter(
                &registry,
                format!("{}_failures_total", prefix),
                "Failed lifecycle operations",
            )?,
            timeouts: counter(
                &registry,
                format!("{}_timeouts_total", prefix),
                "Lifecycle operations that timed out",
            )?,
            panics: counter(
                &registry,
                format!("{}_panics_total", prefix),
                "Lifecycle operations that panicked",
            )?,
            loads_failed: counter(
                &registry,
                format!("{}_loads_failed_total", prefix),
                "Loads that ended in an error",
            )?,
            rollbacks: counter(
                &registry,
                format!("{}_rollbacks_total", prefix),
                "Rollbacks performed",
            )?,
            rollback_failures: counter(
                &registry,
                format!("{}_rollback_failures_total", prefix),
                "Plugins that failed to roll back cleanly",
            )?,
            config,
            registry,
            load_duration,
            operation_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one lifecycle operation.
    pub fn record_operation(
        &self,
        operation: Operation,
        duration_secs: f64,
        result: &Result<std::time::Duration>,
    ) {
        if self.config.detailed_timing {
            let label = operation.to_string();
            self.operation_duration
                .with_label_values(&[label.as_str()])
                .observe(duration_secs);
        }
        match result {
            Ok(_) if operation == Operation::Start => self.plugins_started.inc(),
            Ok(_) => {}
            Err(e) => {
                self.lifecycle_failures.inc();
                if e.is_timeout() {
                    self.timeouts.inc();
                } else if e.is_panic() {
                    self.panics.inc();
                }
            }
        }
    }

    /// Record a completed load.
    pub fn record_load(&self, duration_secs: f64, succeeded: bool) {
        self.load_duration.observe(duration_secs);
        if !succeeded {
            self.loads_failed.inc();
        }
    }

    /// Record a rollback and how many plugins failed to undo.
    pub fn record_rollback(&self, failed: usize) {
        self.rollbacks.inc();
        self.rollback_failures.inc_by(failed as f64);
    }

    /// Plugins that completed start.
    pub fn plugins_started_total(&self) -> u64 {
        self.plugins_started.get() as u64
    }

    /// Failed lifecycle operations.
    pub fn lifecycle_failures_total(&self) -> u64 {
        self.lifecycle_failures.get() as u64
    }

    /// Timed-out lifecycle operations.
    pub fn timeouts_total(&self) -> u64 {
        self.timeouts.get() as u64
    }

    /// Panicked lifecycle operations.
    pub fn panics_total(&self) -> u64 {
        self.panics.get() as u64
    }

    /// Rollbacks performed.
    pub fn rollbacks_total(&self) -> u64 {
        self.rollbacks.get() as u64
    }
}

impl std::fmt::Debug for PluginMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMetrics")
            .field("config", &self.config)
            .field("plugins_started", &self.plugins_started_total())
            .field("lifecycle_failures", &self.lifecycle_failures_total())
            .field("rollbacks", &self.rollbacks_total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metrics_config_builder() {
        let config = MetricsConfig::new()
            .with_prefix("test")
            .with_detailed_timing(false);

        assert_eq!(config.prefix, "test");
        assert!(!config.detailed_timing);
    }

    #[test]
    fn test_metrics_recording() {
        let metrics = PluginMetrics::new(MetricsConfig::default()).unwrap();

        metrics.record_operation(Operation::Start, 0.01, &Ok(Duration::from_millis(10)));
        metrics.record_operation(Operation::Initialize, 0.01, &Ok(Duration::from_millis(10)));
        metrics.record_operation(
            Operation::Initialize,
            1.0,
            &Err(Error::Timeout {
                plugin: "db".into(),
                operation: Operation::Initialize,
                timeout: Duration::from_secs(1),
            }),
        );
        metrics.record_load(1.2, false);
        metrics.record_rollback(1);

        assert_eq!(metrics.plugins_started_total(), 1);
        assert_eq!(metrics.lifecycle_failures_total(), 1);
        assert_eq!(metrics.timeouts_total(), 1);
        assert_eq!(metrics.panics_total(), 0);
        assert_eq!(metrics.rollbacks_total(), 1);
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let result = PluginMetrics::new(MetricsConfig::new().with_prefix("bad prefix"));
        assert!(result.is_err());
    }
}

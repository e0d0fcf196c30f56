//! Plugin manager: registration, load, unload, and introspection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};

use crate::config::{Config, ExecutionLimits, LifecycleSettings};
use crate::error::{Error, Result};
use crate::executor::{run_operation, LoadRun, Recorder, Semaphore};
use crate::graph::{self, LeveledPlugin};
use crate::lifecycle::{EventKind, EventSink, LifecycleState, Operation, PluginEvent, MANAGER_EVENT_SOURCE};
use crate::plugin::{Plugin, PluginHandle, PluginInfo};
use crate::registry::{PluginRegistry, RegistryConfig, RegistryStats};
use crate::resources::{ResourceInfo, ResourceRegistry, ResourceStats};
use crate::runtime::Runtime;

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::PluginMetrics;

/// Default capacity of the unload failure log.
pub const DEFAULT_UNLOAD_FAILURE_CAPACITY: usize = 100;

/// Configuration for the plugin manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Plugin registry configuration.
    pub registry: RegistryConfig,
    /// Configuration section holding [`LifecycleSettings`].
    pub settings_section: String,
    /// Settings used instead of the configuration section, when set.
    pub settings_override: Option<LifecycleSettings>,
    /// Maximum number of unload failures retained.
    pub unload_failure_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            settings_section: "plugins".to_string(),
            settings_override: None,
            unload_failure_capacity: DEFAULT_UNLOAD_FAILURE_CAPACITY,
        }
    }
}

impl ManagerConfig {
    /// Create a new manager configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry configuration.
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Read lifecycle settings from a different section.
    pub fn with_settings_section(mut self, section: impl Into<String>) -> Self {
        self.settings_section = section.into();
        self
    }

    /// Use these settings instead of reading configuration.
    pub fn with_settings(mut self, settings: LifecycleSettings) -> Self {
        self.settings_override = Some(settings);
        self
    }

    /// Set the unload failure log capacity.
    pub fn with_unload_failure_capacity(mut self, capacity: usize) -> Self {
        self.unload_failure_capacity = capacity.max(1);
        self
    }
}

/// A plugin that did not unload cleanly.
#[derive(Debug, Clone)]
pub struct UnloadFailure {
    /// Plugin ID.
    pub plugin_id: String,
    /// Plugin name.
    pub plugin_name: String,
    /// When the failure was recorded.
    pub at: SystemTime,
    /// Stop failure, if any.
    pub stop_error: Option<String>,
    /// Resource cleanup failure, if any.
    pub cleanup_error: Option<String>,
}

/// Summary of an unload run.
#[derive(Debug, Clone, Default)]
pub struct UnloadSummary {
    /// Plugins that were running when unload began.
    pub attempted: usize,
    /// Plugins stopped and cleaned up without error.
    pub stopped: usize,
    /// Plugins with a failure (see [`PluginManager::unload_failures`]).
    pub failed: usize,
    /// Whether the overall deadline cut the run short.
    pub deadline_exceeded: bool,
    /// Total time spent.
    pub duration: Duration,
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// The health check passed.
    Healthy,
    /// The health check failed.
    Unhealthy(String),
    /// The plugin does not implement a health check.
    Unsupported,
}

/// Owns the registered plugins, the shared runtime, and the plan of the last load.
pub struct PluginManager {
    config: ManagerConfig,
    registry: PluginRegistry,
    runtime: Runtime,
    plan: RwLock<Vec<LeveledPlugin>>,
    unload_failures: Mutex<VecDeque<UnloadFailure>>,
    run_lock: Mutex<()>,
    recorder: Recorder,
}

impl PluginManager {
    /// Create a manager over `config` with in-process lifecycle hooks as event sink.
    pub fn new(config: Arc<Config>, manager_config: ManagerConfig) -> Self {
        Self {
            registry: PluginRegistry::new(manager_config.registry.clone()),
            config: manager_config,
            runtime: Runtime::new(config),
            plan: RwLock::new(Vec::new()),
            unload_failures: Mutex::new(VecDeque::new()),
            run_lock: Mutex::new(()),
            recorder: Recorder::default(),
        }
    }

    /// Create a manager with default settings and an empty configuration.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(Config::empty()), ManagerConfig::default())
    }

    /// Send lifecycle events to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.runtime = self.runtime.with_event_sink(sink);
        self
    }

    /// Record into `metrics`.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(mut self, metrics: Arc<PluginMetrics>) -> Self {
        self.recorder = Recorder::new(Some(metrics));
        self
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get the runtime shared by all plugins.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Get the plugin registry.
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Get the resource registry.
    pub fn resources(&self) -> &ResourceRegistry {
        self.runtime.resources()
    }

    /// Register a plugin.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<PluginHandle> {
        self.registry.register(plugin)
    }

    /// Register several plugins, stopping at the first error.
    pub fn register_all<I>(&self, plugins: I) -> Result<()>
    where
        I: IntoIterator<Item = Arc<dyn Plugin>>,
    {
        for plugin in plugins {
            self.registry.register(plugin)?;
        }
        Ok(())
    }

    /// Resolve limits for one run.
    pub fn limits(&self) -> Result<ExecutionLimits> {
        let settings = match &self.config.settings_override {
            Some(settings) => settings.clone(),
            None => LifecycleSettings::from_config(
                self.runtime.config(),
                &self.config.settings_section,
            )?,
        };
        Ok(settings.resolve())
    }

    /// Resolve and start every registered plugin.
    pub fn load(&self) -> Result<()> {
        self.run_load(self.registry.all())
    }

    /// Resolve and start only the named plugins.
    ///
    /// Required dependencies outside the subset are reported as missing.
    pub fn load_only(&self, ids: &[&str]) -> Result<()> {
        let targets = ids
            .iter()
            .map(|id| {
                self.registry
                    .get(id)
                    .ok_or_else(|| Error::plugin_not_found(*id))
            })
            .collect::<Result<Vec<_>>>()?;
        self.run_load(targets)
    }

    fn run_load(&self, targets: Vec<PluginHandle>) -> Result<()> {
        let _guard = self.run_lock.lock();
        let span = tracing::info_span!("plugin_load", plugins = targets.len());
        let _enter = span.enter();
        let began = Instant::now();

        let result = self.prepare_and_execute(&targets);
        let took = began.elapsed();
        self.recorder.load(took, result.is_ok());

        match &result {
            Ok(()) => tracing::info!(
                plugins = targets.len(),
                took_ms = took.as_millis() as u64,
                "plugins loaded"
            ),
            Err(e) => tracing::error!(
                error = %e,
                took_ms = took.as_millis() as u64,
                "plugin load failed"
            ),
        }
        result
    }

    fn prepare_and_execute(&self, targets: &[PluginHandle]) -> Result<()> {
        for handle in targets {
            let state = handle.state();
            if state != LifecycleState::Created {
                return Err(Error::invalid_state(handle.id(), "created", state.to_string()));
            }
        }

        let limits = self.limits()?;
        let plugins: Vec<Arc<dyn Plugin>> = targets.iter().map(|h| h.plugin().clone()).collect();
        let order = graph::resolve(&plugins)?;
        *self.plan.write() = order.clone();

        let levels: Vec<Vec<PluginHandle>> = graph::group_by_level(&order)
            .into_iter()
            .map(|level| {
                level
                    .iter()
                    .filter_map(|p| targets.iter().find(|h| h.id() == p.id()).cloned())
                    .collect()
            })
            .collect();

        tracing::info!(
            plugins = order.len(),
            levels = levels.len(),
            start_parallelism = limits.start_parallelism(),
            init_timeout_ms = limits.init_timeout().as_millis() as u64,
            start_timeout_ms = limits.start_timeout().as_millis() as u64,
            "starting plugins"
        );

        LoadRun::new(&self.runtime, limits, &self.recorder).execute(&levels)
    }

    /// Stop every running plugin in reverse dependency order and release its resources.
    ///
    /// Failures are recorded (see [`unload_failures`](Self::unload_failures)),
    /// not returned.
    pub fn unload_all(&self) -> UnloadSummary {
        let _guard = self.run_lock.lock();
        let span = tracing::info_span!("plugin_unload");
        let _enter = span.enter();
        let began = Instant::now();

        let limits = match self.limits() {
            Ok(limits) => limits,
            Err(e) => {
                tracing::warn!(error = %e, "invalid lifecycle settings, using defaults for unload");
                ExecutionLimits::default()
            }
        };

        self.runtime.emit(
            PluginEvent::new(MANAGER_EVENT_SOURCE, EventKind::ManagerShutdown)
                .with("plugins", self.registry.len() as u64),
        );

        let levels = self.unload_levels();
        let attempted: usize = levels.iter().map(Vec::len).sum();
        let deadline = began + limits.unload_total_timeout();
        let semaphore = Semaphore::new(limits.unload_parallelism());
        let mut summary = UnloadSummary {
            attempted,
            ..UnloadSummary::default()
        };

        for level in levels {
            if Instant::now() >= deadline {
                summary.deadline_exceeded = true;
                for handle in &level {
                    self.record_unload_failure(
                        handle,
                        Some("unload deadline exceeded before stop".to_string()),
                        None,
                    );
                    summary.failed += 1;
                }
                continue;
            }

            let outcomes: Vec<bool> = std::thread::scope(|s| {
                let workers: Vec<_> = level
                    .iter()
                    .map(|handle| {
                        let semaphore = &semaphore;
                        s.spawn(move || {
                            let _permit = semaphore.acquire();
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            let timeout = limits.stop_timeout().min(remaining).max(Duration::from_millis(1));
                            self.stop_and_cleanup(handle, timeout)
                        })
                    })
                    .collect();
                workers
                    .into_iter()
                    .zip(&level)
                    .map(|(worker, handle)| match worker.join() {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            self.record_unload_failure(
                                handle,
                                Some("unload worker panicked".to_string()),
                                None,
                            );
                            false
                        }
                    })
                    .collect()
            });

            for ok in outcomes {
                if ok {
                    summary.stopped += 1;
                } else {
                    summary.failed += 1;
                }
            }
        }

        summary.duration = began.elapsed();
        if summary.failed > 0 {
            tracing::warn!(
                stopped = summary.stopped,
                failed = summary.failed,
                deadline_exceeded = summary.deadline_exceeded,
                took_ms = summary.duration.as_millis() as u64,
                "plugins unloaded with failures"
            );
        } else {
            tracing::info!(
                stopped = summary.stopped,
                took_ms = summary.duration.as_millis() as u64,
                "plugins unloaded"
            );
        }
        summary
    }

    /// Running plugins grouped for unload: reverse dependency levels, or
    /// reverse registration order if the registered set no longer resolves.
    fn unload_levels(&self) -> Vec<Vec<PluginHandle>> {
        let all = self.registry.all();
        let plugins: Vec<Arc<dyn Plugin>> = all.iter().map(|h| h.plugin().clone()).collect();

        match graph::resolve(&plugins) {
            Ok(order) => graph::group_by_level(&order)
                .into_iter()
                .rev()
                .map(|level| {
                    level
                        .iter()
                        .rev()
                        .filter_map(|p| all.iter().find(|h| h.id() == p.id()))
                        .filter(|h| h.state() == LifecycleState::Active)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .filter(|level| !level.is_empty())
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "cannot resolve order for unload, using reverse registration order");
                all.into_iter()
                    .rev()
                    .filter(|h| h.state() == LifecycleState::Active)
                    .map(|h| vec![h])
                    .collect()
            }
        }
    }

    fn stop_and_cleanup(&self, handle: &PluginHandle, timeout: Duration) -> bool {
        let stop_error = run_operation(handle, Operation::Stop, &self.runtime, timeout, &self.recorder)
            .err()
            .map(|e| e.to_string());
        let cleanup_error = self
            .runtime
            .resources()
            .cleanup(handle.id())
            .err()
            .map(|e| e.to_string());

        if stop_error.is_none() && cleanup_error.is_none() {
            return true;
        }
        self.record_unload_failure(handle, stop_error, cleanup_error);
        false
    }

    fn record_unload_failure(
        &self,
        handle: &PluginHandle,
        stop_error: Option<String>,
        cleanup_error: Option<String>,
    ) {
        tracing::warn!(
            plugin_id = handle.id(),
            stop_error = ?stop_error,
            cleanup_error = ?cleanup_error,
            "plugin did not unload cleanly"
        );
        let capacity = self.config.unload_failure_capacity.max(1);
        let mut failures = self.unload_failures.lock();
        while failures.len() >= capacity {
            failures.pop_front();
        }
        failures.push_back(UnloadFailure {
            plugin_id: handle.id().to_string(),
            plugin_name: handle.name().to_string(),
            at: SystemTime::now(),
            stop_error,
            cleanup_error,
        });
    }

    /// Stop one running plugin and release its resources.
    pub fn stop_plugin(&self, id: &str) -> Result<()> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| Error::plugin_not_found(id))?;
        let state = handle.state();
        if !state.can_stop() {
            return Err(Error::invalid_state(id, "active", state.to_string()));
        }

        let limits = self.limits()?;
        let stopped = run_operation(
            &handle,
            Operation::Stop,
            &self.runtime,
            limits.stop_timeout(),
            &self.recorder,
        );
        let cleaned = self.runtime.resources().cleanup(id);
        stopped?;
        cleaned.map(|_| ())
    }

    /// Recorded unload failures, oldest first.
    pub fn unload_failures(&self) -> Vec<UnloadFailure> {
        self.unload_failures.lock().iter().cloned().collect()
    }

    /// Forget recorded unload failures.
    pub fn clear_unload_failures(&self) {
        self.unload_failures.lock().clear();
    }

    /// The leveled plan of the last load.
    pub fn plan(&self) -> Vec<LeveledPlugin> {
        self.plan.read().clone()
    }

    /// Get a plugin handle.
    pub fn plugin(&self, id: &str) -> Option<PluginHandle> {
        self.registry.get(id)
    }

    /// Get a plugin's lifecycle state.
    pub fn status(&self, id: &str) -> Option<LifecycleState> {
        self.registry.get(id).map(|h| h.state())
    }

    /// Info for every registered plugin, in registration order.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.registry.info()
    }

    /// Registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Check one plugin's health.
    pub fn health(&self, id: &str) -> Result<HealthStatus> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| Error::plugin_not_found(id))?;
        Ok(health_of(&handle))
    }

    /// Check every registered plugin, sorted by ID.
    pub fn health_report(&self) -> Vec<(String, HealthStatus)> {
        let mut report: Vec<(String, HealthStatus)> = self
            .registry
            .all()
            .iter()
            .map(|h| (h.id().to_string(), health_of(h)))
            .collect();
        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Aggregate resource counts.
    pub fn resource_stats(&self) -> ResourceStats {
        self.runtime.resources().stats()
    }

    /// Every resource, shared and private.
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        self.runtime.resources().list()
    }
}

fn health_of(handle: &PluginHandle) -> HealthStatus {
    let Some(check) = handle.plugin().as_health_check() else {
        return HealthStatus::Unsupported;
    };
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| check.check_health())) {
        Ok(Ok(())) => HealthStatus::Healthy,
        Ok(Err(e)) => HealthStatus::Unhealthy(e.to_string()),
        Err(payload) => HealthStatus::Unhealthy(format!(
            "health check panicked: {}",
            crate::executor::panic_message(payload.as_ref())
        )),
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("plan", &self.plan.read().len())
            .finish()
    }
}

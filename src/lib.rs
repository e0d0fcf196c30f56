//! # stagehand
//!
//! In-process plugin runtime: dependency-leveled startup, bounded parallelism,
//! per-call timeouts, panic isolation, rollback, and namespaced resources.
//!
//! This crate provides:
//! - **Dependency Resolution** - Order plugins into levels from their required dependencies
//! - **Phased Execution** - Initialize and start each level in parallel, with a barrier between levels
//! - **Timeouts and Panic Isolation** - Every lifecycle call is bounded and a panic becomes an error
//! - **Rollback** - A failed load stops what already started, newest first
//! - **Resources** - A shared namespace plus one private namespace per plugin
//! - **Bootstrap** - A one-time gate producing the process-wide application handle
//! - **Metrics Hooks** - Optional Prometheus counters and histograms
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stagehand::{Config, ManagerConfig, PluginManager};
//!
//! let config = Config::from_toml_str(r#"
//!     [plugins]
//!     start_parallelism = 4
//!     init_timeout = "10s"
//! "#)?;
//!
//! let manager = PluginManager::new(Arc::new(config), ManagerConfig::default());
//! manager.register(Arc::new(Database::new()))?;
//! manager.register(Arc::new(HttpServer::new()))?;
//!
//! manager.load()?;
//! // ...
//! manager.unload_all();
//! ```
//!
//! ## Feature Flags
//!
//! - `metrics-prometheus`: Prometheus metrics integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod bootstrap;
mod config;
mod error;
mod executor;
mod graph;
mod lifecycle;
mod manager;
mod plugin;
mod registry;
mod resources;
mod rollback;
mod runtime;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use bootstrap::{Application, BootstrapGate, DEFAULT_APP_VERSION};
pub use config::{
    Config, ExecutionLimits, LifecycleSettings, DEFAULT_OPERATION_TIMEOUT,
    DEFAULT_START_PARALLELISM, DEFAULT_UNLOAD_PARALLELISM, DEFAULT_UNLOAD_TOTAL_TIMEOUT,
    MAX_START_TIMEOUT, MAX_STOP_TIMEOUT, MAX_UNLOAD_PARALLELISM, MAX_UNLOAD_TOTAL_TIMEOUT,
    MIN_OPERATION_TIMEOUT, MIN_UNLOAD_TOTAL_TIMEOUT,
};
pub use error::{Error, ErrorKind, Result};
pub use executor::{Semaphore, SemaphorePermit};
pub use graph::{group_by_level, resolve, DependencyGraph, LeveledPlugin};
pub use lifecycle::{
    EventKind, EventSink, LifecycleHooks, LifecycleState, NullSink, Operation, PluginEvent,
    MANAGER_EVENT_SOURCE,
};
pub use manager::{
    HealthStatus, ManagerConfig, PluginManager, UnloadFailure, UnloadSummary,
    DEFAULT_UNLOAD_FAILURE_CAPACITY,
};
pub use plugin::{
    CancelSignal, CancellableLifecycle, Dependency, HealthCheck, Plugin, PluginHandle, PluginInfo,
    StatusAware,
};
pub use registry::{PluginRegistry, RegistryConfig, RegistryStats};
pub use resources::{ResourceInfo, ResourceRegistry, ResourceScope, ResourceStats, ResourceValue};
pub use rollback::{RollbackOutcome, RollbackReport};
pub use runtime::{PluginContext, Runtime};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{MetricsConfig, PluginMetrics};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for plugin runtime operations.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::Operation;
use crate::rollback::RollbackReport;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or invalid configuration, detected before any plugin work.
    Configuration,
    /// Invalid plugin metadata or an unresolvable dependency graph.
    Dependency,
    /// A lifecycle operation exceeded its deadline.
    Timeout,
    /// A lifecycle operation panicked.
    Panic,
    /// A plugin reported a failure from one of its lifecycle operations.
    Lifecycle,
    /// Resource lookup or registration problem.
    Resource,
    /// A load failed and the rollback that followed also had failures.
    Rollback,
    /// Plugin instance registry problem.
    Registry,
}

/// Errors that can occur during plugin runtime operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Configuration missing, unparsable, or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two distinct plugin instances share an ID.
    #[error("duplicate plugin ID {id} (plugins {first} and {second})")]
    DuplicatePlugin {
        /// The shared ID.
        id: String,
        /// Name of the first plugin seen with this ID.
        first: String,
        /// Name of the second plugin seen with this ID.
        second: String,
    },

    /// A dependency declaration has an empty target ID.
    #[error("plugin {plugin} declares a dependency with an empty target ID")]
    EmptyDependency {
        /// Plugin owning the invalid declaration.
        plugin: String,
    },

    /// A required dependency is not present in the plugin set.
    #[error("plugin {plugin} requires missing plugin {dependency}")]
    MissingDependency {
        /// Plugin declaring the dependency.
        plugin: String,
        /// Target that could not be found.
        dependency: String,
    },

    /// The required-dependency graph contains a cycle.
    #[error("cyclic dependency detected at plugin {plugin} (path: {path})")]
    CyclicDependency {
        /// Node at which the cycle was closed.
        plugin: String,
        /// Rendered cycle path, e.g. `a -> b -> a`.
        path: String,
    },

    /// Plugin metadata could not be read while building the graph.
    #[error("plugin {plugin} has invalid metadata: {message}")]
    InvalidPlugin {
        /// Plugin whose metadata accessor failed.
        plugin: String,
        /// Panic payload rendered as text.
        message: String,
    },

    /// A lifecycle operation did not finish before its deadline.
    #[error("{operation} timeout after {timeout:?} for plugin {plugin}")]
    Timeout {
        /// Plugin whose operation timed out.
        plugin: String,
        /// Operation that timed out.
        operation: Operation,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// A lifecycle operation panicked.
    #[error("panic in {operation} of {plugin}: {message}")]
    Panic {
        /// Plugin whose operation panicked.
        plugin: String,
        /// Operation that panicked.
        operation: Operation,
        /// Panic payload rendered as text.
        message: String,
        /// Stack trace captured at the panic site.
        backtrace: String,
    },

    /// A plugin returned an error from a lifecycle operation.
    #[error("failed to {operation} plugin {plugin}: {source}")]
    Lifecycle {
        /// Plugin that failed.
        plugin: String,
        /// Operation that failed.
        operation: Operation,
        /// Error reported by the plugin.
        source: Box<Error>,
    },

    /// Failure reported by plugin code.
    #[error("{0}")]
    Plugin(String),

    /// Resource does not exist.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid resource registration parameters.
    #[error("invalid resource: {0}")]
    InvalidResource(String),

    /// Resource exists but holds a different type.
    #[error("resource {name} is not of type {expected}")]
    ResourceTypeMismatch {
        /// Resource name.
        name: String,
        /// Requested type.
        expected: String,
    },

    /// One or more resource release hooks failed during cleanup.
    #[error("resource cleanup for plugin {plugin} had {failures} errors: {first}")]
    ResourceCleanup {
        /// Plugin whose resources were being cleaned up.
        plugin: String,
        /// Number of failed releases.
        failures: usize,
        /// First failure message.
        first: String,
    },

    /// A load failed; every started plugin was rolled back cleanly.
    #[error("plugin startup failed: {cause} ({report})")]
    StartupAborted {
        /// The error that triggered the rollback.
        cause: Box<Error>,
        /// Outcome of the rollback.
        report: RollbackReport,
    },

    /// A load failed and the rollback had failures of its own.
    #[error("plugin startup failed, rollback had {} failures: {cause} ({report})", .report.failed)]
    RollbackFailed {
        /// The error that triggered the rollback.
        cause: Box<Error>,
        /// Outcome of the rollback.
        report: RollbackReport,
    },

    /// Plugin not registered.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin ID already registered.
    #[error("plugin already registered: {0}")]
    PluginAlreadyRegistered(String),

    /// Plugin in an invalid state for the requested operation.
    #[error("invalid state for plugin {plugin}: expected {expected}, got {actual}")]
    InvalidState {
        /// Plugin ID.
        plugin: String,
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Registry error.
    #[error("registry error: {0}")]
    Registry(String),
}

impl Error {
    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an error reported by plugin code.
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    /// Create a missing dependency error.
    pub fn missing_dependency(plugin: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::MissingDependency {
            plugin: plugin.into(),
            dependency: dependency.into(),
        }
    }

    /// Create a resource not found error.
    pub fn resource_not_found(name: impl Into<String>) -> Self {
        Self::ResourceNotFound(name.into())
    }

    /// Create an invalid resource error.
    pub fn invalid_resource(msg: impl Into<String>) -> Self {
        Self::InvalidResource(msg.into())
    }

    /// Create a plugin not found error.
    pub fn plugin_not_found(id: impl Into<String>) -> Self {
        Self::PluginNotFound(id.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(
        plugin: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            plugin: plugin.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::DuplicatePlugin { .. }
            | Self::EmptyDependency { .. }
            | Self::MissingDependency { .. }
            | Self::CyclicDependency { .. }
            | Self::InvalidPlugin { .. } => ErrorKind::Dependency,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Panic { .. } => ErrorKind::Panic,
            Self::Lifecycle { .. } | Self::Plugin(_) => ErrorKind::Lifecycle,
            Self::ResourceNotFound(_)
            | Self::InvalidResource(_)
            | Self::ResourceTypeMismatch { .. }
            | Self::ResourceCleanup { .. } => ErrorKind::Resource,
            Self::RollbackFailed { .. } => ErrorKind::Rollback,
            Self::StartupAborted { cause, .. } => cause.kind(),
            Self::PluginNotFound(_)
            | Self::PluginAlreadyRegistered(_)
            | Self::InvalidState { .. }
            | Self::Registry(_) => ErrorKind::Registry,
        }
    }

    /// Returns true for dependency resolution errors.
    pub fn is_dependency_error(&self) -> bool {
        self.kind() == ErrorKind::Dependency
    }

    /// Returns true if this error, or the failure that triggered a rollback, is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Timeout { .. })
    }

    /// Returns true if this error, or the failure that triggered a rollback, is a panic.
    pub fn is_panic(&self) -> bool {
        matches!(self.root_cause(), Self::Panic { .. })
    }

    /// Returns true if a fresh attempt may succeed without changing configuration.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
    }

    /// The failure that triggered a rollback, or `self` for any other error.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::StartupAborted { cause, .. } | Self::RollbackFailed { cause, .. } => {
                cause.root_cause()
            }
            other => other,
        }
    }

    /// Rollback outcome attached to a failed load, if any.
    pub fn rollback_report(&self) -> Option<&RollbackReport> {
        match self {
            Self::StartupAborted { report, .. } | Self::RollbackFailed { report, .. } => {
                Some(report)
            }
            _ => None,
        }
    }

    /// ID of the plugin this error is about, when it names exactly one.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::EmptyDependency { plugin }
            | Self::MissingDependency { plugin, .. }
            | Self::CyclicDependency { plugin, .. }
            | Self::InvalidPlugin { plugin, .. }
            | Self::Timeout { plugin, .. }
            | Self::Panic { plugin, .. }
            | Self::Lifecycle { plugin, .. }
            | Self::ResourceCleanup { plugin, .. }
            | Self::InvalidState { plugin, .. } => Some(plugin),
            Self::DuplicatePlugin { id, .. } => Some(id),
            Self::PluginNotFound(id) | Self::PluginAlreadyRegistered(id) => Some(id),
            Self::StartupAborted { cause, .. } | Self::RollbackFailed { cause, .. } => {
                cause.plugin_id()
            }
            _ => None,
        }
    }
}

//! Plugin lifecycle states, events, and event hooks.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::SystemTime;

use serde_json::Value;

/// Source ID used for events emitted by the manager itself rather than a plugin.
pub const MANAGER_EVENT_SOURCE: &str = "plugin-manager";

/// Plugin lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Plugin has been registered but not initialized.
    Created,
    /// Initialize is in progress.
    Initializing,
    /// Plugin has been initialized and is ready to start.
    Inactive,
    /// Start is in progress.
    Starting,
    /// Plugin is running.
    Active,
    /// Stop is in progress.
    Stopping,
    /// Plugin has been stopped.
    Terminated,
    /// A lifecycle operation failed, timed out, or panicked.
    Failed,
}

impl LifecycleState {
    /// Check if the plugin can be initialized.
    pub fn can_initialize(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Check if the plugin can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Inactive)
    }

    /// Check if the plugin can be stopped.
    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the plugin is in a terminal state for the current run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Check if an operation is currently in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Initializing | Self::Starting | Self::Stopping)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Inactive => "inactive",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// A lifecycle operation driven by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `Plugin::initialize`.
    Initialize,
    /// `Plugin::start`.
    Start,
    /// `Plugin::stop`.
    Stop,
}

impl Operation {
    /// State the plugin is in while this operation runs.
    pub fn in_progress_state(&self) -> LifecycleState {
        match self {
            Self::Initialize => LifecycleState::Initializing,
            Self::Start => LifecycleState::Starting,
            Self::Stop => LifecycleState::Stopping,
        }
    }

    /// State the plugin moves to when this operation succeeds.
    pub fn success_state(&self) -> LifecycleState {
        match self {
            Self::Initialize => LifecycleState::Inactive,
            Self::Start => LifecycleState::Active,
            Self::Stop => LifecycleState::Terminated,
        }
    }

    /// Event emitted before the operation runs.
    pub fn begin_event(&self) -> EventKind {
        match self {
            Self::Initialize => EventKind::Initializing,
            Self::Start => EventKind::Starting,
            Self::Stop => EventKind::Stopping,
        }
    }

    /// Event emitted after the operation succeeds.
    pub fn end_event(&self) -> EventKind {
        match self {
            Self::Initialize => EventKind::Initialized,
            Self::Start => EventKind::Started,
            Self::Stop => EventKind::Stopped,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::Start => "start",
            Self::Stop => "stop",
        };
        write!(f, "{}", name)
    }
}

/// Kind of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Initialize is about to run.
    Initializing,
    /// Initialize succeeded.
    Initialized,
    /// Start is about to run.
    Starting,
    /// Start succeeded.
    Started,
    /// Stop is about to run.
    Stopping,
    /// Stop succeeded.
    Stopped,
    /// A lifecycle operation or cleanup failed.
    ErrorOccurred,
    /// A rollback finished.
    RollbackCompleted,
    /// The manager is unloading every plugin.
    ManagerShutdown,
}

impl EventKind {
    /// Get the event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "plugin.initializing",
            Self::Initialized => "plugin.initialized",
            Self::Starting => "plugin.starting",
            Self::Started => "plugin.started",
            Self::Stopping => "plugin.stopping",
            Self::Stopped => "plugin.stopped",
            Self::ErrorOccurred => "error.occurred",
            Self::RollbackCompleted => "rollback.completed",
            Self::ManagerShutdown => "system.plugin_manager_shutdown",
        }
    }
}

/// Lifecycle event delivered to an [`EventSink`].
#[derive(Debug, Clone)]
pub struct PluginEvent {
    /// Plugin the event is about, or [`MANAGER_EVENT_SOURCE`].
    pub plugin_id: String,
    /// Event kind.
    pub kind: EventKind,
    /// Wall-clock emission time.
    pub timestamp: SystemTime,
    /// Free-form metadata.
    pub metadata: HashMap<String, Value>,
}

impl PluginEvent {
    /// Create an event stamped with the current time.
    pub fn new(plugin_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            kind,
            timestamp: SystemTime::now(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get a metadata entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Fire-and-forget destination for lifecycle events.
///
/// Implementations must not block the caller for long and must not panic;
/// delivery, filtering, and history are entirely the sink's concern.
pub trait EventSink: Send + Sync {
    /// Publish an event.
    fn publish(&self, event: PluginEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: PluginEvent) {}
}

/// In-process event hooks: every published event is handed to each subscriber.
pub struct LifecycleHooks {
    handlers: Vec<Box<dyn Fn(&PluginEvent) + Send + Sync>>,
}

impl LifecycleHooks {
    /// Create new lifecycle hooks.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&PluginEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Builder-style variant of [`on_event`](Self::on_event).
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PluginEvent) + Send + Sync + 'static,
    {
        self.on_event(handler);
        self
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Emit a lifecycle event.
    pub fn emit(&self, event: &PluginEvent) {
        for handler in &self.handlers {
            // Subscriber panics stay here.
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(
                    event = event.kind.name(),
                    plugin_id = %event.plugin_id,
                    "lifecycle event handler panicked"
                );
            }
        }
    }
}

impl EventSink for LifecycleHooks {
    fn publish(&self, event: PluginEvent) {
        self.emit(&event);
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("handler_count", &self.handlers.len())
            .finish()
    }
}

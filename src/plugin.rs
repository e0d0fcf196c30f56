//! Plugin contract, optional capabilities, and handles.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;

use crate::error::Result;
use crate::executor::panic_message;
use crate::lifecycle::LifecycleState;
use crate::runtime::PluginContext;

/// Dependency on another plugin, by ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    /// ID of the plugin depended upon.
    pub target: String,
    /// Required dependencies order startup and must be present.
    pub required: bool,
}

impl Dependency {
    /// Create a new required dependency.
    pub fn required(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            required: true,
        }
    }

    /// Create a new optional dependency.
    ///
    /// Optional dependencies are validated but never affect startup order.
    pub fn optional(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            required: false,
        }
    }
}

/// The contract every plugin implements.
///
/// Lifecycle methods take `&self`: the runtime shares one instance between the
/// executor and its worker threads, so plugins keep their mutable state behind
/// their own locks or atomics.
pub trait Plugin: Send + Sync + 'static {
    /// Unique ID within any set being loaded.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str {
        self.id()
    }

    /// Plugin version.
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Tie-break hint within a dependency level; higher runs first.
    fn weight(&self) -> i32 {
        0
    }

    /// Declared dependencies.
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Prepare the plugin. Resources should be registered through `ctx`.
    fn initialize(&self, ctx: &PluginContext) -> Result<()>;

    /// Begin the plugin's main work.
    fn start(&self) -> Result<()>;

    /// Stop the plugin's work.
    fn stop(&self) -> Result<()>;

    /// Cancellation-aware lifecycle, if implemented.
    fn as_cancellable(&self) -> Option<&dyn CancellableLifecycle> {
        None
    }

    /// Status receiver, if implemented.
    fn as_status_aware(&self) -> Option<&dyn StatusAware> {
        None
    }

    /// Health check, if implemented.
    fn as_health_check(&self) -> Option<&dyn HealthCheck> {
        None
    }
}

/// Lifecycle variant that observes a [`CancelSignal`].
///
/// When a plugin exposes this through [`Plugin::as_cancellable`] the executor
/// calls these methods instead of the plain ones. The signal fires at the
/// operation deadline; implementations should return promptly once it does.
pub trait CancellableLifecycle: Send + Sync {
    /// Cancellation-aware initialize.
    fn initialize_with(&self, ctx: &PluginContext, cancel: &CancelSignal) -> Result<()>;

    /// Cancellation-aware start.
    fn start_with(&self, cancel: &CancelSignal) -> Result<()>;

    /// Cancellation-aware stop.
    fn stop_with(&self, cancel: &CancelSignal) -> Result<()>;
}

/// Receives lifecycle state changes made by the executor.
pub trait StatusAware: Send + Sync {
    /// Called after every state transition.
    fn set_status(&self, state: LifecycleState);
}

/// Reports plugin health on demand.
pub trait HealthCheck: Send + Sync {
    /// Returns `Ok(())` when healthy.
    fn check_health(&self) -> Result<()>;
}

/// Deadline-bound cooperative cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug)]
struct SignalInner {
    deadline: Option<Instant>,
    cancelled: AtomicBool,
}

impl CancelSignal {
    /// A signal that fires when `timeout` elapses or on [`cancel`](Self::cancel).
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                deadline: Instant::now().checked_add(timeout),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// A signal with no deadline; fires only on [`cancel`](Self::cancel).
    pub fn never() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                deadline: None,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Fire the signal now.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
            || self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline; `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Sleep for up to `duration`, waking early once the signal fires.
    ///
    /// Returns `true` if the full duration elapsed without cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            std::thread::sleep((until - now).min(Duration::from_millis(10)));
        }
    }
}

/// Information about a registered plugin.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Plugin ID.
    pub id: String,
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Tie-break weight.
    pub weight: i32,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// When the plugin was registered.
    pub registered_at: SystemTime,
    /// When the plugin last changed state.
    pub last_transition: Option<SystemTime>,
    /// Whether the plugin implements the cancellation-aware lifecycle.
    pub cancellable: bool,
}

struct HandleState {
    state: LifecycleState,
    registered_at: SystemTime,
    last_transition: Option<SystemTime>,
}

/// Shared reference to a registered plugin plus the state the executor keeps for it.
#[derive(Clone)]
pub struct PluginHandle {
    plugin: Arc<dyn Plugin>,
    state: Arc<RwLock<HandleState>>,
}

impl PluginHandle {
    /// Create a new plugin handle in the `Created` state.
    pub fn new(plugin: Arc<dyn Plugin>) -> Self {
        Self {
            plugin,
            state: Arc::new(RwLock::new(HandleState {
                state: LifecycleState::Created,
                registered_at: SystemTime::now(),
                last_transition: None,
            })),
        }
    }

    /// Get the plugin ID.
    pub fn id(&self) -> &str {
        self.plugin.id()
    }

    /// Get the plugin name.
    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    /// Get the plugin state.
    pub fn state(&self) -> LifecycleState {
        self.state.read().state
    }

    /// Record a state transition and forward it to the plugin if it listens.
    pub(crate) fn set_state(&self, state: LifecycleState) {
        {
            let mut guard = self.state.write();
            guard.state = state;
            guard.last_transition = Some(SystemTime::now());
        }
        if let Some(sink) = self.plugin.as_status_aware() {
            let notified = panic::catch_unwind(AssertUnwindSafe(|| sink.set_status(state)));
            if let Err(payload) = notified {
                tracing::warn!(
                    plugin_id = %self.plugin.id(),
                    state = %state,
                    "status listener panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Get plugin info.
    pub fn info(&self) -> PluginInfo {
        let guard = self.state.read();
        PluginInfo {
            id: self.plugin.id().to_string(),
            name: self.plugin.name().to_string(),
            version: self.plugin.version().to_string(),
            weight: self.plugin.weight(),
            state: guard.state,
            registered_at: guard.registered_at,
            last_transition: guard.last_transition,
            cancellable: self.plugin.as_cancellable().is_some(),
        }
    }

    /// Get the underlying plugin.
    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    /// Whether both handles refer to the same plugin instance.
    pub fn same_instance(&self, other: &PluginHandle) -> bool {
        Arc::ptr_eq(&self.plugin, &other.plugin)
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

//! Application handle and the one-time construction gate.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manager::{ManagerConfig, PluginManager};

/// Version used when `application.version` is absent.
pub const DEFAULT_APP_VERSION: &str = "0.0.0";

#[derive(Debug, Deserialize)]
struct Identity {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: Option<String>,
}

/// The running application: identity, configuration, and plugin manager.
pub struct Application {
    name: String,
    version: String,
    host: String,
    config: Arc<Config>,
    manager: PluginManager,
}

impl Application {
    /// Build an application from configuration.
    ///
    /// Requires a non-empty `application.name`.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_manager_config(config, ManagerConfig::default())
    }

    /// Build an application with a custom manager configuration.
    pub fn with_manager_config(config: Config, manager_config: ManagerConfig) -> Result<Self> {
        if config.is_empty() {
            return Err(Error::configuration("configuration is empty"));
        }
        if !config.contains("application") {
            return Err(Error::configuration("missing [application] section"));
        }
        let identity: Identity = config.scan("application")?;
        let name = identity.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::configuration("application.name must not be empty"));
        }
        let version = identity
            .version
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_APP_VERSION.to_string());

        let config = Arc::new(config);
        let manager = PluginManager::new(config.clone(), manager_config);
        let host = host_name();

        tracing::info!(app = %name, version = %version, host = %host, "application created");
        Ok(Self {
            name,
            version,
            host,
            config,
            manager,
        })
    }

    /// Read configuration from a TOML file and build an application.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Config::from_file(path)?)
    }

    /// Application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Application version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Plugin manager.
    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// Construct the process-wide application once.
    ///
    /// Later calls return the same handle and ignore `config`.
    pub fn bootstrap(config: Config) -> Result<Arc<Application>> {
        global_gate().get_or_init(|| Application::new(config))
    }

    /// The process-wide application, if bootstrapped.
    pub fn global() -> Option<Arc<Application>> {
        global_gate().get()
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("host", &self.host)
            .field("manager", &self.manager)
            .finish()
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn global_gate() -> &'static BootstrapGate {
    static GATE: OnceLock<BootstrapGate> = OnceLock::new();
    GATE.get_or_init(BootstrapGate::new)
}

enum GateState {
    Empty,
    Building,
    Ready(Arc<Application>),
    Failed(Error),
}

/// Construction gate for the application handle.
///
/// The first caller builds. Callers arriving while a build is in progress wait
/// for it and receive its handle or its error. A failed build leaves the gate
/// open: the next caller to arrive afterwards builds again.
pub struct BootstrapGate {
    state: Mutex<GateState>,
    settled: Condvar,
    attempts: AtomicU64,
}

impl BootstrapGate {
    /// Create an empty gate.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Empty),
            settled: Condvar::new(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Return the published handle, building it with `init` if needed.
    pub fn get_or_init<F>(&self, init: F) -> Result<Arc<Application>>
    where
        F: FnOnce() -> Result<Application>,
    {
        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            match &*state {
                GateState::Ready(app) => return Ok(app.clone()),
                GateState::Building => {
                    self.settled.wait(&mut state);
                    waited = true;
                }
                GateState::Failed(err) if waited => return Err(err.clone()),
                GateState::Empty | GateState::Failed(_) => break,
            }
        }
        *state = GateState::Building;
        drop(state);

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let built = panic::catch_unwind(AssertUnwindSafe(init)).unwrap_or_else(|payload| {
            Err(Error::configuration(format!(
                "application construction panicked: {}",
                crate::executor::panic_message(payload.as_ref())
            )))
        });

        let mut state = self.state.lock();
        let result = match built {
            Ok(app) => {
                let app = Arc::new(app);
                *state = GateState::Ready(app.clone());
                Ok(app)
            }
            Err(err) => {
                tracing::error!(attempt, error = %err, "application bootstrap failed");
                *state = GateState::Failed(err.clone());
                Err(err)
            }
        };
        self.settled.notify_all();
        result
    }

    /// The published handle, if any.
    pub fn get(&self) -> Option<Arc<Application>> {
        match &*self.state.lock() {
            GateState::Ready(app) => Some(app.clone()),
            _ => None,
        }
    }

    /// Error of the most recent failed build, if the gate is not ready.
    pub fn last_error(&self) -> Option<Error> {
        match &*self.state.lock() {
            GateState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Number of builds started.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl Default for BootstrapGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BootstrapGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            GateState::Empty => "empty",
            GateState::Building => "building",
            GateState::Ready(_) => "ready",
            GateState::Failed(_) => "failed",
        };
        f.debug_struct("BootstrapGate")
            .field("state", &state)
            .field("attempts", &self.attempts())
            .finish()
    }
}

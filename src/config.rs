//! Configuration source and lifecycle settings.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default bound on concurrent initialize/start calls.
pub const DEFAULT_START_PARALLELISM: usize = 8;
/// Default initialize/start/stop timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Lower clamp for every per-operation timeout.
pub const MIN_OPERATION_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper clamp for initialize/start timeouts.
pub const MAX_START_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper clamp for the stop timeout.
pub const MAX_STOP_TIMEOUT: Duration = Duration::from_secs(120);
/// Default bound on concurrent stop calls during unload.
pub const DEFAULT_UNLOAD_PARALLELISM: usize = 4;
/// Upper clamp for unload parallelism.
pub const MAX_UNLOAD_PARALLELISM: usize = 16;
/// Default overall unload deadline.
pub const DEFAULT_UNLOAD_TOTAL_TIMEOUT: Duration = Duration::from_secs(60);
/// Lower clamp for the overall unload deadline.
pub const MIN_UNLOAD_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper clamp for the overall unload deadline.
pub const MAX_UNLOAD_TOTAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration tree with dotted key-path lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    root: toml::Value,
}

impl Config {
    /// An empty configuration.
    pub fn empty() -> Self {
        Self {
            root: toml::Value::Table(toml::Table::new()),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(source)
            .map_err(|e| Error::configuration(format!("invalid TOML: {}", e)))?;
        Ok(Self {
            root: toml::Value::Table(table),
        })
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    /// Wrap an existing value. The root must be a table.
    pub fn from_value(root: toml::Value) -> Result<Self> {
        if !root.is_table() {
            return Err(Error::configuration(format!(
                "configuration root must be a table, got {}",
                root.type_str()
            )));
        }
        Ok(Self { root })
    }

    /// Check if the configuration has no keys at all.
    pub fn is_empty(&self) -> bool {
        self.root.as_table().map_or(true, |t| t.is_empty())
    }

    /// Look up a value by dotted path, e.g. `plugins.init_timeout`.
    pub fn value(&self, path: &str) -> Option<&toml::Value> {
        if path.is_empty() {
            return Some(&self.root);
        }
        path.split('.')
            .try_fold(&self.root, |node, key| node.as_table()?.get(key))
    }

    /// Check if a path is present.
    pub fn contains(&self, path: &str) -> bool {
        self.value(path).is_some()
    }

    /// Look up a string by dotted path.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.value(path).and_then(toml::Value::as_str)
    }

    /// Populate `T` from the value at `path`.
    pub fn scan<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self
            .value(path)
            .ok_or_else(|| Error::configuration(format!("missing configuration key {}", path)))?;
        value
            .clone()
            .try_into()
            .map_err(|e| Error::configuration(format!("invalid value at {}: {}", path, e)))
    }

    /// Like [`scan`](Self::scan), but a missing path yields `T::default()`.
    pub fn scan_or_default<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        if self.contains(path) {
            self.scan(path)
        } else {
            Ok(T::default())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::empty()
    }
}

/// Raw lifecycle knobs as they appear in configuration.
///
/// ```toml
/// [plugins]
/// start_parallelism = 8
/// init_timeout = "5s"
/// start_timeout = "5s"
/// stop_timeout = "10s"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Bound on concurrent initialize/start calls; zero or negative means default.
    pub start_parallelism: Option<i64>,
    /// Initialize timeout.
    #[serde(with = "humantime_serde")]
    pub init_timeout: Option<Duration>,
    /// Start timeout.
    #[serde(with = "humantime_serde")]
    pub start_timeout: Option<Duration>,
    /// Stop timeout.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Option<Duration>,
    /// Bound on concurrent stop calls during unload.
    pub unload_parallelism: Option<i64>,
    /// Overall unload deadline.
    #[serde(with = "humantime_serde")]
    pub unload_total_timeout: Option<Duration>,
}

impl LifecycleSettings {
    /// Create empty settings; every knob resolves to its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read settings from `section`, defaulting when the section is absent.
    pub fn from_config(config: &Config, section: &str) -> Result<Self> {
        config.scan_or_default(section)
    }

    /// Set the start parallelism.
    pub fn with_start_parallelism(mut self, n: i64) -> Self {
        self.start_parallelism = Some(n);
        self
    }

    /// Set the initialize timeout.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = Some(timeout);
        self
    }

    /// Set the start timeout.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    /// Set the stop timeout.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Set the unload parallelism.
    pub fn with_unload_parallelism(mut self, n: i64) -> Self {
        self.unload_parallelism = Some(n);
        self
    }

    /// Set the overall unload deadline.
    pub fn with_unload_total_timeout(mut self, timeout: Duration) -> Self {
        self.unload_total_timeout = Some(timeout);
        self
    }

    /// Apply defaults and clamps.
    pub fn resolve(&self) -> ExecutionLimits {
        let start_parallelism = match self.start_parallelism {
            Some(n) if n > 0 => n as usize,
            Some(n) => {
                tracing::warn!(
                    configured = n,
                    using = DEFAULT_START_PARALLELISM,
                    "start_parallelism must be positive, using default"
                );
                DEFAULT_START_PARALLELISM
            }
            None => DEFAULT_START_PARALLELISM,
        };

        let unload_parallelism = match self.unload_parallelism {
            None => DEFAULT_UNLOAD_PARALLELISM,
            Some(n) => {
                let clamped = n.clamp(1, MAX_UNLOAD_PARALLELISM as i64) as usize;
                if clamped as i64 != n {
                    tracing::warn!(
                        configured = n,
                        using = clamped,
                        "unload_parallelism out of range, clamped"
                    );
                }
                clamped
            }
        };

        ExecutionLimits {
            start_parallelism,
            init_timeout: clamp_timeout(
                "init_timeout",
                self.init_timeout,
                DEFAULT_OPERATION_TIMEOUT,
                MIN_OPERATION_TIMEOUT,
                MAX_START_TIMEOUT,
            ),
            start_timeout: clamp_timeout(
                "start_timeout",
                self.start_timeout,
                DEFAULT_OPERATION_TIMEOUT,
                MIN_OPERATION_TIMEOUT,
                MAX_START_TIMEOUT,
            ),
            stop_timeout: clamp_timeout(
                "stop_timeout",
                self.stop_timeout,
                DEFAULT_OPERATION_TIMEOUT,
                MIN_OPERATION_TIMEOUT,
                MAX_STOP_TIMEOUT,
            ),
            unload_parallelism,
            unload_total_timeout: clamp_timeout(
                "unload_total_timeout",
                self.unload_total_timeout,
                DEFAULT_UNLOAD_TOTAL_TIMEOUT,
                MIN_UNLOAD_TOTAL_TIMEOUT,
                MAX_UNLOAD_TOTAL_TIMEOUT,
            ),
        }
    }
}

fn clamp_timeout(
    knob: &'static str,
    configured: Option<Duration>,
    default: Duration,
    min: Duration,
    max: Duration,
) -> Duration {
    let Some(value) = configured else {
        return default;
    };
    let clamped = value.clamp(min, max);
    if clamped != value {
        tracing::warn!(
            knob,
            configured_ms = value.as_millis() as u64,
            using_ms = clamped.as_millis() as u64,
            "timeout out of range, clamped"
        );
    }
    clamped
}

/// Resolved limits for one load or unload run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    start_parallelism: usize,
    init_timeout: Duration,
    start_timeout: Duration,
    stop_timeout: Duration,
    unload_parallelism: usize,
    unload_total_timeout: Duration,
}

impl ExecutionLimits {
    /// Bound on concurrent initialize/start calls.
    pub fn start_parallelism(&self) -> usize {
        self.start_parallelism
    }

    /// Initialize timeout.
    pub fn init_timeout(&self) -> Duration {
        self.init_timeout
    }

    /// Start timeout.
    pub fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    /// Stop timeout.
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Bound on concurrent stop calls during unload.
    pub fn unload_parallelism(&self) -> usize {
        self.unload_parallelism
    }

    /// Overall unload deadline.
    pub fn unload_total_timeout(&self) -> Duration {
        self.unload_total_timeout
    }

    /// Timeout for a given operation.
    pub fn timeout_for(&self, operation: crate::lifecycle::Operation) -> Duration {
        use crate::lifecycle::Operation;
        match operation {
            Operation::Initialize => self.init_timeout,
            Operation::Start => self.start_timeout,
            Operation::Stop => self.stop_timeout,
        }
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        LifecycleSettings::default().resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Operation;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "orders"
version = "1.2.3"

[plugins]
start_parallelism = 2
init_timeout = "2s"
start_timeout = "500ms"
stop_timeout = "10m"
"#;

    #[test]
    fn test_value_lookup() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.get_str("application.name"), Some("orders"));
        assert!(config.contains("plugins.init_timeout"));
        assert!(config.value("plugins.missing").is_none());
        assert!(config.value("application.name.deeper").is_none());
        assert!(!config.is_empty());
        assert!(Config::empty().is_empty());
    }

    #[test]
    fn test_scan_settings_and_clamp() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let settings = LifecycleSettings::from_config(&config, "plugins").unwrap();
        assert_eq!(settings.init_timeout, Some(Duration::from_secs(2)));

        let limits = settings.resolve();
        assert_eq!(limits.start_parallelism(), 2);
        assert_eq!(limits.init_timeout(), Duration::from_secs(2));
        assert_eq!(limits.start_timeout(), MIN_OPERATION_TIMEOUT);
        assert_eq!(limits.stop_timeout(), MAX_STOP_TIMEOUT);
        assert_eq!(limits.timeout_for(Operation::Start), MIN_OPERATION_TIMEOUT);
    }

    #[test]
    fn test_defaults() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.start_parallelism(), 8);
        assert_eq!(limits.init_timeout(), Duration::from_secs(5));
        assert_eq!(limits.start_timeout(), Duration::from_secs(5));
        assert_eq!(limits.stop_timeout(), Duration::from_secs(5));
        assert_eq!(limits.unload_parallelism(), 4);
        assert_eq!(limits.unload_total_timeout(), Duration::from_secs(60));

        let settings = LifecycleSettings::from_config(&Config::empty(), "plugins").unwrap();
        assert_eq!(settings, LifecycleSettings::default());
    }

    #[test]
    fn test_parallelism_fallbacks() {
        let limits = LifecycleSettings::new()
            .with_start_parallelism(0)
            .with_unload_parallelism(64)
            .resolve();
        assert_eq!(limits.start_parallelism(), DEFAULT_START_PARALLELISM);
        assert_eq!(limits.unload_parallelism(), MAX_UNLOAD_PARALLELISM);

        let limits = LifecycleSettings::new()
            .with_start_parallelism(-3)
            .with_unload_parallelism(0)
            .with_unload_total_timeout(Duration::from_secs(1))
            .resolve();
        assert_eq!(limits.start_parallelism(), DEFAULT_START_PARALLELISM);
        assert_eq!(limits.unload_parallelism(), 1);
        assert_eq!(limits.unload_total_timeout(), MIN_UNLOAD_TOTAL_TIMEOUT);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(Config::from_toml_str("not = [valid").is_err());
        assert!(Config::from_value(toml::Value::Integer(1)).is_err());

        let config = Config::from_toml_str("[plugins]\ninit_timeout = \"soon\"").unwrap();
        let err = LifecycleSettings::from_config(&config, "plugins").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = config.scan::<LifecycleSettings>("absent").unwrap_err();
        assert!(err.to_string().contains("absent"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.get_str("application.version"), Some("1.2.3"));

        assert!(Config::from_file(file.path().with_extension("missing")).is_err());
    }
}

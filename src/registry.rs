//! Plugin instance registry.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleState;
use crate::plugin::{Plugin, PluginHandle, PluginInfo};

/// Configuration for the plugin registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of plugins allowed.
    pub max_plugins: usize,
    /// Whether a registration may replace an existing plugin with the same ID.
    pub allow_overwrite: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_plugins: 256,
            allow_overwrite: false,
        }
    }
}

impl RegistryConfig {
    /// Create a new registry configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of plugins.
    pub fn with_max_plugins(mut self, max: usize) -> Self {
        self.max_plugins = max;
        self
    }

    /// Allow plugin overwrites.
    pub fn with_allow_overwrite(mut self, allow: bool) -> Self {
        self.allow_overwrite = allow;
        self
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Total plugins registered.
    pub total: usize,
    /// Plugins never initialized.
    pub created: usize,
    /// Plugins initialized but not started.
    pub inactive: usize,
    /// Plugins running.
    pub active: usize,
    /// Plugins stopped.
    pub terminated: usize,
    /// Plugins that failed.
    pub failed: usize,
}

struct Registered {
    seq: u64,
    handle: PluginHandle,
}

/// Concurrency-safe map of registered plugins, keyed by ID.
pub struct PluginRegistry {
    config: RegistryConfig,
    plugins: DashMap<String, Registered>,
    next_seq: AtomicU64,
    // Reserved slots, kept in step with `plugins`.
    count: AtomicUsize,
}

impl PluginRegistry {
    /// Create a new plugin registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            plugins: DashMap::new(),
            next_seq: AtomicU64::new(0),
            count: AtomicUsize::new(0),
        }
    }

    /// Create with default configuration.
    pub fn default_config() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a plugin.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<PluginHandle> {
        let id = plugin.id().to_string();
        if id.is_empty() {
            return Err(Error::Registry("plugin ID must not be empty".to_string()));
        }

        // Existence check and insert happen under one shard lock.
        match self.plugins.entry(id) {
            Entry::Occupied(mut occupied) => {
                if !self.config.allow_overwrite {
                    return Err(Error::PluginAlreadyRegistered(occupied.key().clone()));
                }
                let state = occupied.get().handle.state();
                if !matches!(
                    state,
                    LifecycleState::Created | LifecycleState::Terminated | LifecycleState::Failed
                ) {
                    return Err(Error::invalid_state(
                        occupied.key().clone(),
                        "created, terminated or failed",
                        state.to_string(),
                    ));
                }
                let handle = PluginHandle::new(plugin);
                occupied.insert(Registered {
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    handle: handle.clone(),
                });
                tracing::warn!(plugin_id = %occupied.key(), "plugin registration replaced");
                Ok(handle)
            }
            Entry::Vacant(vacant) => {
                if self.count.fetch_add(1, Ordering::AcqRel) >= self.config.max_plugins {
                    self.count.fetch_sub(1, Ordering::AcqRel);
                    return Err(Error::Registry(format!(
                        "registry full: max {} plugins",
                        self.config.max_plugins
                    )));
                }
                let handle = PluginHandle::new(plugin);
                tracing::debug!(plugin_id = %vacant.key(), "plugin registered");
                vacant.insert(Registered {
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    handle: handle.clone(),
                });
                Ok(handle)
            }
        }
    }

    /// Unregister a plugin. Running plugins must be stopped first.
    pub fn unregister(&self, id: &str) -> Result<PluginHandle> {
        let removed = self.plugins.remove_if(id, |_, registered| {
            let state = registered.handle.state();
            !(matches!(state, LifecycleState::Active) || state.is_transitional())
        });
        match removed {
            Some((_, registered)) => {
                self.count.fetch_sub(1, Ordering::AcqRel);
                Ok(registered.handle)
            }
            None => {
                let state = self
                    .get(id)
                    .ok_or_else(|| Error::plugin_not_found(id))?
                    .state();
                Err(Error::invalid_state(id, "not running", state.to_string()))
            }
        }
    }

    /// Get a plugin by ID.
    pub fn get(&self, id: &str) -> Option<PluginHandle> {
        self.plugins.get(id).map(|r| r.handle.clone())
    }

    /// Check if a plugin exists.
    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    /// Get all plugin IDs, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Get all plugins in registration order.
    pub fn all(&self) -> Vec<PluginHandle> {
        let mut entries: Vec<(u64, PluginHandle)> = self
            .plugins
            .iter()
            .map(|r| (r.seq, r.handle.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, h)| h).collect()
    }

    /// Get plugins by state, in registration order.
    pub fn by_state(&self, state: LifecycleState) -> Vec<PluginHandle> {
        self.all()
            .into_iter()
            .filter(|h| h.state() == state)
            .collect()
    }

    /// Get running plugins.
    pub fn active(&self) -> Vec<PluginHandle> {
        self.by_state(LifecycleState::Active)
    }

    /// Get plugin count.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.plugins.len(),
            ..RegistryStats::default()
        };

        for entry in self.plugins.iter() {
            match entry.handle.state() {
                LifecycleState::Created => stats.created += 1,
                LifecycleState::Inactive => stats.inactive += 1,
                LifecycleState::Active => stats.active += 1,
                LifecycleState::Terminated => stats.terminated += 1,
                LifecycleState::Failed => stats.failed += 1,
                _ => {}
            }
        }

        stats
    }

    /// Get all plugin info, in registration order.
    pub fn info(&self) -> Vec<PluginInfo> {
        self.all().iter().map(PluginHandle::info).collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::default_config()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("config", &self.config)
            .field("plugin_count", &self.plugins.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PluginContext;

    struct Named(&'static str);

    impl Plugin for Named {
        fn id(&self) -> &str {
            self.0
        }

        fn initialize(&self, _ctx: &PluginContext) -> Result<()> {
            Ok(())
        }

        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    fn plugin(id: &'static str) -> Arc<dyn Plugin> {
        Arc::new(Named(id))
    }

    #[test]
    fn test_registry_creation() {
        let registry = PluginRegistry::default_config();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_register_plugin() {
        let registry = PluginRegistry::default_config();
        let handle = registry.register(plugin("test-plugin")).unwrap();

        assert_eq!(handle.state(), LifecycleState::Created);
        assert!(registry.contains("test-plugin"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_duplicate() {
        let registry = PluginRegistry::default_config();

        registry.register(plugin("test-plugin")).unwrap();
        let result = registry.register(plugin("test-plugin"));

        assert!(matches!(result, Err(Error::PluginAlreadyRegistered(_))));
    }

    #[test]
    fn test_register_duplicate_with_overwrite() {
        let config = RegistryConfig::new().with_allow_overwrite(true);
        let registry = PluginRegistry::new(config);

        let first = registry.register(plugin("test-plugin")).unwrap();
        let second = registry.register(plugin("test-plugin")).unwrap();

        let current = registry.get("test-plugin").unwrap();
        assert!(current.same_instance(&second));
        assert!(!current.same_instance(&first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_overwrite_refused_while_active() {
        let registry = PluginRegistry::new(RegistryConfig::new().with_allow_overwrite(true));
        let handle = registry.register(plugin("svc")).unwrap();
        handle.set_state(LifecycleState::Active);

        let result = registry.register(plugin("svc"));
        assert!(matches!(result, Err(Error::InvalidState { .. })));
    }

    #[test]
    fn test_unregister_plugin() {
        let registry = PluginRegistry::default_config();
        registry.register(plugin("test-plugin")).unwrap();

        registry.unregister("test-plugin").unwrap();
        assert!(!registry.contains("test-plugin"));
    }

    #[test]
    fn test_unregister_nonexistent() {
        let registry = PluginRegistry::default_config();
        let result = registry.unregister("nonexistent");
        assert!(matches!(result, Err(Error::PluginNotFound(_))));
    }

    #[test]
    fn test_unregister_active_refused() {
        let registry = PluginRegistry::default_config();
        registry
            .register(plugin("svc"))
            .unwrap()
            .set_state(LifecycleState::Active);
        assert!(registry.unregister("svc").is_err());
    }

    #[test]
    fn test_registration_order() {
        let registry = PluginRegistry::default_config();

        registry.register(plugin("plugin-3")).unwrap();
        registry.register(plugin("plugin-1")).unwrap();
        registry.register(plugin("plugin-2")).unwrap();

        let order: Vec<String> = registry.all().iter().map(|h| h.id().to_string()).collect();
        assert_eq!(order, vec!["plugin-3", "plugin-1", "plugin-2"]);
        assert_eq!(registry.ids(), vec!["plugin-1", "plugin-2", "plugin-3"]);
    }

    #[test]
    fn test_registry_stats() {
        let registry = PluginRegistry::default_config();

        registry.register(plugin("plugin-1")).unwrap();
        registry
            .register(plugin("plugin-2"))
            .unwrap()
            .set_state(LifecycleState::Failed);

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(registry.by_state(LifecycleState::Failed).len(), 1);
    }

    #[test]
    fn test_max_plugins() {
        let config = RegistryConfig::new().with_max_plugins(2);
        let registry = PluginRegistry::new(config);

        registry.register(plugin("plugin-1")).unwrap();
        registry.register(plugin("plugin-2")).unwrap();

        let result = registry.register(plugin("plugin-3"));
        assert!(matches!(result, Err(Error::Registry(_))));

        registry.unregister("plugin-1").unwrap();
        registry.register(plugin("plugin-3")).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_register_same_id() {
        let registry = Arc::new(PluginRegistry::default_config());
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.register(plugin("shared"))
                })
            })
            .collect();
        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::PluginAlreadyRegistered(id) if id == "shared")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_register_respects_capacity() {
        let registry = Arc::new(PluginRegistry::new(RegistryConfig::new().with_max_plugins(3)));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let ids = ["p0", "p1", "p2", "p3", "p4", "p5", "p6", "p7"];

        let workers: Vec<_> = ids
            .iter()
            .map(|&id| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.register(plugin(id)).is_ok()
                })
            })
            .collect();
        let accepted = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, 3);
        assert_eq!(registry.len(), 3);
    }
}

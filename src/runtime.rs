//! Runtime shared by every plugin, and the per-plugin view onto it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::Config;
use crate::error::Result;
use crate::lifecycle::{EventKind, EventSink, LifecycleHooks, PluginEvent};
use crate::resources::{release_hook, ResourceInfo, ResourceRegistry, ResourceValue};

/// Resource registry, event sink, and configuration shared by all plugins.
#[derive(Clone)]
pub struct Runtime {
    resources: Arc<ResourceRegistry>,
    events: Arc<dyn EventSink>,
    config: Arc<Config>,
}

impl Runtime {
    /// Create a runtime with in-process [`LifecycleHooks`] as the event sink.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            resources: Arc::new(ResourceRegistry::new()),
            events: Arc::new(LifecycleHooks::new()),
            config,
        }
    }

    /// Replace the event sink.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The resource registry.
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Publish an event.
    pub fn emit(&self, event: PluginEvent) {
        self.events.publish(event);
    }

    /// A view bound to one plugin.
    pub fn for_plugin(&self, plugin_id: &str) -> PluginContext {
        PluginContext {
            plugin_id: Arc::from(plugin_id),
            runtime: self.clone(),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("resources", &self.resources)
            .finish()
    }
}

/// A plugin's view of the runtime, bound to its ID for its whole lifetime.
///
/// Private resources registered here are invisible to other plugins, and
/// shared resources registered here are owned by this plugin: both are removed
/// when the plugin is cleaned up.
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: Arc<str>,
    runtime: Runtime,
}

impl PluginContext {
    /// ID this context is bound to.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Register a shared resource owned by this plugin.
    pub fn register_shared<T: Any + Send + Sync>(&self, name: &str, value: T) -> Result<()> {
        self.runtime
            .resources
            .insert_shared_owned(&self.plugin_id, name, value, None)
    }

    /// Register a shared resource with a release hook run on cleanup.
    pub fn register_shared_with_release<T, F>(&self, name: &str, value: T, release: F) -> Result<()>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.runtime.resources.insert_shared_owned(
            &self.plugin_id,
            name,
            value,
            Some(release_hook(release)),
        )
    }

    /// Look up a shared resource.
    pub fn get_shared<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        self.runtime.resources.get_shared(name)
    }

    /// Look up a shared resource without a type check.
    pub fn get_shared_value(&self, name: &str) -> Result<ResourceValue> {
        self.runtime.resources.get_shared_value(name)
    }

    /// Register a private resource.
    pub fn register_private<T: Any + Send + Sync>(&self, name: &str, value: T) -> Result<()> {
        self.runtime
            .resources
            .insert_private(&self.plugin_id, name, value, None)
    }

    /// Register a private resource with a release hook run on cleanup.
    pub fn register_private_with_release<T, F>(&self, name: &str, value: T, release: F) -> Result<()>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.runtime.resources.insert_private(
            &self.plugin_id,
            name,
            value,
            Some(release_hook(release)),
        )
    }

    /// Look up a private resource.
    pub fn get_private<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        self.runtime.resources.get_private(&self.plugin_id, name)
    }

    /// Look up a private resource without a type check.
    pub fn get_private_value(&self, name: &str) -> Result<ResourceValue> {
        self.runtime
            .resources
            .get_private_value(&self.plugin_id, name)
    }

    /// This plugin's private resources.
    pub fn private_resources(&self) -> Vec<ResourceInfo> {
        self.runtime.resources.private_infos(&self.plugin_id)
    }

    /// Introspect a shared resource.
    pub fn resource_info(&self, name: &str) -> Option<ResourceInfo> {
        self.runtime.resources.resource_info(name)
    }

    /// Emit an event tagged with this plugin's ID.
    pub fn emit(&self, kind: EventKind, metadata: HashMap<String, Value>) {
        let mut event = PluginEvent::new(self.plugin_id.as_ref(), kind);
        event.metadata = metadata;
        self.runtime.emit(event);
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        self.runtime.config()
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .finish()
    }
}

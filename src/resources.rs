//! Shared and per-plugin private resource storage.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Opaque resource value as stored in the registry.
pub type ResourceValue = Arc<dyn Any + Send + Sync>;

type ReleaseHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Namespace a resource lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceScope {
    /// Visible to every plugin.
    Shared,
    /// Visible only through the owning plugin's context.
    Private,
}

/// Introspection view of one resource.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    /// Resource name.
    pub name: String,
    /// Rust type name of the stored value.
    pub type_name: &'static str,
    /// Best-effort size in bytes.
    pub size: usize,
    /// Registration time.
    pub created_at: SystemTime,
    /// Last lookup time, if ever looked up.
    pub last_used: Option<SystemTime>,
    /// Number of lookups.
    pub access_count: u64,
    /// Owning plugin, if any.
    pub owner: Option<String>,
    /// Namespace.
    pub scope: ResourceScope,
}

/// Aggregate resource counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceStats {
    /// All resources.
    pub total: usize,
    /// Shared resources.
    pub shared: usize,
    /// Private resources.
    pub private: usize,
    /// Sum of best-effort sizes.
    pub total_size: usize,
    /// Distinct plugins owning at least one resource.
    pub plugins_with_resources: usize,
}

struct ResourceEntry {
    value: ResourceValue,
    type_name: &'static str,
    size: usize,
    created_at: SystemTime,
    owner: Option<String>,
    access_count: AtomicU64,
    last_used: Mutex<Option<SystemTime>>,
    release: Mutex<Option<ReleaseHook>>,
}

impl ResourceEntry {
    fn new<T: Any + Send + Sync>(value: T, owner: Option<&str>, release: Option<ReleaseHook>) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
            size: std::mem::size_of::<T>(),
            created_at: SystemTime::now(),
            owner: owner.map(str::to_string),
            access_count: AtomicU64::new(0),
            last_used: Mutex::new(None),
            release: Mutex::new(release),
        }
    }

    fn touch(&self) -> ResourceValue {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        *self.last_used.lock() = Some(SystemTime::now());
        self.value.clone()
    }

    fn info(&self, name: &str, scope: ResourceScope) -> ResourceInfo {
        ResourceInfo {
            name: name.to_string(),
            type_name: self.type_name,
            size: self.size,
            created_at: self.created_at,
            last_used: *self.last_used.lock(),
            access_count: self.access_count.load(Ordering::Relaxed),
            owner: self.owner.clone(),
            scope,
        }
    }

    /// Run the release hook, at most once.
    fn release(&self, name: &str) -> std::result::Result<(), String> {
        let hook = self.release.lock().take();
        let Some(hook) = hook else {
            return Ok(());
        };
        match panic::catch_unwind(AssertUnwindSafe(hook)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("release of {} failed: {}", name, e)),
            Err(payload) => Err(format!(
                "release of {} panicked: {}",
                name,
                crate::executor::panic_message(payload.as_ref())
            )),
        }
    }
}

fn downcast<T: Any + Send + Sync>(name: &str, value: ResourceValue) -> Result<Arc<T>> {
    value
        .downcast::<T>()
        .map_err(|_| Error::ResourceTypeMismatch {
            name: name.to_string(),
            expected: std::any::type_name::<T>().to_string(),
        })
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid_resource("resource name must not be empty"));
    }
    Ok(())
}

/// Resource registry with a shared namespace and per-plugin private namespaces.
///
/// Private entries are only reachable through a [`PluginContext`] bound to the
/// owning plugin.
///
/// [`PluginContext`]: crate::runtime::PluginContext
pub struct ResourceRegistry {
    shared: DashMap<String, ResourceEntry>,
    private: DashMap<String, HashMap<String, ResourceEntry>>,
}

impl ResourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            shared: DashMap::new(),
            private: DashMap::new(),
        }
    }

    /// Register a shared resource with no owner. Overwrites any existing entry.
    pub fn register_shared<T: Any + Send + Sync>(&self, name: &str, value: T) -> Result<()> {
        self.insert_shared(name, ResourceEntry::new(value, None, None))
    }

    pub(crate) fn insert_shared_owned<T: Any + Send + Sync>(
        &self,
        owner: &str,
        name: &str,
        value: T,
        release: Option<ReleaseHook>,
    ) -> Result<()> {
        self.insert_shared(name, ResourceEntry::new(value, Some(owner), release))
    }

    fn insert_shared(&self, name: &str, entry: ResourceEntry) -> Result<()> {
        validate_name(name)?;
        if self.shared.insert(name.to_string(), entry).is_some() {
            tracing::debug!(resource = name, "shared resource overwritten");
        }
        Ok(())
    }

    /// Look up a shared resource by type.
    pub fn get_shared<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        downcast(name, self.get_shared_value(name)?)
    }

    /// Look up a shared resource without a type check.
    pub fn get_shared_value(&self, name: &str) -> Result<ResourceValue> {
        self.shared
            .get(name)
            .map(|entry| entry.touch())
            .ok_or_else(|| Error::resource_not_found(name))
    }

    /// Check if a shared resource exists.
    pub fn contains_shared(&self, name: &str) -> bool {
        self.shared.contains_key(name)
    }

    pub(crate) fn insert_private<T: Any + Send + Sync>(
        &self,
        owner: &str,
        name: &str,
        value: T,
        release: Option<ReleaseHook>,
    ) -> Result<()> {
        validate_name(name)?;
        let entry = ResourceEntry::new(value, Some(owner), release);
        self.private
            .entry(owner.to_string())
            .or_default()
            .insert(name.to_string(), entry);
        Ok(())
    }

    pub(crate) fn get_private_value(&self, owner: &str, name: &str) -> Result<ResourceValue> {
        self.private
            .get(owner)
            .and_then(|space| space.get(name).map(ResourceEntry::touch))
            .ok_or_else(|| Error::resource_not_found(format!("{}:{}", owner, name)))
    }

    pub(crate) fn get_private<T: Any + Send + Sync>(&self, owner: &str, name: &str) -> Result<Arc<T>> {
        downcast(name, self.get_private_value(owner, name)?)
    }

    pub(crate) fn private_infos(&self, owner: &str) -> Vec<ResourceInfo> {
        self.private
            .get(owner)
            .map(|space| {
                space
                    .iter()
                    .map(|(name, entry)| entry.info(name, ResourceScope::Private))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Introspect a shared resource.
    pub fn resource_info(&self, name: &str) -> Option<ResourceInfo> {
        self.shared
            .get(name)
            .map(|entry| entry.info(name, ResourceScope::Shared))
    }

    /// Enumerate every resource, shared and private.
    pub fn list(&self) -> Vec<ResourceInfo> {
        let mut infos: Vec<ResourceInfo> = self
            .shared
            .iter()
            .map(|r| r.value().info(r.key(), ResourceScope::Shared))
            .collect();
        for space in self.private.iter() {
            infos.extend(
                space
                    .value()
                    .iter()
                    .map(|(name, entry)| entry.info(name, ResourceScope::Private)),
            );
        }
        infos
    }

    /// Aggregate counts across both namespaces.
    pub fn stats(&self) -> ResourceStats {
        let mut stats = ResourceStats::default();
        let mut owners: HashSet<String> = HashSet::new();

        for entry in self.shared.iter() {
            stats.shared += 1;
            stats.total_size += entry.size;
            if let Some(owner) = &entry.owner {
                owners.insert(owner.clone());
            }
        }
        for space in self.private.iter() {
            if space.is_empty() {
                continue;
            }
            owners.insert(space.key().clone());
            stats.private += space.len();
            stats.total_size += space.values().map(|e| e.size).sum::<usize>();
        }

        stats.total = stats.shared + stats.private;
        stats.plugins_with_resources = owners.len();
        stats
    }

    /// Remove every resource owned by `plugin_id`, running release hooks.
    ///
    /// Entries are removed even if their release hook fails; failures are
    /// reported as a single cleanup error. Calling this again for the same
    /// plugin is a no-op.
    pub fn cleanup(&self, plugin_id: &str) -> Result<usize> {
        let mut removed: Vec<(String, ResourceEntry)> = Vec::new();

        if let Some((_, space)) = self.private.remove(plugin_id) {
            removed.extend(space);
        }

        let owned: Vec<String> = self
            .shared
            .iter()
            .filter(|r| r.owner.as_deref() == Some(plugin_id))
            .map(|r| r.key().clone())
            .collect();
        for name in owned {
            if let Some(pair) = self
                .shared
                .remove_if(&name, |_, e| e.owner.as_deref() == Some(plugin_id))
            {
                removed.push(pair);
            }
        }

        // No map lock is held past this point.
        let count = removed.len();
        let failures: Vec<String> = removed
            .iter()
            .filter_map(|(name, entry)| entry.release(name).err())
            .collect();

        if count > 0 {
            tracing::debug!(plugin_id, removed = count, "resources cleaned up");
        }

        match failures.first() {
            None => Ok(count),
            Some(first) => {
                tracing::warn!(
                    plugin_id,
                    failures = failures.len(),
                    first = %first,
                    "resource release failed during cleanup"
                );
                Err(Error::ResourceCleanup {
                    plugin: plugin_id.to_string(),
                    failures: failures.len(),
                    first: first.clone(),
                })
            }
        }
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ResourceRegistry")
            .field("shared", &stats.shared)
            .field("private", &stats.private)
            .finish()
    }
}

/// Wrap a release closure for storage.
pub(crate) fn release_hook<F>(f: F) -> ReleaseHook
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    Box::new(f)
}

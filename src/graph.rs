//! Dependency resolution: plugin set to leveled startup order.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::executor::panic_message;
use crate::plugin::Plugin;

/// A plugin paired with its dependency level.
///
/// Level 0 means no required dependency inside the resolved set; otherwise the
/// level is one more than the deepest required dependency.
#[derive(Clone)]
pub struct LeveledPlugin {
    plugin: Arc<dyn Plugin>,
    level: usize,
}

impl LeveledPlugin {
    /// The plugin.
    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    /// Plugin ID.
    pub fn id(&self) -> &str {
        self.plugin.id()
    }

    /// Dependency level.
    pub fn level(&self) -> usize {
        self.level
    }
}

impl std::fmt::Debug for LeveledPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeveledPlugin")
            .field("id", &self.id())
            .field("level", &self.level)
            .finish()
    }
}

/// Group a resolved order into consecutive levels.
pub fn group_by_level(order: &[LeveledPlugin]) -> Vec<Vec<LeveledPlugin>> {
    let mut levels: Vec<Vec<LeveledPlugin>> = Vec::new();
    for entry in order {
        while levels.len() <= entry.level {
            levels.push(Vec::new());
        }
        levels[entry.level].push(entry.clone());
    }
    levels.retain(|l| !l.is_empty());
    levels
}

/// Read plugin metadata, turning a panicking accessor into an error.
fn read_metadata<T>(
    plugin: &Arc<dyn Plugin>,
    read: impl FnOnce(&dyn Plugin) -> T,
) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(|| read(&**plugin))).map_err(|payload| {
        Error::InvalidPlugin {
            plugin: plugin.id().to_string(),
            message: panic_message(payload.as_ref()),
        }
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Required-edge adjacency plus visit state for one resolution.
pub struct DependencyGraph {
    plugins: Vec<Arc<dyn Plugin>>,
    index: HashMap<String, usize>,
    edges: Vec<Vec<usize>>,
    weights: Vec<i32>,
    marks: Vec<Mark>,
    levels: Vec<usize>,
}

impl DependencyGraph {
    /// Build the graph, validating IDs and dependency declarations.
    pub fn build(plugins: &[Arc<dyn Plugin>]) -> Result<Self> {
        let mut index: HashMap<String, usize> = HashMap::with_capacity(plugins.len());
        let mut unique: Vec<Arc<dyn Plugin>> = Vec::with_capacity(plugins.len());

        for plugin in plugins {
            match index.get(plugin.id()) {
                Some(&existing) => {
                    let first = &unique[existing];
                    // The same instance listed twice is tolerated.
                    if Arc::ptr_eq(first, plugin) {
                        continue;
                    }
                    return Err(Error::DuplicatePlugin {
                        id: plugin.id().to_string(),
                        first: read_metadata(first, |p| p.name().to_string())?,
                        second: read_metadata(plugin, |p| p.name().to_string())?,
                    });
                }
                None => {
                    index.insert(plugin.id().to_string(), unique.len());
                    unique.push(plugin.clone());
                }
            }
        }

        let mut edges = vec![Vec::new(); unique.len()];
        let mut weights = Vec::with_capacity(unique.len());
        for (i, plugin) in unique.iter().enumerate() {
            weights.push(read_metadata(plugin, |p| p.weight())?);
            for dep in read_metadata(plugin, |p| p.dependencies())? {
                if dep.target.is_empty() {
                    return Err(Error::EmptyDependency {
                        plugin: plugin.id().to_string(),
                    });
                }
                match index.get(&dep.target) {
                    Some(&target) if dep.required => {
                        if !edges[i].contains(&target) {
                            edges[i].push(target);
                        }
                    }
                    Some(_) => {}
                    None if dep.required => {
                        return Err(Error::missing_dependency(plugin.id(), &dep.target));
                    }
                    None => {
                        tracing::debug!(
                            plugin_id = plugin.id(),
                            dependency = %dep.target,
                            "optional dependency not present, skipping"
                        );
                    }
                }
            }
        }

        let count = unique.len();
        Ok(Self {
            plugins: unique,
            index,
            edges,
            weights,
            marks: vec![Mark::Unvisited; count],
            levels: vec![0; count],
        })
    }

    /// Number of distinct plugins in the graph.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Required dependency IDs of a plugin, if present in the graph.
    pub fn required_of(&self, id: &str) -> Option<Vec<&str>> {
        let &i = self.index.get(id)?;
        Some(self.edges[i].iter().map(|&t| self.plugins[t].id()).collect())
    }

    /// Compute levels and return the sorted order.
    ///
    /// Order is ascending by level; within a level, higher weight first, then
    /// ascending ID.
    pub fn into_order(mut self) -> Result<Vec<LeveledPlugin>> {
        let mut stack = Vec::new();
        for i in 0..self.plugins.len() {
            if self.marks[i] == Mark::Unvisited {
                self.visit(i, &mut stack)?;
            }
        }

        let mut ranked: Vec<(i32, LeveledPlugin)> = self
            .plugins
            .into_iter()
            .zip(self.levels)
            .zip(self.weights)
            .map(|((plugin, level), weight)| (weight, LeveledPlugin { plugin, level }))
            .collect();

        ranked.sort_by(|(wa, a), (wb, b)| {
            a.level
                .cmp(&b.level)
                .then_with(|| wb.cmp(wa))
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(ranked.into_iter().map(|(_, entry)| entry).collect())
    }

    fn visit(&mut self, node: usize, stack: &mut Vec<usize>) -> Result<usize> {
        match self.marks[node] {
            Mark::Done => return Ok(self.levels[node]),
            Mark::InProgress => {
                let start = stack.iter().position(|&n| n == node).unwrap_or(0);
                let mut path: Vec<&str> =
                    stack[start..].iter().map(|&n| self.plugins[n].id()).collect();
                path.push(self.plugins[node].id());
                return Err(Error::CyclicDependency {
                    plugin: self.plugins[node].id().to_string(),
                    path: path.join(" -> "),
                });
            }
            Mark::Unvisited => {}
        }

        self.marks[node] = Mark::InProgress;
        stack.push(node);

        let mut level = 0;
        let deps = self.edges[node].clone();
        for dep in deps {
            let dep_level = self.visit(dep, stack)?;
            level = level.max(dep_level + 1);
        }

        stack.pop();
        self.marks[node] = Mark::Done;
        self.levels[node] = level;
        Ok(level)
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("plugins", &self.plugins.len())
            .field("edges", &self.edges.iter().map(Vec::len).sum::<usize>())
            .finish()
    }
}

/// Resolve a plugin set into a leveled startup order.
pub fn resolve(plugins: &[Arc<dyn Plugin>]) -> Result<Vec<LeveledPlugin>> {
    let order = DependencyGraph::build(plugins)?.into_order()?;
    tracing::debug!(
        plugins = order.len(),
        levels = order.last().map(|p| p.level + 1).unwrap_or(0),
        "resolved plugin order"
    );
    Ok(order)
}

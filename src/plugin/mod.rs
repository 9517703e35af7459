//! Plugin Host (C10): typed dependency-ordered init/shutdown for the
//! daemon's cooperating subsystems.
//!
//! Grounded on `original_source/.../core/plugin_manager.py` for the shape
//! (metadata, dependency check, topological init, registry, reverse-order
//! cleanup), reimplemented as a typed Rust trait since the teacher daemon
//! itself is monolithic and has no direct analogue. The dependency-DAG
//! ordering reuses the same three-colour DFS cycle detector written for
//! `compose::graph` — both problems are "order a DAG, reject cycles."

mod plugins;
mod registry;

pub use plugins::{AlertNotificationPlugin, ContainerOrchestrationPlugin, FleetMonitorPlugin};
pub use registry::ServiceRegistry;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin '{0}' depends on unknown plugin '{1}'")]
    UnknownDependency(String, String),

    #[error("dependency cycle detected involving plugin '{0}'")]
    Cycle(String),

    #[error("plugin '{0}' failed to initialize: {1}")]
    InitFailed(String, String),
}

pub type PluginResult<T> = Result<T, PluginError>;

#[derive(Debug, Clone)]
pub struct PluginMetadata {
    pub name: &'static str,
    pub depends_on: Vec<&'static str>,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;
    async fn init(&self, registry: &ServiceRegistry) -> PluginResult<()>;
    async fn shutdown(&self);
}

pub struct PluginHost {
    plugins: Vec<Box<dyn Plugin>>,
    init_order: Vec<usize>,
    registry: ServiceRegistry,
}

impl PluginHost {
    /// Build the dependency DAG from `plugins`, topologically sort it, and
    /// run every `init` in that order. On the first failure, already-started
    /// plugins are shut down in reverse order and the error is returned.
    pub async fn load(plugins: Vec<Box<dyn Plugin>>) -> PluginResult<Self> {
        let metadata: Vec<PluginMetadata> = plugins.iter().map(|p| p.metadata()).collect();
        let init_order = topological_order(&metadata)?;

        let registry = ServiceRegistry::new();
        let mut started = Vec::new();

        for &idx in &init_order {
            let plugin = &plugins[idx];
            let name = plugin.metadata().name;
            match plugin.init(&registry).await {
                Ok(()) => {
                    info!(plugin = name, "plugin initialized");
                    started.push(idx);
                }
                Err(e) => {
                    error!(plugin = name, error = %e, "plugin init failed, rolling back");
                    for &done_idx in started.iter().rev() {
                        plugins[done_idx].shutdown().await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            plugins,
            init_order,
            registry,
        })
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn loaded_plugins(&self) -> Vec<&'static str> {
        self.init_order.iter().map(|&i| self.plugins[i].metadata().name).collect()
    }

    /// Shut down every plugin in reverse init order.
    pub async fn shutdown(&self) {
        for &idx in self.init_order.iter().rev() {
            self.plugins[idx].shutdown().await;
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

fn topological_order(metadata: &[PluginMetadata]) -> PluginResult<Vec<usize>> {
    let index_of: HashMap<&str, usize> = metadata.iter().enumerate().map(|(i, m)| (m.name, i)).collect();

    for m in metadata {
        for dep in &m.depends_on {
            if !index_of.contains_key(dep) {
                return Err(PluginError::UnknownDependency(m.name.to_string(), dep.to_string()));
            }
        }
    }

    let mut colors = vec![Color::White; metadata.len()];
    let mut order = Vec::with_capacity(metadata.len());

    for i in 0..metadata.len() {
        if colors[i] == Color::White {
            visit(i, metadata, &index_of, &mut colors, &mut order)?;
        }
    }

    Ok(order)
}

fn visit(
    node: usize,
    metadata: &[PluginMetadata],
    index_of: &HashMap<&str, usize>,
    colors: &mut [Color],
    order: &mut Vec<usize>,
) -> PluginResult<()> {
    colors[node] = Color::Gray;

    for dep in &metadata[node].depends_on {
        let dep_idx = index_of[dep];
        match colors[dep_idx] {
            Color::White => visit(dep_idx, metadata, index_of, colors, order)?,
            Color::Gray => return Err(PluginError::Cycle(metadata[node].name.to_string())),
            Color::Black => {}
        }
    }

    colors[node] = Color::Black;
    // A plugin's dependencies must finish initializing before it does, so
    // they're pushed to `order` first — this is a post-order DFS.
    order.push(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct TestPlugin {
        meta: PluginMetadata,
        init_sequence: Arc<AtomicUsize>,
        recorded: Arc<std::sync::Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn metadata(&self) -> PluginMetadata {
            self.meta.clone()
        }

        async fn init(&self, _registry: &ServiceRegistry) -> PluginResult<()> {
            if self.fail {
                return Err(PluginError::InitFailed(self.meta.name.to_string(), "boom".to_string()));
            }
            self.init_sequence.fetch_add(1, Ordering::SeqCst);
            self.recorded.lock().unwrap().push(self.meta.name);
            Ok(())
        }

        async fn shutdown(&self) {
            self.recorded.lock().unwrap().retain(|n| *n != self.meta.name);
        }
    }

    fn plugin(name: &'static str, deps: &[&'static str], recorded: &Arc<std::sync::Mutex<Vec<&'static str>>>, fail: bool) -> Box<dyn Plugin> {
        Box::new(TestPlugin {
            meta: PluginMetadata {
                name,
                depends_on: deps.to_vec(),
            },
            init_sequence: Arc::new(AtomicUsize::new(0)),
            recorded: recorded.clone(),
            fail,
        })
    }

    #[tokio::test]
    async fn loads_in_dependency_order() {
        let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let plugins = vec![
            plugin("alert_notification", &["container_orchestration"], &recorded, false),
            plugin("fleet_monitor", &[], &recorded, false),
            plugin("container_orchestration", &["fleet_monitor"], &recorded, false),
        ];

        let host = PluginHost::load(plugins).await.unwrap();
        assert_eq!(
            host.loaded_plugins(),
            vec!["fleet_monitor", "container_orchestration", "alert_notification"]
        );
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let plugins = vec![plugin("a", &["nonexistent"], &recorded, false)];
        assert!(PluginHost::load(plugins).await.is_err());
    }

    #[tokio::test]
    async fn cycle_is_rejected() {
        let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let plugins = vec![
            plugin("a", &["b"], &recorded, false),
            plugin("b", &["a"], &recorded, false),
        ];
        assert!(PluginHost::load(plugins).await.is_err());
    }

    #[tokio::test]
    async fn failed_init_rolls_back_already_started_plugins() {
        let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let plugins = vec![
            plugin("fleet_monitor", &[], &recorded, false),
            plugin("container_orchestration", &["fleet_monitor"], &recorded, true),
        ];
        let result = PluginHost::load(plugins).await;
        assert!(result.is_err());
        assert!(recorded.lock().unwrap().is_empty());
    }
}

//! The three cooperating plugins spec.md §2 names, wired through
//! `ServiceRegistry` so later plugins can look up earlier ones' services by
//! name instead of holding direct references.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::alerts::{AlertWorker, Evaluator};
use crate::compose::Compose;
use crate::containers::Containers;
use crate::cron::JobHandle;
use crate::fleet::Fleet;
use crate::monitor::Monitor;
use crate::notifier::{Notifier, NotifierWorker};

use super::{Plugin, PluginError, PluginMetadata, PluginResult, ServiceRegistry};

pub struct FleetMonitorPlugin {
    pub fleet: Arc<Fleet>,
    pub monitor: Arc<Monitor>,
}

#[async_trait]
impl Plugin for FleetMonitorPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: "fleet_monitor",
            depends_on: vec![],
        }
    }

    async fn init(&self, registry: &ServiceRegistry) -> PluginResult<()> {
        registry.insert("fleet", self.fleet.clone());
        registry.insert("monitor", self.monitor.clone());
        self.monitor
            .start_all()
            .await
            .map_err(|e| PluginError::InitFailed("fleet_monitor".to_string(), e.to_string()))
    }

    async fn shutdown(&self) {
        // Individual per-machine jobs are cancelled as machines are deleted;
        // nothing global to tear down here.
    }
}

pub struct ContainerOrchestrationPlugin {
    pub containers: Arc<Containers>,
    pub compose: Arc<Compose>,
}

#[async_trait]
impl Plugin for ContainerOrchestrationPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: "container_orchestration",
            depends_on: vec!["fleet_monitor"],
        }
    }

    async fn init(&self, registry: &ServiceRegistry) -> PluginResult<()> {
        registry.insert("containers", self.containers.clone());
        registry.insert("compose", self.compose.clone());
        Ok(())
    }

    async fn shutdown(&self) {}
}

pub struct AlertNotificationPlugin {
    pub alert_worker: Arc<AlertWorker>,
    pub notifier_worker: Arc<NotifierWorker>,
    pub eval_interval: Duration,
    pub notifier_poll_interval: Duration,
    pub notifier_cleanup_interval: Duration,
    jobs: Mutex<Vec<JobHandle>>,
}

impl AlertNotificationPlugin {
    pub fn new(
        evaluator: Arc<Evaluator>,
        notifier: Arc<Notifier>,
        eval_interval: Duration,
        notifier_poll_interval: Duration,
        notifier_cleanup_interval: Duration,
    ) -> Self {
        Self {
            alert_worker: Arc::new(AlertWorker::new(evaluator)),
            notifier_worker: Arc::new(NotifierWorker::new(notifier)),
            eval_interval,
            notifier_poll_interval,
            notifier_cleanup_interval,
            jobs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Plugin for AlertNotificationPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: "alert_notification",
            depends_on: vec!["container_orchestration"],
        }
    }

    async fn init(&self, registry: &ServiceRegistry) -> PluginResult<()> {
        registry.insert("alert_worker", self.alert_worker.clone());
        registry.insert("notifier_worker", self.notifier_worker.clone());

        let eval_handle = self.alert_worker.start(self.eval_interval).await;
        let (drain_handle, cleanup_handle) = self
            .notifier_worker
            .start(self.notifier_poll_interval, self.notifier_cleanup_interval)
            .await;

        let mut jobs = self.jobs.lock().await;
        jobs.push(eval_handle);
        jobs.push(drain_handle);
        jobs.push(cleanup_handle);
        Ok(())
    }

    async fn shutdown(&self) {
        let jobs = self.jobs.lock().await;
        for job in jobs.iter() {
            job.cancel();
        }
    }
}

//! Compose Orchestrator (C7): validates a multi-service deployment, computes
//! a dependency-respecting deploy order, and rolls a partially-failed deploy
//! back on a best-effort basis.
//!
//! Grounded on the teacher's per-container create/start flow in
//! `containers::engine`, generalized to many services sharing one network,
//! and `original_source/backend/app/plugins/docker/service.py::deploy_compose`'s
//! stratified-topological deploy order.

mod graph;

pub use graph::{stratify, validate};

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::containers::Containers;
use crate::database::{ContainerStore, Database, DeploymentStore};
use crate::error::{DaemonError, Result};
use crate::types::{ComposeConfig, ComposeDeployment, Container};

pub struct Compose {
    containers: Arc<Containers>,
    db: Arc<Database>,
}

impl Compose {
    pub fn new(containers: Arc<Containers>, db: Arc<Database>) -> Self {
        Self { containers, db }
    }

    pub async fn deploy(&self, machine_id: &str, config: ComposeConfig) -> Result<ComposeDeployment> {
        validate(&config)?;
        let layers = stratify(&config)?;

        let deployment_id = Uuid::new_v4().to_string();
        let network_name = ComposeDeployment::network_name_for(&deployment_id);
        self.containers.create_network(machine_id, &network_name).await?;

        let mut created: Vec<(String, Container)> = Vec::new();

        for layer in &layers {
            let mut layer_results = Vec::new();
            for service_name in layer {
                let mut svc_config = config.services[service_name].clone();
                svc_config.network_mode = crate::types::NetworkMode::Custom;
                svc_config.network_name = Some(network_name.clone());
                layer_results.push((service_name.clone(), svc_config));
            }

            let futures = layer_results.into_iter().map(|(name, cfg)| {
                let containers = self.containers.clone();
                let machine_id = machine_id.to_string();
                let deployment_id = deployment_id.clone();
                async move {
                    let container = containers
                        .create_in_deployment(&machine_id, cfg, Some(deployment_id), Some(name.clone()))
                        .await?;
                    Result::<_>::Ok((name, container))
                }
            });

            let outcomes = futures_util::future::join_all(futures).await;
            let mut failed = None;
            for outcome in outcomes {
                match outcome {
                    Ok((name, container)) => created.push((name, container)),
                    Err(e) => {
                        failed = Some(e);
                    }
                }
            }

            if let Some(e) = failed {
                error!(machine_id, error = %e, "compose deploy failed, rolling back");
                self.rollback(machine_id, &network_name, &created).await;
                return Err(e);
            }
        }

        let mut deployment = ComposeDeployment {
            id: deployment_id,
            machine_id: machine_id.to_string(),
            config,
            containers: created.into_iter().collect(),
            network_name,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        self.db
            .with_conn({
                let deployment = deployment.clone();
                move |conn| DeploymentStore::insert(conn, &deployment)
            })
            .await?;

        deployment.updated_at = Utc::now();
        Ok(deployment)
    }

    /// Best-effort teardown of whatever got created before a deploy failed.
    /// Errors removing individual containers are logged, not propagated —
    /// this path runs while already unwinding a failure.
    async fn rollback(&self, machine_id: &str, network_name: &str, created: &[(String, Container)]) {
        for (name, container) in created.iter().rev() {
            if let Err(e) = self.containers.remove(&container.id).await {
                warn!(machine_id, service = name, error = %e, "rollback: failed to remove container");
            }
        }
        if let Err(e) = self.containers.remove_network(machine_id, network_name).await {
            warn!(machine_id, network_name, error = %e, "rollback: failed to remove network");
        }
    }

    pub async fn teardown(&self, deployment_id: &str) -> Result<()> {
        let mut deployment = self
            .db
            .with_conn({
                let id = deployment_id.to_string();
                move |conn| DeploymentStore::get(conn, &id)
            })
            .await?
            .ok_or_else(|| DaemonError::NotFound(deployment_id.to_string()))?;
        deployment.containers = self.containers_by_deployment(deployment_id).await?;

        let layers = stratify(&deployment.config)?;
        for layer in layers.iter().rev() {
            for service_name in layer {
                if let Some(container) = deployment.containers.get(service_name) {
                    if let Err(e) = self.containers.remove(&container.id).await {
                        warn!(deployment_id, service = service_name, error = %e, "teardown: failed to remove container");
                    }
                }
            }
        }

        self.containers
            .remove_network(&deployment.machine_id, &deployment.network_name)
            .await?;

        self.db
            .with_conn({
                let id = deployment_id.to_string();
                move |conn| DeploymentStore::delete(conn, &id)
            })
            .await?;

        info!(deployment_id, "compose deployment torn down");
        Ok(())
    }

    pub async fn get(&self, deployment_id: &str) -> Result<ComposeDeployment> {
        let mut deployment = self
            .db
            .with_conn({
                let id = deployment_id.to_string();
                move |conn| DeploymentStore::get(conn, &id)
            })
            .await?
            .ok_or_else(|| DaemonError::NotFound(deployment_id.to_string()))?;
        deployment.containers = self.containers_by_deployment(deployment_id).await?;
        Ok(deployment)
    }

    async fn containers_by_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<std::collections::HashMap<String, Container>> {
        let rows = self
            .db
            .with_conn({
                let id = deployment_id.to_string();
                move |conn| ContainerStore::list_by_deployment(conn, &id)
            })
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|c| c.service_name.clone().map(|name| (name, c)))
            .collect())
    }
}

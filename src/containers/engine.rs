//! Container Engine (C6): per-machine Docker control over the reverse
//! tunnel, plus a per-container stats poller.
//!
//! Grounded on the teacher's bollard-based container lifecycle calls
//! (create/start/stop/remove/logs/exec), now addressed at a tunneled remote
//! daemon instead of the local one, and the image/volume "ensure" flow from
//! `original_source/backend/app/plugins/docker/service.py`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::tunnel::DockerTunnel;
use crate::database::{ContainerStore, Database};
use crate::error::{DaemonError, DockerError, Result};
use crate::executor::Executor;
use crate::fleet::Fleet;
use crate::timeseries::TimeSeries;
use crate::types::{
    BlockIoStats, Container, ContainerConfig, ContainerState, ContainerStats, CpuStats,
    MemoryStats, NetworkMode, NetworkStats, RestartPolicy,
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);
const MKDIR_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Containers {
    fleet: Arc<Fleet>,
    executor: Arc<Executor>,
    db: Arc<Database>,
    timeseries: Arc<TimeSeries>,
    tunnels: Arc<DashMap<String, Arc<DockerTunnel>>>,
    stats_tasks: DashMap<String, CancellationToken>,
}

impl Containers {
    pub fn new(
        fleet: Arc<Fleet>,
        executor: Arc<Executor>,
        db: Arc<Database>,
        timeseries: Arc<TimeSeries>,
    ) -> Self {
        Self {
            fleet,
            executor,
            db,
            timeseries,
            tunnels: Arc::new(DashMap::new()),
            stats_tasks: DashMap::new(),
        }
    }

    async fn client_for(&self, machine_id: &str) -> Result<Docker> {
        let tunnel = get_or_open_tunnel(&self.tunnels, &self.executor, &self.fleet, machine_id).await?;
        connect(&tunnel)
    }

    /// Pull `image` if it isn't already present locally on the machine.
    async fn ensure_image(&self, docker: &Docker, image: &str) -> Result<()> {
        let inspect = docker.inspect_image(image).await;
        if inspect.is_ok() {
            return Ok(());
        }

        info!(image, "pulling image");
        let mut stream = docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(chunk) = stream.next().await {
            if let Err(e) = chunk {
                return Err(DaemonError::Docker(DockerError::ImagePullFailed {
                    image: image.to_string(),
                    reason: e.to_string(),
                }));
            }
        }
        Ok(())
    }

    pub async fn create(&self, machine_id: &str, config: ContainerConfig) -> Result<Container> {
        self.create_in_deployment(machine_id, config, None, None).await
    }

    /// Same as `create`, but tags the row with the compose deployment and
    /// service name it belongs to, so `ContainerStore::list_by_deployment`
    /// can find it again during teardown. Creates, starts, and leaves the
    /// container `Running` with its stats poller spawned — callers that
    /// only want a `Created` container have no use case in this daemon.
    pub(crate) async fn create_in_deployment(
        &self,
        machine_id: &str,
        config: ContainerConfig,
        deployment_id: Option<String>,
        service_name: Option<String>,
    ) -> Result<Container> {
        let machine = self.fleet.get(machine_id).await?;
        self.ensure_volume_dirs(&machine, &config).await?;

        let docker = self.client_for(machine_id).await?;
        self.ensure_image(&docker, &config.image).await?;

        let bollard_config = to_bollard_config(&config);
        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let created = docker
            .create_container(Some(options), bollard_config)
            .await
            .map_err(|e| map_create_error(e, &config.name))?;

        let container = Container {
            id: Uuid::new_v4().to_string(),
            machine_id: machine_id.to_string(),
            deployment_id,
            service_name,
            config,
            state: ContainerState::Created,
            native_id: Some(created.id),
            stats: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
        };

        self.db
            .with_conn({
                let container = container.clone();
                move |conn| ContainerStore::insert(conn, &container)
            })
            .await?;

        self.start(&container.id).await?;
        self.get(&container.id).await
    }

    /// Ensure every bind-mount's host path exists before `create_container`
    /// runs, so a fresh host with no prior deployment doesn't fail the bind
    /// with "no such file or directory".
    async fn ensure_volume_dirs(&self, machine: &crate::types::Machine, config: &ContainerConfig) -> Result<()> {
        for volume in &config.volumes {
            let command = format!("mkdir -p '{}'", volume.host_path.replace('\'', "'\\''"));
            self.executor.execute(machine, &command, MKDIR_TIMEOUT).await?;
        }
        Ok(())
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        let container = self.get(container_id).await?;
        let native_id = native_id_of(&container)?;
        let docker = self.client_for(&container.machine_id).await?;

        docker
            .start_container(native_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_not_found(e, native_id))?;

        self.db
            .with_conn({
                let id = container.id.clone();
                move |conn| ContainerStore::update_state(conn, &id, ContainerState::Running, None)
            })
            .await?;

        self.spawn_stats_task(container_id.to_string());
        Ok(())
    }

    pub async fn stop(&self, container_id: &str) -> Result<()> {
        let container = self.get(container_id).await?;
        let native_id = native_id_of(&container)?;
        let docker = self.client_for(&container.machine_id).await?;

        docker
            .stop_container(native_id, Some(StopContainerOptions { t: 10 }))
            .await
            .map_err(|e| map_not_found(e, native_id))?;

        self.stop_stats_task(container_id);

        self.db
            .with_conn({
                let id = container.id.clone();
                move |conn| ContainerStore::update_state(conn, &id, ContainerState::Stopped, None)
            })
            .await?;
        Ok(())
    }

    pub async fn remove(&self, container_id: &str) -> Result<()> {
        self.remove_with_force(container_id, true).await
    }

    pub async fn remove_with_force(&self, container_id: &str, force: bool) -> Result<()> {
        let container = self.get(container_id).await?;
        self.stop_stats_task(container_id);

        if let Some(native_id) = &container.native_id {
            let docker = self.client_for(&container.machine_id).await?;
            let result = docker
                .remove_container(
                    native_id,
                    Some(RemoveContainerOptions {
                        force,
                        ..Default::default()
                    }),
                )
                .await;
            if let Err(e) = result {
                if !is_not_found(&e) {
                    return Err(DaemonError::Docker(DockerError::Bollard(e)));
                }
            }
        }

        self.db
            .with_conn({
                let id = container.id.clone();
                move |conn| ContainerStore::delete(conn, &id)
            })
            .await?;
        Ok(())
    }

    pub async fn logs(&self, container_id: &str, tail: &str) -> Result<String> {
        let container = self.get(container_id).await?;
        let native_id = native_id_of(&container)?;
        let docker = self.client_for(&container.machine_id).await?;

        let mut stream = docker.logs(
            native_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => output.push_str(&log.to_string()),
                Err(e) => return Err(DaemonError::Docker(DockerError::Bollard(e))),
            }
        }
        Ok(output)
    }

    pub async fn exec(&self, container_id: &str, command: Vec<String>) -> Result<String> {
        let container = self.get(container_id).await?;
        let native_id = native_id_of(&container)?;
        let docker = self.client_for(&container.machine_id).await?;

        let exec = docker
            .create_exec(
                native_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| DaemonError::Docker(DockerError::Bollard(e)))?;

        let mut output = String::new();
        if let StartExecResults::Attached { mut output: stream, .. } = docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| DaemonError::Docker(DockerError::Bollard(e)))?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(log) => output.push_str(&log.to_string()),
                    Err(e) => return Err(DaemonError::Docker(DockerError::Bollard(e))),
                }
            }
        }
        Ok(output)
    }

    /// Create a user-defined bridge network on `machine_id`, for compose
    /// deployments to attach their containers to. Idempotent: an existing
    /// network with the same name is left alone.
    pub async fn create_network(&self, machine_id: &str, name: &str) -> Result<()> {
        let docker = self.client_for(machine_id).await?;
        if docker.inspect_network::<String>(name, None).await.is_ok() {
            return Ok(());
        }
        docker
            .create_network(bollard::network::CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| DaemonError::Docker(DockerError::Bollard(e)))?;
        Ok(())
    }

    pub async fn remove_network(&self, machine_id: &str, name: &str) -> Result<()> {
        let docker = self.client_for(machine_id).await?;
        let result = docker.remove_network(name).await;
        if let Err(e) = result {
            if !is_not_found(&e) {
                return Err(DaemonError::Docker(DockerError::Bollard(e)));
            }
        }
        Ok(())
    }

    pub async fn get(&self, container_id: &str) -> Result<Container> {
        self.db
            .with_conn({
                let id = container_id.to_string();
                move |conn| ContainerStore::get(conn, &id)
            })
            .await?
            .ok_or_else(|| DaemonError::Docker(DockerError::NotFound(container_id.to_string())))
    }

    pub async fn list_by_machine(&self, machine_id: &str) -> Result<Vec<Container>> {
        let machine_id = machine_id.to_string();
        Ok(self.db.with_conn(move |conn| ContainerStore::list_by_machine(conn, &machine_id)).await?)
    }

    fn spawn_stats_task(&self, container_id: String) {
        if self.stats_tasks.contains_key(&container_id) {
            return;
        }
        let cancel = CancellationToken::new();
        self.stats_tasks.insert(container_id.clone(), cancel.clone());

        let db = self.db.clone();
        let timeseries = self.timeseries.clone();
        let fleet = self.fleet.clone();
        let executor = self.executor.clone();
        let tunnels = self.tunnels.clone();
        let poll_id = container_id.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = poll_once(&db, &timeseries, &fleet, &executor, &tunnels, &poll_id).await {
                            warn!(container_id = %poll_id, error = %e, "container stats poll failed");
                        }
                    }
                }
            }
        });
    }

    fn stop_stats_task(&self, container_id: &str) {
        if let Some((_, cancel)) = self.stats_tasks.remove(container_id) {
            cancel.cancel();
        }
    }
}

async fn poll_once(
    db: &Database,
    timeseries: &TimeSeries,
    fleet: &Fleet,
    executor: &Arc<Executor>,
    tunnels: &Arc<DashMap<String, Arc<DockerTunnel>>>,
    container_id: &str,
) -> Result<()> {
    let container = db
        .with_conn({
            let id = container_id.to_string();
            move |conn| ContainerStore::get(conn, &id)
        })
        .await?
        .ok_or_else(|| DaemonError::Docker(DockerError::NotFound(container_id.to_string())))?;

    let tunnel = get_or_open_tunnel(tunnels, executor, fleet, &container.machine_id).await?;
    let docker = connect(&tunnel)?;

    let native_id = native_id_of(&container)?;
    let mut stream = docker.stats(native_id, Some(StatsOptions { stream: false, ..Default::default() }));
    let Some(Ok(stats)) = stream.next().await else {
        return Ok(());
    };

    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
    let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
    let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
        (cpu_delta / system_delta) * online_cpus * 100.0
    } else {
        0.0
    };

    let mem_usage = stats.memory_stats.usage.unwrap_or(0);
    let mem_limit = stats.memory_stats.limit.unwrap_or(0);

    let (rx_bytes, tx_bytes) = stats
        .networks
        .unwrap_or_default()
        .values()
        .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes));

    let (read_bytes, write_bytes) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .unwrap_or_default()
        .iter()
        .fold((0u64, 0u64), |(r, w), entry| match entry.op.as_str() {
            "read" | "Read" => (r + entry.value, w),
            "write" | "Write" => (r, w + entry.value),
            _ => (r, w),
        });

    let pids = stats.pids_stats.current.unwrap_or(0);

    let snapshot = ContainerStats {
        cpu: CpuStats { usage_percent: cpu_percent },
        memory: MemoryStats { usage_bytes: mem_usage, limit_bytes: mem_limit },
        network: NetworkStats { rx_bytes, tx_bytes },
        block_io: BlockIoStats { read_bytes, write_bytes },
        pids,
        timestamp: Utc::now(),
    };

    let mut updated = container.clone();
    updated.stats = Some(snapshot.clone());
    db.with_conn(move |conn| ContainerStore::update(conn, &updated)).await?;

    let ts = Utc::now().timestamp();
    let mut labels = std::collections::BTreeMap::new();
    labels.insert("container_id".to_string(), container_id.to_string());

    for (name, value) in [
        ("container.cpu.usage", cpu_percent),
        ("container.memory.usage", mem_usage as f64),
        ("container.network.rx", rx_bytes as f64),
        ("container.network.tx", tx_bytes as f64),
        ("container.blk.read", read_bytes as f64),
        ("container.blk.write", write_bytes as f64),
        ("container.pids", pids as f64),
    ] {
        timeseries.ingest(name, &labels, value, ts).await?;
    }

    Ok(())
}

/// Fetch the cached tunnel for `machine_id`, opening one if this is the
/// first call. Shared by lifecycle calls and the per-container stats poller
/// so both reuse the same relay instead of each opening their own.
async fn get_or_open_tunnel(
    tunnels: &DashMap<String, Arc<DockerTunnel>>,
    executor: &Arc<Executor>,
    fleet: &Fleet,
    machine_id: &str,
) -> Result<Arc<DockerTunnel>> {
    if let Some(existing) = tunnels.get(machine_id) {
        return Ok(existing.clone());
    }
    let machine = fleet.get(machine_id).await?;
    let tunnel = Arc::new(DockerTunnel::open(executor.clone(), machine).await?);
    tunnels.insert(machine_id.to_string(), tunnel.clone());
    Ok(tunnel)
}

fn connect(tunnel: &DockerTunnel) -> Result<Docker> {
    Docker::connect_with_http(&format!("http://{}", tunnel.local_addr), 120, bollard::API_DEFAULT_VERSION)
        .map_err(|e| DaemonError::Docker(DockerError::Bollard(e)))
}

fn native_id_of(container: &Container) -> Result<&str> {
    container
        .native_id
        .as_deref()
        .ok_or_else(|| DaemonError::Docker(DockerError::NotFound(container.id.clone())))
}

fn to_bollard_config(config: &ContainerConfig) -> BollardConfig<String> {
    let port_bindings = if config.ports.is_empty() {
        None
    } else {
        let mut map: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &config.ports {
            map.insert(
                format!("{}/{}", port.container_port, port.protocol),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }
        Some(map)
    };

    let binds = if config.volumes.is_empty() {
        None
    } else {
        Some(
            config
                .volumes
                .iter()
                .map(|v| {
                    format!(
                        "{}:{}{}",
                        v.host_path,
                        v.container_path,
                        if v.read_only { ":ro" } else { "" }
                    )
                })
                .collect(),
        )
    };

    let network_mode = match config.network_mode {
        NetworkMode::Host => Some("host".to_string()),
        NetworkMode::None => Some("none".to_string()),
        NetworkMode::Bridge => Some("bridge".to_string()),
        NetworkMode::Custom => config.network_name.clone(),
    };

    let restart_policy = bollard::models::RestartPolicy {
        name: Some(match config.restart_policy {
            RestartPolicy::No => bollard::models::RestartPolicyNameEnum::NO,
            RestartPolicy::Always => bollard::models::RestartPolicyNameEnum::ALWAYS,
            RestartPolicy::OnFailure => bollard::models::RestartPolicyNameEnum::ON_FAILURE,
            RestartPolicy::UnlessStopped => bollard::models::RestartPolicyNameEnum::UNLESS_STOPPED,
        }),
        maximum_retry_count: None,
    };

    let host_config = HostConfig {
        port_bindings,
        binds,
        network_mode,
        restart_policy: Some(restart_policy),
        nano_cpus: config.resources.cpu_limit.map(|c| (c * 1_000_000_000.0) as i64),
        memory: config.resources.memory_bytes,
        memory_swap: config.resources.memory_swap_bytes,
        memory_reservation: config.resources.memory_reservation_bytes,
        cpu_shares: config.resources.cpu_shares,
        ..Default::default()
    };

    BollardConfig {
        image: Some(config.image.clone()),
        entrypoint: config.entrypoint.clone(),
        cmd: config.command.clone(),
        env: Some(
            config
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
        ),
        labels: Some(config.labels.clone()),
        host_config: Some(host_config),
        exposed_ports: if config.ports.is_empty() {
            None
        } else {
            Some(
                config
                    .ports
                    .iter()
                    .map(|p| (format!("{}/{}", p.container_port, p.protocol), HashMap::new()))
                    .collect(),
            )
        },
        ..Default::default()
    }
}

fn map_create_error(e: bollard::errors::Error, name: &str) -> DaemonError {
    if is_conflict(&e) {
        DaemonError::Docker(DockerError::NameConflict(name.to_string()))
    } else {
        DaemonError::Docker(DockerError::Bollard(e))
    }
}

fn map_not_found(e: bollard::errors::Error, native_id: &str) -> DaemonError {
    if is_not_found(&e) {
        DaemonError::Docker(DockerError::NotFound(native_id.to_string()))
    } else {
        DaemonError::Docker(DockerError::Bollard(e))
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(e, bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == 404)
}

fn is_conflict(e: &bollard::errors::Error) -> bool {
    matches!(e, bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == 409)
}

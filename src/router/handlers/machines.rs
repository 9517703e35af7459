//! Fleet Registry HTTP surface: CRUD, broadcast command execution, the
//! Docker-install bootstrap, and per-machine monitor cadence overrides.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};
use crate::fleet::{CommandOutcome, RegisterMachine};
use crate::types::{Machine, MachineStatus, SystemMetrics};

use super::super::AppState;

/// `Machine` minus its encrypted key material — never serialize that blob
/// back to a client.
#[derive(Debug, Clone, Serialize)]
pub struct MachineView {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub status: MachineStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
    pub owner: Option<String>,
    pub system_info: Option<SystemMetrics>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Machine> for MachineView {
    fn from(m: Machine) -> Self {
        Self {
            id: m.id,
            name: m.name,
            ip: m.ip,
            ssh_port: m.ssh_port,
            ssh_user: m.ssh_user,
            status: m.status,
            last_seen: m.last_seen,
            tags: m.tags,
            owner: m.owner,
            system_info: m.system_info,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(register).get(list))
        .route("/command", post(broadcast_command))
        .route("/:id", get(get_machine).put(update_machine).delete(delete_machine))
        .route("/:id/setup", post(setup))
        .route("/:id/monitoring", put(set_monitoring))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub ip: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    /// Base64-encoded private key (PEM or raw OpenSSH format).
    pub private_key: String,
    pub passphrase: Option<String>,
    pub owner: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

async fn register(State(state): State<AppState>, Json(req): Json<RegisterRequest>) -> Result<Json<MachineView>> {
    let private_key = STANDARD
        .decode(req.private_key)
        .map_err(|e| DaemonError::validation("private_key", format!("not valid base64: {e}")))?;

    let machine = state
        .fleet
        .register(RegisterMachine {
            name: req.name,
            ip: req.ip,
            ssh_port: req.ssh_port,
            ssh_user: req.ssh_user,
            private_key,
            passphrase: req.passphrase,
            owner: req.owner,
            tags: req.tags,
        })
        .await?;

    state.monitor.watch(&machine.id).await;
    Ok(Json(machine.into()))
}

async fn list(State(state): State<AppState>) -> Result<Json<Vec<MachineView>>> {
    let machines = state.fleet.list().await?;
    Ok(Json(machines.into_iter().map(MachineView::from).collect()))
}

async fn get_machine(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<MachineView>> {
    let machine = state.fleet.get(&id).await?;
    Ok(Json(machine.into()))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub tags: Option<HashMap<String, String>>,
    pub owner: Option<String>,
}

async fn update_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRequest>,
) -> Result<Json<MachineView>> {
    let machine = state.fleet.update(&id, req.tags, req.owner).await?;
    Ok(Json(machine.into()))
}

async fn delete_machine(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    state.monitor.unwatch(&id);
    state.fleet.delete(&id).await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub machines: Option<Vec<String>>,
    pub command: String,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    30
}

async fn broadcast_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<HashMap<String, CommandOutcome>>> {
    let outcomes = state
        .fleet
        .command(req.machines, &req.command, Duration::from_secs(req.timeout_secs))
        .await?;
    Ok(Json(outcomes))
}

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    #[serde(default = "default_setup_timeout")]
    pub timeout_secs: u64,
}

fn default_setup_timeout() -> u64 {
    300
}

async fn setup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(req): Query<SetupRequest>,
) -> Result<Json<CommandOutcome>> {
    let outcome = state.fleet.setup(&id, Duration::from_secs(req.timeout_secs)).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct MonitoringQuery {
    pub interval: u64,
}

async fn set_monitoring(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MonitoringQuery>,
) -> Result<Json<serde_json::Value>> {
    if query.interval < state.config.monitor.min_interval_secs {
        return Err(DaemonError::validation(
            "interval",
            format!("must be at least {} seconds", state.config.monitor.min_interval_secs),
        ));
    }
    // Touch the machine so a bad id 404s instead of silently scheduling a
    // job for a machine that doesn't exist.
    state.fleet.get(&id).await?;
    state.monitor.set_interval(&id, Duration::from_secs(query.interval)).await;
    Ok(Json(serde_json::json!({"interval_secs": query.interval})))
}

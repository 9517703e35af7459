//! Container Engine HTTP surface: create/list/start/stop/exec/remove/logs
//! over the per-machine Docker tunnel.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::Result;
use crate::types::{Container, ContainerConfig};

use super::super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/containers", post(create).get(list))
        .route("/containers/:id", get(get_container).delete(remove))
        .route("/containers/:id/start", post(start))
        .route("/containers/:id/stop", post(stop))
        .route("/containers/:id/exec", post(exec))
        .route("/containers/:id/logs", get(logs))
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub machine_id: String,
    #[serde(flatten)]
    pub config: ContainerConfig,
}

async fn create(State(state): State<AppState>, Json(req): Json<CreateRequest>) -> Result<Json<Container>> {
    let container = state.containers.create(&req.machine_id, req.config).await?;
    Ok(Json(container))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub machine_id: String,
}

async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<Json<Vec<Container>>> {
    let containers = state.containers.list_by_machine(&query.machine_id).await?;
    Ok(Json(containers))
}

async fn get_container(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Container>> {
    let container = state.containers.get(&id).await?;
    Ok(Json(container))
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(default = "default_force")]
    pub force: bool,
}

fn default_force() -> bool {
    true
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<serde_json::Value>> {
    state.containers.remove_with_force(&id, query.force).await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

async fn start(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    state.containers.start(&id).await?;
    Ok(Json(serde_json::json!({"started": true})))
}

async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    state.containers.stop(&id).await?;
    Ok(Json(serde_json::json!({"stopped": true})))
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
}

async fn exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<serde_json::Value>> {
    let output = state.containers.exec(&id, req.command).await?;
    Ok(Json(serde_json::json!({"output": output})))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: String,
}

fn default_tail() -> String {
    "100".to_string()
}

async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>> {
    let output = state.containers.logs(&id, &query.tail).await?;
    Ok(Json(serde_json::json!({"logs": output})))
}

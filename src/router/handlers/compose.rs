//! Compose Orchestrator HTTP surface: deploy and tear down multi-service
//! stacks on a single machine.

use axum::extract::{Path, Query, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::Result;
use crate::types::{ComposeConfig, ComposeDeployment};

use super::super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(deploy))
        .route("/:id", axum::routing::get(get_deployment).delete(teardown))
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub machine_id: String,
    #[serde(flatten)]
    pub config: ComposeConfig,
}

async fn deploy(State(state): State<AppState>, Json(req): Json<DeployRequest>) -> Result<Json<ComposeDeployment>> {
    let deployment = state.compose.deploy(&req.machine_id, req.config).await?;
    Ok(Json(deployment))
}

async fn get_deployment(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ComposeDeployment>> {
    let deployment = state.compose.get(&id).await?;
    Ok(Json(deployment))
}

#[derive(Debug, Deserialize)]
pub struct TeardownQuery {
    #[serde(default)]
    pub force: bool,
}

async fn teardown(
    State(state): State<AppState>,
    Path(id): Path<String>,
    // `Compose::teardown` already removes every container/network
    // best-effort, logging rather than failing on individual errors, so
    // there's nothing left for `force` to change — accepted for API
    // symmetry with the container delete endpoint.
    Query(_query): Query<TeardownQuery>,
) -> Result<Json<serde_json::Value>> {
    state.compose.teardown(&id).await?;
    Ok(Json(serde_json::json!({"torn_down": true})))
}

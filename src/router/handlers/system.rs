//! Unauthenticated health/metrics probes, plus the authenticated `/system`
//! summary. Grounded on the teacher's `handlers/system.rs` shape
//! (`num_cpus::get()` + a manager count), minus `sysinfo` — this daemon's
//! Docker access is always per-machine over an SSH tunnel, so there is no
//! local Docker socket to introspect the way the teacher's `system_info`
//! handler does.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;

use crate::error::Result;

use super::super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub plugins: Vec<&'static str>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        plugins: state.plugin_host.loaded_plugins(),
    })
}

pub async fn metrics() -> Response {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub version: &'static str,
    pub architecture: &'static str,
    pub cpu_count: usize,
    pub os: &'static str,
    pub machine_count: usize,
}

pub async fn system_info(State(state): State<AppState>) -> Result<Json<SystemInfo>> {
    let machine_count = state.fleet.list().await?.len();
    Ok(Json(SystemInfo {
        version: env!("CARGO_PKG_VERSION"),
        architecture: std::env::consts::ARCH,
        cpu_count: num_cpus::get(),
        os: std::env::consts::OS,
        machine_count,
    }))
}

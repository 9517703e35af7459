//! HTTP API surface: a bearer-token- and rate-limit-gated axum router over
//! every control-plane operation, plus unauthenticated health/metrics probes.
//!
//! Grounded on the teacher's `router/mod.rs` (nested per-resource `Router<AppState>`
//! builders, `TraceLayer`/`CorsLayer` global layers, `from_fn_with_state` auth) and
//! `router/middleware/auth.rs` (bearer check shape), generalized from the
//! teacher's two-part `token_id.token` scheme to this daemon's single static
//! `bearer_token`, and extended with per-IP rate limiting via `governor`
//! (the teacher has no equivalent — this crate is multi-tenant-adjacent in a
//! way the teacher's single-operator daemon isn't).

mod handlers;
mod middleware;

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::alerts::Evaluator;
use crate::compose::Compose;
use crate::config::Configuration;
use crate::containers::Containers;
use crate::database::Database;
use crate::fleet::Fleet;
use crate::monitor::Monitor;
use crate::notifier::Notifier;
use crate::plugin::PluginHost;
use crate::timeseries::TimeSeries;

pub type IpRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<Fleet>,
    pub containers: Arc<Containers>,
    pub compose: Arc<Compose>,
    pub timeseries: Arc<TimeSeries>,
    pub db: Arc<Database>,
    pub monitor: Arc<Monitor>,
    pub evaluator: Arc<Evaluator>,
    pub notifier: Arc<Notifier>,
    pub plugin_host: Arc<PluginHost>,
    pub config: Arc<Configuration>,
    pub rate_limiter: Arc<IpRateLimiter>,
}

impl AppState {
    pub fn new_rate_limiter(requests_per_period: u32, period_secs: u64) -> Arc<IpRateLimiter> {
        let burst = NonZeroU32::new(requests_per_period.max(1)).unwrap();
        let quota = Quota::with_period(std::time::Duration::from_secs(period_secs.max(1)))
            .unwrap()
            .allow_burst(burst);
        Arc::new(RateLimiter::keyed(quota))
    }
}

/// Build the full router: `/health` and `/metrics` sit outside the
/// auth+rate-limit layered `/api/v1` nest, exactly as the teacher keeps
/// `/download/*` outside its auth-layered `/api` nest.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .nest("/machines", handlers::machines::routes())
        .nest("/docker", handlers::containers::routes())
        .nest("/docker/compose", handlers::compose::routes())
        .nest("/monitoring", handlers::monitoring::routes())
        .route("/system", get(handlers::system::system_info))
        // Rate limit wraps outermost so abusive unauthenticated traffic is
        // throttled before it even reaches the bearer-token check.
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::require_auth))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::rate_limit));

    Router::new()
        .route("/health", get(handlers::system::health))
        .route("/metrics", get(handlers::system::metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

pub fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": true, "code": "not_found", "message": "no such route"})),
    )
        .into_response()
}

//! Bearer-token admission and per-IP rate limiting. Ported from the
//! teacher's `router/middleware/auth.rs` shape (check header, short-circuit
//! with a JSON 401 on mismatch) but against this daemon's single static
//! `bearer_token` instead of the teacher's `token_id.token` pair.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;

pub async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let expected = format!("Bearer {}", state.config.api.bearer_token);
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(token) if token == expected => next.run(request).await,
        _ => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": true, "code": "unauthorized", "message": "missing or invalid bearer token"})),
    )
        .into_response()
}

pub async fn rate_limit(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let ip: IpAddr = connect_info.map(|ci| ci.0.ip()).unwrap_or(IpAddr::from([0, 0, 0, 0]));

    match state.rate_limiter.check_key(&ip) {
        Ok(()) => next.run(request).await,
        Err(_) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": true, "code": "rate_limited", "message": "too many requests"})),
        )
            .into_response(),
    }
}

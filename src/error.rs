//! Crate-wide error taxonomy

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;

/// Docker-specific error family, always wrapped in `DaemonError::Docker`.
#[derive(Error, Debug)]
pub enum DockerError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container name already in use: {0}")]
    NameConflict(String),

    #[error("failed to pull image {image}: {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("docker daemon unreachable on machine {0}")]
    DaemonUnreachable(String),

    #[error("bollard error: {0}")]
    Bollard(#[from] bollard::errors::Error),
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("connect error: {0}")]
    ConnectError(String),

    #[error("exec timed out after {0:?}")]
    ExecTimeout(std::time::Duration),

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("validation error: {0:?}")]
    ValidationError(HashMap<String, String>),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("plugin error: {0}")]
    PluginError(String),

    #[error("monitoring error: {0}")]
    MonitoringError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("name already taken: {0}")]
    NameConflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] crate::database::DatabaseError),
}

impl DaemonError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = HashMap::new();
        fields.insert(field.into(), message.into());
        Self::ValidationError(fields)
    }

    /// Stable machine-readable error code, carried alongside the HTTP body.
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::ConnectError(_) => "connect_error",
            DaemonError::ExecTimeout(_) => "exec_timeout",
            DaemonError::ChannelError(_) => "channel_error",
            DaemonError::Docker(DockerError::NotFound(_)) => "docker_not_found",
            DaemonError::Docker(DockerError::NameConflict(_)) => "docker_name_conflict",
            DaemonError::Docker(DockerError::ImagePullFailed { .. }) => "docker_image_pull_failed",
            DaemonError::Docker(DockerError::DaemonUnreachable(_)) => "docker_daemon_unreachable",
            DaemonError::Docker(DockerError::Bollard(_)) => "docker_error",
            DaemonError::ValidationError(_) => "validation_error",
            DaemonError::ConfigurationError(_) => "configuration_error",
            DaemonError::PluginError(_) => "plugin_error",
            DaemonError::MonitoringError(_) => "monitoring_error",
            DaemonError::NotFound(_) => "not_found",
            DaemonError::NameConflict(_) => "name_conflict",
            DaemonError::Internal(_) => "internal_error",
            DaemonError::Database(_) => "database_error",
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = match &self {
            DaemonError::ConnectError(_) => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::ExecTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DaemonError::ChannelError(_) => StatusCode::BAD_GATEWAY,
            DaemonError::Docker(DockerError::NotFound(_)) => StatusCode::NOT_FOUND,
            DaemonError::Docker(DockerError::NameConflict(_)) => StatusCode::CONFLICT,
            DaemonError::Docker(DockerError::ImagePullFailed { .. }) => StatusCode::BAD_GATEWAY,
            DaemonError::Docker(DockerError::DaemonUnreachable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::Docker(DockerError::Bollard(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::ValidationError(_) => StatusCode::BAD_REQUEST,
            DaemonError::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::PluginError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::MonitoringError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::NameConflict(_) => StatusCode::CONFLICT,
            DaemonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            DaemonError::ValidationError(fields) => json!({
                "error": true,
                "code": self.code(),
                "message": self.to_string(),
                "fields": fields,
            }),
            _ => json!({
                "error": true,
                "code": self.code(),
                "message": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::container::Container;

/// One named service inside a `ComposeConfig`; identical shape to
/// `ContainerConfig` but the service name stands in for `ContainerConfig::name`
/// and `depends_on` is the field the orchestrator actually reads.
pub type ComposeService = super::container::ContainerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    pub version: String,
    pub services: HashMap<String, ComposeService>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeDeployment {
    pub id: String,
    pub machine_id: String,
    pub config: ComposeConfig,
    pub containers: HashMap<String, Container>,
    pub network_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComposeDeployment {
    pub fn network_name_for(deployment_id: &str) -> String {
        format!("compose_{deployment_id}")
    }
}

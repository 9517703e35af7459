use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A remote Linux host under management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    /// Ciphertext produced by the Key Vault; never decrypted outside `executor`.
    pub encrypted_key: Vec<u8>,
    pub passphrase: Option<String>,
    pub status: MachineStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
    pub owner: Option<String>,
    pub system_info: Option<SystemMetrics>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped on every state-machine write.
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Initializing,
    Active,
    Inactive,
    Error,
    Maintenance,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Initializing => "initializing",
            MachineStatus::Active => "active",
            MachineStatus::Inactive => "inactive",
            MachineStatus::Error => "error",
            MachineStatus::Maintenance => "maintenance",
        }
    }
}

impl std::str::FromStr for MachineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initializing" => Ok(Self::Initializing),
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "error" => Ok(Self::Error),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(format!("unknown machine status: {other}")),
        }
    }
}

/// Snapshot of host health, embedded in `Machine`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_usage: f64,
    pub cpu_cores: u32,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_free: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub docker_running: bool,
    pub containers_total: u32,
    pub containers_running: u32,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub uptime_seconds: u64,
    pub last_update: Option<DateTime<Utc>>,
}

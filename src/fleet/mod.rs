//! Fleet Registry (C3): CRUD over registered machines plus the probe path
//! that advances a machine through its status state-machine.
//!
//! Grounded on the teacher's `Manager` (machine registry wrapping a store +
//! validation) generalized from containers to hosts, and
//! `original_source/backend/app/plugins/machines/service.py` for the
//! name/IP validation rules and state-machine shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::{Database, MachineStore};
use crate::error::{DaemonError, Result};
use crate::executor::Executor;
use crate::monitor::{next_state, ProbeOutcome};
use crate::types::{Machine, MachineStatus, SystemMetrics};
use crate::vault::KeyVault;

/// Outcome of running a command on one machine as part of a fleet-wide
/// broadcast. Unlike `Fleet`'s other methods this never propagates a
/// per-machine error up — the caller wants to see every machine's result,
/// including the ones that failed to connect.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl From<crate::executor::ExecResult> for CommandOutcome {
    fn from(result: crate::executor::ExecResult) -> Self {
        Self {
            success: result.exit_code == 0,
            exit_code: Some(result.exit_code),
            stdout: result.stdout,
            stderr: result.stderr,
            error: None,
        }
    }
}

impl CommandOutcome {
    fn connect_error(message: String) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(message),
        }
    }
}

fn name_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}$").unwrap())
}

fn ip_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$").unwrap()
    })
}

fn validate_ip(ip: &str) -> bool {
    match ip_pattern().captures(ip) {
        Some(caps) => (1..=4).all(|i| caps[i].parse::<u16>().map(|o| o <= 255).unwrap_or(false)),
        None => false,
    }
}

/// Parameters accepted by `Fleet::register`. The raw private key is consumed
/// and encrypted immediately; it never appears in `Machine`.
pub struct RegisterMachine {
    pub name: String,
    pub ip: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub private_key: Vec<u8>,
    pub passphrase: Option<String>,
    pub owner: Option<String>,
    pub tags: std::collections::HashMap<String, String>,
}

pub struct Fleet {
    db: Arc<Database>,
    vault: Arc<KeyVault>,
    executor: Arc<Executor>,
}

impl Fleet {
    pub fn new(db: Arc<Database>, vault: Arc<KeyVault>, executor: Arc<Executor>) -> Self {
        Self { db, vault, executor }
    }

    pub async fn register(&self, params: RegisterMachine) -> Result<Machine> {
        if !name_pattern().is_match(&params.name) {
            return Err(DaemonError::validation(
                "name",
                "must be 1-64 characters of alphanumerics, '-' or '_'",
            ));
        }
        if !validate_ip(&params.ip) {
            return Err(DaemonError::validation("ip", "must be a valid IPv4 address"));
        }

        if self
            .db
            .with_conn({
                let name = params.name.clone();
                move |conn| MachineStore::get_by_name(conn, &name)
            })
            .await?
            .is_some()
        {
            return Err(DaemonError::NameConflict(params.name));
        }

        let encrypted_key = self.vault.encrypt(&params.private_key)?;
        let now = Utc::now();
        let machine = Machine {
            id: Uuid::new_v4().to_string(),
            name: params.name,
            ip: params.ip,
            ssh_port: params.ssh_port,
            ssh_user: params.ssh_user,
            encrypted_key,
            passphrase: params.passphrase,
            status: MachineStatus::Initializing,
            last_seen: None,
            tags: params.tags,
            owner: params.owner,
            system_info: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        self.db
            .with_conn({
                let machine = machine.clone();
                move |conn| MachineStore::insert(conn, &machine)
            })
            .await?;

        info!(machine_id = %machine.id, name = %machine.name, "machine registered");
        Ok(machine)
    }

    pub async fn get(&self, id: &str) -> Result<Machine> {
        self.db
            .with_conn({
                let id = id.to_string();
                move |conn| MachineStore::get(conn, &id)
            })
            .await?
            .ok_or_else(|| DaemonError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Machine>> {
        Ok(self.db.with_conn(MachineStore::list).await?)
    }

    /// Probe `machine` over SSH and advance its status via
    /// `monitor::next_state`: a transport/auth-level failure is a
    /// `ConnectFail` (drops an `Active` machine to `Inactive`, not `Error`
    /// — spec.md's `ACTIVE --connect_fail--> INACTIVE` arrow), while a
    /// probe that connects but returns a nonzero exit or unparsable output
    /// is a `ParseFail` (`ACTIVE --parse_fail--> ERROR`).
    pub async fn probe(&self, machine: &Machine, timeout: Duration) -> Result<SystemMetrics> {
        const PROBE_SCRIPT: &str = include_str!("probe.sh");

        match self.executor.execute(machine, PROBE_SCRIPT, timeout).await {
            Ok(result) if result.exit_code == 0 => match parse_probe_output(&result.stdout) {
                Ok(metrics) => {
                    self.transition(machine, ProbeOutcome::Success, Some(&metrics)).await?;
                    Ok(metrics)
                }
                Err(e) => {
                    warn!(machine_id = %machine.id, error = %e, "probe output unparsable");
                    self.transition(machine, ProbeOutcome::ParseFail, None).await?;
                    Err(e)
                }
            },
            Ok(result) => {
                warn!(machine_id = %machine.id, exit_code = result.exit_code, "probe script failed");
                self.transition(machine, ProbeOutcome::ParseFail, None).await?;
                Err(DaemonError::MonitoringError(format!(
                    "probe exited {}: {}",
                    result.exit_code, result.stderr
                )))
            }
            Err(e) => {
                warn!(machine_id = %machine.id, error = %e, "probe connect failed");
                self.transition(machine, ProbeOutcome::ConnectFail, None).await?;
                Err(e)
            }
        }
    }

    async fn transition(
        &self,
        machine: &Machine,
        outcome: ProbeOutcome,
        metrics: Option<&SystemMetrics>,
    ) -> Result<()> {
        let new_status = next_state(machine.status, outcome);
        let last_seen = matches!(outcome, ProbeOutcome::Success).then(Utc::now);
        self.db
            .with_conn({
                let id = machine.id.clone();
                let metrics = metrics.cloned();
                move |conn| MachineStore::update_status(conn, &id, new_status, last_seen, metrics.as_ref())
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.executor.evict(id);
        self.db
            .with_conn({
                let id = id.to_string();
                move |conn| MachineStore::delete(conn, &id)
            })
            .await?;
        Ok(())
    }

    /// Update the mutable, operator-facing fields of a machine. Identity
    /// fields (name, ip, ssh credentials) are immutable after registration —
    /// delete and re-register instead.
    pub async fn update(
        &self,
        id: &str,
        tags: Option<HashMap<String, String>>,
        owner: Option<String>,
    ) -> Result<Machine> {
        let mut machine = self.get(id).await?;
        if let Some(tags) = tags {
            machine.tags = tags;
        }
        if owner.is_some() {
            machine.owner = owner;
        }

        self.db
            .with_conn({
                let machine = machine.clone();
                move |conn| MachineStore::update(conn, &machine)
            })
            .await?;

        self.get(id).await
    }

    /// Install Docker on a freshly-registered host via an apt-based script.
    /// Idempotent: a host that already has Docker installed reports success
    /// without reinstalling.
    pub async fn setup(&self, id: &str, timeout: Duration) -> Result<CommandOutcome> {
        const SETUP_SCRIPT: &str = include_str!("setup.sh");
        let machine = self.get(id).await?;
        match self.executor.execute(&machine, SETUP_SCRIPT, timeout).await {
            Ok(result) => Ok(CommandOutcome::from(result)),
            Err(e) => Err(e),
        }
    }

    /// Run an arbitrary command on `machine_ids`, or on every registered
    /// machine (regardless of status) when `machine_ids` is `None`. Per
    /// design note (b): a broadcast with no target list is allowed to reach
    /// unreachable/errored machines, since the operator may be using it to
    /// recover one — the per-machine outcome surfaces which ones failed.
    pub async fn command(
        &self,
        machine_ids: Option<Vec<String>>,
        command: &str,
        timeout: Duration,
    ) -> Result<HashMap<String, CommandOutcome>> {
        let machines = match machine_ids {
            Some(ids) => {
                let mut machines = Vec::with_capacity(ids.len());
                for id in ids {
                    machines.push(self.get(&id).await?);
                }
                machines
            }
            None => self.list().await?,
        };

        let mut results = HashMap::with_capacity(machines.len());
        for machine in machines {
            let outcome = match self.executor.execute(&machine, command, timeout).await {
                Ok(result) => CommandOutcome::from(result),
                Err(e) => CommandOutcome::connect_error(e.to_string()),
            };
            results.insert(machine.id.clone(), outcome);
        }
        Ok(results)
    }

    pub async fn set_maintenance(&self, id: &str, maintenance: bool) -> Result<()> {
        let status = if maintenance {
            MachineStatus::Maintenance
        } else {
            MachineStatus::Active
        };
        self.db
            .with_conn({
                let id = id.to_string();
                move |conn| MachineStore::update_status(conn, &id, status, None, None)
            })
            .await?;
        Ok(())
    }
}

/// Parse `probe.sh`'s `KEY=VALUE` output into `SystemMetrics`. Missing or
/// malformed lines fall back to zero/false rather than failing the whole
/// probe — a partial reading is more useful than none.
fn parse_probe_output(output: &str) -> Result<SystemMetrics> {
    let mut fields = std::collections::HashMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key.trim(), value.trim());
        }
    }

    let f64_of = |key: &str| fields.get(key).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
    let u64_of = |key: &str| fields.get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    let u32_of = |key: &str| fields.get(key).and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
    let bool_of = |key: &str| fields.get(key).map(|v| *v == "1").unwrap_or(false);

    if fields.is_empty() {
        return Err(DaemonError::MonitoringError("probe output was empty or unparsable".into()));
    }

    Ok(SystemMetrics {
        cpu_usage: f64_of("CPU_USAGE"),
        cpu_cores: u32_of("CPU_CORES"),
        memory_total: u64_of("MEM_TOTAL"),
        memory_used: u64_of("MEM_USED"),
        memory_free: u64_of("MEM_FREE"),
        disk_total: u64_of("DISK_TOTAL"),
        disk_used: u64_of("DISK_USED"),
        disk_free: u64_of("DISK_FREE"),
        network_rx_bytes: u64_of("NET_RX"),
        network_tx_bytes: u64_of("NET_TX"),
        docker_running: bool_of("DOCKER_RUNNING"),
        containers_total: u32_of("CONTAINERS_TOTAL"),
        containers_running: u32_of("CONTAINERS_RUNNING"),
        load1: f64_of("LOAD1"),
        load5: f64_of("LOAD5"),
        load15: f64_of("LOAD15"),
        uptime_seconds: u64_of("UPTIME"),
        last_update: Some(Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_probe_output() {
        let output = "CPU_USAGE=12.50\nCPU_CORES=4\nMEM_TOTAL=1000\nMEM_USED=400\n\
                       MEM_FREE=600\nDISK_TOTAL=2000\nDISK_USED=500\nDISK_FREE=1500\n\
                       NET_RX=10\nNET_TX=20\nDOCKER_RUNNING=1\nCONTAINERS_TOTAL=3\n\
                       CONTAINERS_RUNNING=2\nLOAD1=0.1\nLOAD5=0.2\nLOAD15=0.3\nUPTIME=86400\n";
        let metrics = parse_probe_output(output).unwrap();
        assert_eq!(metrics.cpu_cores, 4);
        assert_eq!(metrics.memory_total, 1000);
        assert!(metrics.docker_running);
        assert_eq!(metrics.containers_running, 2);
    }

    #[test]
    fn malformed_output_falls_back_to_zero_rather_than_panicking() {
        let metrics = parse_probe_output("CPU_USAGE=not-a-number\ngarbage line with no equals\n").unwrap();
        assert_eq!(metrics.cpu_usage, 0.0);
        assert!(!metrics.docker_running);
    }

    #[test]
    fn empty_output_is_an_error() {
        assert!(parse_probe_output("").is_err());
    }

    #[test]
    fn accepts_valid_ipv4() {
        assert!(validate_ip("10.0.0.1"));
        assert!(validate_ip("255.255.255.255"));
    }

    #[test]
    fn rejects_out_of_range_octets() {
        assert!(!validate_ip("256.0.0.1"));
        assert!(!validate_ip("10.0.0"));
        assert!(!validate_ip("not-an-ip"));
    }

    #[test]
    fn name_pattern_rejects_empty_and_special_chars() {
        assert!(!name_pattern().is_match(""));
        assert!(!name_pattern().is_match("has spaces"));
        assert!(name_pattern().is_match("web-01"));
    }
}

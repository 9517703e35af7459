//! Monitor Loop (C4): spawns one scheduled job per active machine that
//! probes it over SSH and records the resulting metrics.
//!
//! Grounded on the teacher's `cron::Scheduler`/`JobHandle` pair, generalized
//! from a single global job to one job per machine so each host's probe
//! cadence and failure handling is independent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::cron::{JobHandle, Scheduler};
use crate::error::Result;
use crate::fleet::Fleet;
use crate::timeseries::TimeSeries;
use crate::types::{Machine, MachineStatus, SystemMetrics};

pub struct MonitorConfig {
    pub default_interval: Duration,
    pub min_interval: Duration,
    pub probe_timeout: Duration,
}

pub struct Monitor {
    fleet: Arc<Fleet>,
    timeseries: Arc<TimeSeries>,
    scheduler: Arc<Scheduler>,
    jobs: DashMap<String, JobHandle>,
    intervals: DashMap<String, Duration>,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(fleet: Arc<Fleet>, timeseries: Arc<TimeSeries>, config: MonitorConfig) -> Self {
        Self {
            fleet,
            timeseries,
            scheduler: Arc::new(Scheduler::new()),
            jobs: DashMap::new(),
            intervals: DashMap::new(),
            config,
        }
    }

    /// Start (or restart) the probe job for a single machine. Machines in
    /// `Maintenance` are skipped entirely — probing them would just flap
    /// their status back to `Active`.
    pub async fn watch(&self, machine_id: &str) {
        if let Some((_, handle)) = self.jobs.remove(machine_id) {
            handle.cancel();
        }

        let interval = self
            .intervals
            .get(machine_id)
            .map(|i| *i)
            .unwrap_or(self.config.default_interval)
            .max(self.config.min_interval);
        let fleet = self.fleet.clone();
        let timeseries = self.timeseries.clone();
        let probe_timeout = self.config.probe_timeout;
        let machine_id = machine_id.to_string();
        let job_name = format!("monitor:{machine_id}");

        let handle = self
            .scheduler
            .schedule(job_name, interval, {
                let machine_id = machine_id.clone();
                move || {
                    let fleet = fleet.clone();
                    let timeseries = timeseries.clone();
                    let machine_id = machine_id.clone();
                    async move {
                        tick(&fleet, &timeseries, &machine_id, probe_timeout).await;
                    }
                }
            })
            .await;

        self.jobs.insert(machine_id, handle);
    }

    pub fn unwatch(&self, machine_id: &str) {
        if let Some((_, handle)) = self.jobs.remove(machine_id) {
            handle.cancel();
        }
    }

    /// Override a machine's probe cadence (still clamped to `min_interval`)
    /// and restart its job under the new interval.
    pub async fn set_interval(&self, machine_id: &str, interval: Duration) {
        self.intervals.insert(machine_id.to_string(), interval);
        self.watch(machine_id).await;
    }

    /// Start watching every currently-registered, non-maintenance machine.
    /// Called once at startup.
    pub async fn start_all(&self) -> Result<()> {
        for machine in self.fleet.list().await? {
            if machine.status != MachineStatus::Maintenance {
                self.watch(&machine.id).await;
            }
        }
        Ok(())
    }
}

async fn tick(fleet: &Fleet, timeseries: &TimeSeries, machine_id: &str, timeout: Duration) {
    let machine = match fleet.get(machine_id).await {
        Ok(m) => m,
        Err(e) => {
            warn!(machine_id, error = %e, "monitor tick: machine vanished, skipping");
            return;
        }
    };

    if machine.status == MachineStatus::Maintenance {
        return;
    }

    match fleet.probe(&machine, timeout).await {
        Ok(metrics) => {
            record_metrics(timeseries, machine_id, &metrics).await;
        }
        Err(e) => {
            warn!(machine_id, error = %e, "monitor probe failed");
        }
    }
}

async fn record_metrics(timeseries: &TimeSeries, machine_id: &str, metrics: &SystemMetrics) {
    let ts = chrono::Utc::now().timestamp();
    let mut labels = BTreeMap::new();
    labels.insert("machine_id".to_string(), machine_id.to_string());

    let points: [(&str, f64); 9] = [
        ("machine.cpu.usage", metrics.cpu_usage),
        ("machine.memory.used", metrics.memory_used as f64),
        ("machine.memory.total", metrics.memory_total as f64),
        ("machine.disk.used", metrics.disk_used as f64),
        ("machine.disk.total", metrics.disk_total as f64),
        ("machine.network.rx", metrics.network_rx_bytes as f64),
        ("machine.network.tx", metrics.network_tx_bytes as f64),
        ("machine.containers.total", metrics.containers_total as f64),
        ("machine.containers.running", metrics.containers_running as f64),
    ];

    for (name, value) in points {
        if let Err(e) = timeseries.ingest(name, &labels, value, ts).await {
            warn!(machine_id, metric = name, error = %e, "failed to ingest monitor metric");
        }
    }

    info!(machine_id, cpu = metrics.cpu_usage, "monitor tick recorded");
}

/// Why a probe didn't confirm the machine healthy. `ConnectFail` means the
/// SSH layer itself failed (dial, auth, channel, timeout) — the machine
/// might just be unreachable. `ParseFail` means the connection succeeded
/// but the probe script exited nonzero or produced output `Fleet::probe`
/// couldn't parse — the machine answered, but something about it is wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    ConnectFail,
    ParseFail,
}

/// Pure state-machine transition, one arrow per (current, probe outcome)
/// pair. Mirrors what `Fleet::probe` actually does, kept separate so each
/// transition is independently testable without a live SSH session.
///
/// `ConnectFail` from `Active` drops to `Inactive`, not `Error` — the host
/// may just be offline. `ParseFail` from `Active` drops to `Error` since
/// the connection worked but something on the machine is broken.
/// `Initializing` has never seen a successful probe, so either failure
/// kind lands on `Error` rather than `Inactive`. `Inactive` and `Error`
/// are sticky on further failure of either kind; only a successful probe
/// moves them, and always to `Active`.
pub fn next_state(current: MachineStatus, outcome: ProbeOutcome) -> MachineStatus {
    use ProbeOutcome::*;
    match (current, outcome) {
        (MachineStatus::Maintenance, _) => MachineStatus::Maintenance,
        (_, Success) => MachineStatus::Active,
        (MachineStatus::Active, ConnectFail) => MachineStatus::Inactive,
        (MachineStatus::Active, ParseFail) => MachineStatus::Error,
        (MachineStatus::Initializing, ConnectFail | ParseFail) => MachineStatus::Error,
        (MachineStatus::Inactive, ConnectFail | ParseFail) => MachineStatus::Inactive,
        (MachineStatus::Error, ConnectFail | ParseFail) => MachineStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProbeOutcome::*;

    #[test]
    fn initializing_succeeds_into_active() {
        assert_eq!(next_state(MachineStatus::Initializing, Success), MachineStatus::Active);
    }

    #[test]
    fn initializing_connect_fail_is_error() {
        assert_eq!(next_state(MachineStatus::Initializing, ConnectFail), MachineStatus::Error);
    }

    #[test]
    fn initializing_parse_fail_is_error() {
        assert_eq!(next_state(MachineStatus::Initializing, ParseFail), MachineStatus::Error);
    }

    #[test]
    fn active_stays_active_on_success() {
        assert_eq!(next_state(MachineStatus::Active, Success), MachineStatus::Active);
    }

    #[test]
    fn active_connect_fail_drops_to_inactive() {
        assert_eq!(next_state(MachineStatus::Active, ConnectFail), MachineStatus::Inactive);
    }

    #[test]
    fn active_parse_fail_drops_to_error() {
        assert_eq!(next_state(MachineStatus::Active, ParseFail), MachineStatus::Error);
    }

    #[test]
    fn inactive_recovers_to_active_on_success() {
        assert_eq!(next_state(MachineStatus::Inactive, Success), MachineStatus::Active);
    }

    #[test]
    fn inactive_is_sticky_on_further_failure() {
        assert_eq!(next_state(MachineStatus::Inactive, ConnectFail), MachineStatus::Inactive);
        assert_eq!(next_state(MachineStatus::Inactive, ParseFail), MachineStatus::Inactive);
    }

    #[test]
    fn error_recovers_to_active_on_success() {
        assert_eq!(next_state(MachineStatus::Error, Success), MachineStatus::Active);
    }

    #[test]
    fn error_is_sticky_on_further_failure() {
        assert_eq!(next_state(MachineStatus::Error, ConnectFail), MachineStatus::Error);
        assert_eq!(next_state(MachineStatus::Error, ParseFail), MachineStatus::Error);
    }

    #[test]
    fn maintenance_is_sticky_regardless_of_probe_outcome() {
        assert_eq!(next_state(MachineStatus::Maintenance, Success), MachineStatus::Maintenance);
        assert_eq!(next_state(MachineStatus::Maintenance, ConnectFail), MachineStatus::Maintenance);
        assert_eq!(next_state(MachineStatus::Maintenance, ParseFail), MachineStatus::Maintenance);
    }
}

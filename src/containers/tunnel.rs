//! Reverse tunnel to a machine's Docker socket: a `socat` relay on the
//! remote host bridges the unix socket to a loopback TCP port, and a local
//! forwarding loop bridges a local loopback TCP port to that remote port
//! through the cached SSH session's `direct-tcpip` channels. `bollard` then
//! talks plain HTTP-over-TCP to the local port.
//!
//! Grounded on `executor::open_direct_tcpip` (the SSH forwarding primitive)
//! and `original_source/backend/app/plugins/docker/service.py::get_docker_client`'s
//! use of a socat relay to avoid shipping a Docker TLS listener on managed hosts.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DaemonError, Result};
use crate::executor::Executor;
use crate::types::Machine;

/// Fixed loopback port `socat` listens on on the remote host. One tunnel per
/// machine, so a single port is sufficient.
const REMOTE_SOCAT_PORT: u16 = 127_117;

pub struct DockerTunnel {
    pub local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl DockerTunnel {
    pub async fn open(executor: Arc<Executor>, machine: Machine) -> Result<Self> {
        ensure_remote_relay(&executor, &machine).await?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| DaemonError::Internal(format!("failed to bind local tunnel port: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DaemonError::Internal(e.to_string()))?;

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let machine_id = machine.id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((local_stream, _)) => {
                                let executor = executor.clone();
                                let machine = machine.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = relay_one(&executor, &machine, local_stream).await {
                                        warn!(machine_id = %machine.id, error = %e, "docker tunnel relay failed");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(machine_id = %machine_id, error = %e, "tunnel accept failed");
                                break;
                            }
                        }
                    }
                }
            }
            debug!(machine_id = %machine_id, "docker tunnel forwarding loop stopped");
        });

        Ok(Self { local_addr, cancel })
    }
}

impl Drop for DockerTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn relay_one(
    executor: &Executor,
    machine: &Machine,
    mut local_stream: tokio::net::TcpStream,
) -> Result<()> {
    let channel = executor
        .open_direct_tcpip(machine, "127.0.0.1", REMOTE_SOCAT_PORT)
        .await?;
    let mut remote_stream = channel.into_stream();

    tokio::io::copy_bidirectional(&mut local_stream, &mut remote_stream)
        .await
        .map_err(|e| DaemonError::ChannelError(format!("tunnel relay closed: {e}")))?;
    Ok(())
}

/// Idempotently ensure a `socat` relay is listening on the remote host.
/// Safe to call repeatedly: it first checks whether the port is already
/// bound before spawning a new background relay.
async fn ensure_remote_relay(executor: &Executor, machine: &Machine) -> Result<()> {
    let check_and_start = format!(
        "if ! (command -v socat >/dev/null 2>&1); then echo 'socat not installed' >&2; exit 1; fi; \
         if ! (ss -ltn 2>/dev/null | grep -q ':{port} '); then \
           nohup socat TCP-LISTEN:{port},bind=127.0.0.1,reuseaddr,fork UNIX-CONNECT:/var/run/docker.sock \
             >/tmp/fleetctl-socat-{port}.log 2>&1 & \
           sleep 0.2; \
         fi",
        port = REMOTE_SOCAT_PORT,
    );

    let result = executor
        .execute(machine, &check_and_start, std::time::Duration::from_secs(15))
        .await?;

    if result.exit_code != 0 {
        return Err(DaemonError::MonitoringError(format!(
            "failed to establish docker relay on {}: {}",
            machine.name, result.stderr
        )));
    }
    Ok(())
}

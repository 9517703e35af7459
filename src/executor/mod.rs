//! Remote Executor (C1): caches SSH sessions to registered machines and runs
//! shell commands over them with a timeout.
//!
//! Grounded on the teacher's `DashMap<String, Arc<Server>>` session-caching
//! shape and the key-handling flow of
//! `original_source/backend/app/ssh_manager.py::get_ssh_client` (decrypt into
//! a scoped buffer, connect, zero the buffer).

mod host_key;
mod session;

pub use host_key::{AcceptNewPolicy, HostKeyPolicy, StrictPolicy};
pub use session::CachedSession;

use dashmap::DashMap;
use russh::keys::decode_secret_key;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};
use crate::types::Machine;
use crate::vault::KeyVault;

/// Result of a single `execute` call. A nonzero `exit_code` is not an error.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

pub struct Executor {
    vault: Arc<KeyVault>,
    sessions: DashMap<String, Arc<CachedSession>>,
    /// One connect-lock per machine, held for the duration of a cache-miss
    /// `connect()` so two concurrent callers for the same machine don't both
    /// dial SSH — the second one waits, then finds the first one's session
    /// already cached. Guards only the connect race, never a live session.
    connect_locks: DashMap<String, Arc<Mutex<()>>>,
    host_key_policy: Arc<dyn HostKeyPolicy>,
    idle_ttl: Duration,
}

impl Executor {
    pub fn new(vault: Arc<KeyVault>, idle_ttl: Duration) -> Self {
        Self {
            vault,
            sessions: DashMap::new(),
            connect_locks: DashMap::new(),
            host_key_policy: Arc::new(AcceptNewPolicy::default()),
            idle_ttl,
        }
    }

    pub fn with_host_key_policy(mut self, policy: Arc<dyn HostKeyPolicy>) -> Self {
        self.host_key_policy = policy;
        self
    }

    /// Run `command` on `machine`, reusing (or establishing) its cached session.
    pub async fn execute(
        &self,
        machine: &Machine,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecResult> {
        let session = self.session_for(machine).await?;
        match session.run(command, timeout).await {
            Ok(result) => Ok(result),
            Err(e @ DaemonError::ConnectError(_)) => {
                // The cached handle is dead; evict it so the next call reconnects.
                self.evict(&machine.id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Upload bytes to a remote path via the cached session's SFTP subsystem.
    pub async fn put(&self, machine: &Machine, local: &[u8], remote_path: &str) -> Result<()> {
        let session = self.session_for(machine).await?;
        session.put(local, remote_path).await
    }

    /// Open a direct-tcpip channel to `host:port` as seen from the remote
    /// machine — the primitive `containers::engine` uses to reach the
    /// tunneled docker daemon socket without a second SSH connection.
    pub async fn open_direct_tcpip(
        &self,
        machine: &Machine,
        host: &str,
        port: u16,
    ) -> Result<russh::Channel<russh::client::Msg>> {
        let session = self.session_for(machine).await?;
        session.open_direct_tcpip(host, port).await
    }

    /// Close and drop a machine's cached session. Called on explicit delete,
    /// auth failure, or transport error — the single path the cache's
    /// "at most one live session per machine" invariant flows through.
    pub fn evict(&self, machine_id: &str) {
        if let Some((_, session)) = self.sessions.remove(machine_id) {
            info!(machine_id, "evicting cached SSH session");
            session.mark_closing();
            tokio::spawn(async move {
                session.close().await;
            });
        }
    }

    async fn session_for(&self, machine: &Machine) -> Result<Arc<CachedSession>> {
        if let Some(session) = self.fresh_cached_session(machine) {
            return Ok(session);
        }

        let lock = self
            .connect_locks
            .entry(machine.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check under the lock: whoever held it first may have already
        // connected and cached a session while we were waiting.
        if let Some(session) = self.fresh_cached_session(machine) {
            return Ok(session);
        }

        let session = self.connect(machine).await?;
        self.sessions.insert(machine.id.clone(), session.clone());
        Ok(session)
    }

    fn fresh_cached_session(&self, machine: &Machine) -> Option<Arc<CachedSession>> {
        let existing = self.sessions.get(&machine.id)?;
        if existing.is_idle_expired(self.idle_ttl) {
            drop(existing);
            self.evict(&machine.id);
            return None;
        }
        existing.touch();
        Some(existing.clone())
    }

    async fn connect(&self, machine: &Machine) -> Result<Arc<CachedSession>> {
        let decrypted = self.vault.decrypt(&machine.encrypted_key)?;
        let key_pair = decode_secret_key(
            std::str::from_utf8(decrypted.as_bytes())
                .map_err(|_| DaemonError::ConnectError("private key is not valid UTF-8".into()))?,
            machine.passphrase.as_deref(),
        )
        .map_err(|e| DaemonError::ConnectError(format!("invalid private key: {e}")))?;
        // `decrypted` is dropped (and zeroed) here, before the network round-trip.
        drop(decrypted);

        let addr: SocketAddr = format!("{}:{}", machine.ip, machine.ssh_port)
            .parse()
            .map_err(|e| DaemonError::ConnectError(format!("invalid address: {e}")))?;

        debug!(machine_id = %machine.id, %addr, "opening SSH session");

        let session = CachedSession::connect(
            machine.id.clone(),
            addr,
            &machine.ssh_user,
            key_pair,
            self.host_key_policy.clone(),
        )
        .await
        .map_err(|e| {
            warn!(machine_id = %machine.id, error = %e, "SSH connect failed");
            DaemonError::ConnectError(e.to_string())
        })?;

        info!(machine_id = %machine.id, "SSH session established");
        Ok(Arc::new(session))
    }
}

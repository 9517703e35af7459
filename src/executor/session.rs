//! A single cached SSH session. Channel creation is serialized per session
//! (russh does not support opening channels concurrently on one handle) while
//! calls across different machines proceed fully in parallel, since each
//! machine owns its own `CachedSession`.

use russh::client::{self, Msg};
use russh::keys::key::{KeyPair, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::host_key::HostKeyPolicy;
use super::ExecResult;
use crate::error::{DaemonError, Result};

struct ClientHandler {
    machine_id: String,
    policy: Arc<dyn HostKeyPolicy>,
}

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(self.policy.check(&self.machine_id, server_public_key).await)
    }
}

pub struct CachedSession {
    machine_id: String,
    handle: Mutex<client::Handle<ClientHandler>>,
    last_used_epoch: AtomicI64,
    closing: AtomicBool,
}

impl CachedSession {
    pub async fn connect(
        machine_id: String,
        addr: SocketAddr,
        user: &str,
        key_pair: KeyPair,
        policy: Arc<dyn HostKeyPolicy>,
    ) -> std::result::Result<Self, russh::Error> {
        let config = Arc::new(client::Config::default());
        let handler = ClientHandler {
            machine_id: machine_id.clone(),
            policy,
        };

        let mut handle = client::connect(config, addr, handler).await?;

        let authenticated = handle
            .authenticate_publickey(user, Arc::new(key_pair))
            .await?;
        if !authenticated {
            return Err(russh::Error::NotAuthenticated);
        }

        Ok(Self {
            machine_id,
            handle: Mutex::new(handle),
            last_used_epoch: AtomicI64::new(now_epoch()),
            closing: AtomicBool::new(false),
        })
    }

    pub fn touch(&self) {
        self.last_used_epoch.store(now_epoch(), Ordering::Relaxed);
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::Relaxed);
    }

    pub fn is_idle_expired(&self, ttl: Duration) -> bool {
        let last = self.last_used_epoch.load(Ordering::Relaxed);
        now_epoch() - last > ttl.as_secs() as i64
    }

    /// Run a command over a fresh channel on this session, enforcing `timeout`.
    pub async fn run(&self, command: &str, timeout: Duration) -> Result<ExecResult> {
        let fut = self.run_inner(command);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::ExecTimeout(timeout)),
        }
    }

    async fn run_inner(&self, command: &str) -> Result<ExecResult> {
        let start = tokio::time::Instant::now();

        let mut channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_session()
                .await
                .map_err(|e| DaemonError::ChannelError(e.to_string()))?
        };

        channel
            .exec(true, command)
            .await
            .map_err(|e| DaemonError::ChannelError(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0i32;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => stderr.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = exit_status as i32,
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => break,
                Some(_) => continue,
                None => break,
            }
        }

        debug!(machine_id = %self.machine_id, %command, exit_code, "command completed");

        Ok(ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: start.elapsed(),
        })
    }

    /// Upload bytes over the SFTP subsystem of a fresh channel.
    pub async fn put(&self, local: &[u8], remote_path: &str) -> Result<()> {
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_session()
                .await
                .map_err(|e| DaemonError::ChannelError(e.to_string()))?
        };

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| DaemonError::ChannelError(e.to_string()))?;

        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| DaemonError::ChannelError(format!("sftp handshake failed: {e}")))?;

        let mut file = sftp
            .create(remote_path)
            .await
            .map_err(|e| DaemonError::ChannelError(format!("sftp create failed: {e}")))?;

        file.write_all(local)
            .await
            .map_err(|e| DaemonError::ChannelError(format!("sftp write failed: {e}")))?;

        Ok(())
    }

    /// Open a `direct-tcpip` forwarding channel to `host:port` as seen from
    /// the remote machine.
    pub async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Channel<Msg>> {
        let handle = self.handle.lock().await;
        handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| DaemonError::ChannelError(e.to_string()))
    }

    pub async fn close(&self) {
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

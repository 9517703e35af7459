//! Sqlite-backed persistence. Teacher idiom (`database/state.rs`,
//! `database/activity.rs`): a `Database` struct holds the single
//! `Mutex<Connection>`; each entity gets a pure, synchronous store whose
//! methods take `&Connection` explicitly, so the lock is only ever held for
//! the duration of one statement and never across an `.await`.

pub mod alerts;
pub mod containers;
pub mod machines;
pub mod metrics_kv;
pub mod notifications;
pub mod timeseries;

pub use alerts::{AlertRuleStore, AlertStore};
pub use containers::{ContainerStore, DeploymentStore};
pub use machines::MachineStore;
pub use metrics_kv::MetricKvStore;
pub use notifications::NotificationStore;
pub use timeseries::{Resolution, TimeSeriesStore};

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::init_tables(&conn)?;

        info!("database opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS machines (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                ip TEXT NOT NULL,
                ssh_port INTEGER NOT NULL,
                ssh_user TEXT NOT NULL,
                encrypted_key BLOB NOT NULL,
                passphrase TEXT,
                status TEXT NOT NULL,
                last_seen INTEGER,
                tags TEXT NOT NULL DEFAULT '{}',
                owner TEXT,
                system_info TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                machine_id TEXT NOT NULL,
                deployment_id TEXT,
                service_name TEXT,
                config TEXT NOT NULL,
                state TEXT NOT NULL,
                native_id TEXT,
                stats TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                exit_code INTEGER,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_containers_machine ON containers(machine_id);
            CREATE INDEX IF NOT EXISTS idx_containers_deployment ON containers(deployment_id);
            -- Container names are unique per machine (spec.md §3 invariant); enforced via
            -- an expression index since the name lives inside the JSON config blob.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_containers_name_unique
                ON containers(machine_id, json_extract(config, '$.name'));

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                machine_id TEXT NOT NULL,
                config TEXT NOT NULL,
                network_name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metrics_kv (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                metric_type TEXT NOT NULL,
                value REAL NOT NULL,
                unit TEXT,
                labels TEXT NOT NULL DEFAULT '{}',
                timestamp INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_kv_expiry ON metrics_kv(expires_at);

            CREATE TABLE IF NOT EXISTS ts_1m (
                metric_name TEXT NOT NULL,
                labels TEXT NOT NULL DEFAULT '{}',
                ts INTEGER NOT NULL,
                value REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ts_1h (
                metric_name TEXT NOT NULL,
                labels TEXT NOT NULL DEFAULT '{}',
                ts INTEGER NOT NULL,
                value REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ts_1d (
                metric_name TEXT NOT NULL,
                labels TEXT NOT NULL DEFAULT '{}',
                ts INTEGER NOT NULL,
                value REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ts_1m_lookup ON ts_1m(metric_name, labels, ts);
            CREATE INDEX IF NOT EXISTS idx_ts_1h_lookup ON ts_1h(metric_name, labels, ts);
            CREATE INDEX IF NOT EXISTS idx_ts_1d_lookup ON ts_1d(metric_name, labels, ts);

            CREATE TABLE IF NOT EXISTS alert_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                severity TEXT NOT NULL,
                condition TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                notifications TEXT NOT NULL DEFAULT '[]',
                labels TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                severity TEXT NOT NULL,
                state TEXT NOT NULL,
                last_value REAL NOT NULL,
                threshold REAL NOT NULL,
                labels TEXT NOT NULL DEFAULT '{}',
                first_detected_at INTEGER NOT NULL,
                last_detected_at INTEGER NOT NULL,
                resolved_at INTEGER,
                acknowledged_at INTEGER,
                acknowledged_by TEXT,
                resolution_note TEXT,
                notification_sent INTEGER NOT NULL DEFAULT 0
            );
            -- Enforces "at most one ACTIVE alert per (rule, label-set)" at the storage layer.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_active_unique
                ON alerts(rule_id, labels) WHERE state = 'active';
            CREATE INDEX IF NOT EXISTS idx_alerts_rule ON alerts(rule_id);

            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                alert_id TEXT NOT NULL,
                sink_type TEXT NOT NULL,
                target TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                sent_at INTEGER,
                error TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_pending
                ON notifications(status, next_attempt_at);
            "#,
        )
    }

    pub async fn with_conn<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&Connection) -> DatabaseResult<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_in_memory_and_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table'",
                    [],
                    |row| row.get(0),
                )
                .map_err(DatabaseError::from)
            })
            .await
            .unwrap();
        assert!(count >= 8);
    }
}

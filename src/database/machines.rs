use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{DatabaseError, DatabaseResult};
use crate::types::{Machine, MachineStatus, SystemMetrics};

pub struct MachineStore;

impl MachineStore {
    pub fn insert(conn: &Connection, machine: &Machine) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT INTO machines
                (id, name, ip, ssh_port, ssh_user, encrypted_key, passphrase, status,
                 last_seen, tags, owner, system_info, created_at, updated_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                machine.id,
                machine.name,
                machine.ip,
                machine.ssh_port,
                machine.ssh_user,
                machine.encrypted_key,
                machine.passphrase,
                machine.status.as_str(),
                machine.last_seen.map(|t| t.timestamp()),
                serde_json::to_string(&machine.tags).map_err(ser_err)?,
                machine.owner,
                machine
                    .system_info
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(ser_err)?,
                machine.created_at.timestamp(),
                machine.updated_at.timestamp(),
                machine.version as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> DatabaseResult<Option<Machine>> {
        conn.query_row(
            "SELECT id, name, ip, ssh_port, ssh_user, encrypted_key, passphrase, status, \
             last_seen, tags, owner, system_info, created_at, updated_at, version \
             FROM machines WHERE id = ?1",
            [id],
            row_to_machine,
        )
        .optional()
        .map_err(DatabaseError::from)
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> DatabaseResult<Option<Machine>> {
        conn.query_row(
            "SELECT id, name, ip, ssh_port, ssh_user, encrypted_key, passphrase, status, \
             last_seen, tags, owner, system_info, created_at, updated_at, version \
             FROM machines WHERE name = ?1",
            [name],
            row_to_machine,
        )
        .optional()
        .map_err(DatabaseError::from)
    }

    pub fn list(conn: &Connection) -> DatabaseResult<Vec<Machine>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, ip, ssh_port, ssh_user, encrypted_key, passphrase, status, \
             last_seen, tags, owner, system_info, created_at, updated_at, version \
             FROM machines ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_machine)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update(conn: &Connection, machine: &Machine) -> DatabaseResult<()> {
        let updated = conn.execute(
            r#"
            UPDATE machines SET
                name = ?2, ip = ?3, ssh_port = ?4, ssh_user = ?5, encrypted_key = ?6,
                passphrase = ?7, status = ?8, last_seen = ?9, tags = ?10, owner = ?11,
                system_info = ?12, updated_at = ?13, version = version + 1
            WHERE id = ?1
            "#,
            params![
                machine.id,
                machine.name,
                machine.ip,
                machine.ssh_port,
                machine.ssh_user,
                machine.encrypted_key,
                machine.passphrase,
                machine.status.as_str(),
                machine.last_seen.map(|t| t.timestamp()),
                serde_json::to_string(&machine.tags).map_err(ser_err)?,
                machine.owner,
                machine
                    .system_info
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(ser_err)?,
                Utc::now().timestamp(),
            ],
        )?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(machine.id.clone()));
        }
        Ok(())
    }

    /// Advance just the state-machine fields, bumping `version`. Used by the
    /// monitor loop so a probe tick doesn't need to read-modify-write the
    /// whole row.
    pub fn update_status(
        conn: &Connection,
        id: &str,
        status: MachineStatus,
        last_seen: Option<chrono::DateTime<Utc>>,
        system_info: Option<&SystemMetrics>,
    ) -> DatabaseResult<()> {
        conn.execute(
            r#"
            UPDATE machines SET
                status = ?2, last_seen = ?3, system_info = ?4,
                updated_at = ?5, version = version + 1
            WHERE id = ?1
            "#,
            params![
                id,
                status.as_str(),
                last_seen.map(|t| t.timestamp()),
                system_info.map(serde_json::to_string).transpose().map_err(ser_err)?,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: &str) -> DatabaseResult<()> {
        conn.execute("DELETE FROM machines WHERE id = ?1", [id])?;
        Ok(())
    }
}

fn ser_err(e: serde_json::Error) -> DatabaseError {
    DatabaseError::Serialization(e.to_string())
}

fn row_to_machine(row: &rusqlite::Row) -> rusqlite::Result<Machine> {
    let status_str: String = row.get(7)?;
    let tags_str: String = row.get(9)?;
    let system_info_str: Option<String> = row.get(11)?;
    let last_seen: Option<i64> = row.get(8)?;
    let created_at: i64 = row.get(12)?;
    let updated_at: i64 = row.get(13)?;

    Ok(Machine {
        id: row.get(0)?,
        name: row.get(1)?,
        ip: row.get(2)?,
        ssh_port: row.get(3)?,
        ssh_user: row.get(4)?,
        encrypted_key: row.get(5)?,
        passphrase: row.get(6)?,
        status: status_str.parse().unwrap_or(MachineStatus::Error),
        last_seen: last_seen.and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        owner: row.get(10)?,
        system_info: system_info_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
        version: row.get::<_, i64>(14)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use std::collections::HashMap;

    fn sample_machine(name: &str) -> Machine {
        let now = Utc::now();
        Machine {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            ip: "10.0.0.1".to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            encrypted_key: vec![1, 2, 3],
            passphrase: None,
            status: MachineStatus::Initializing,
            last_seen: None,
            tags: HashMap::new(),
            owner: None,
            system_info: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let machine = sample_machine("alpha");

        db.with_conn(|conn| MachineStore::insert(conn, &machine))
            .await
            .unwrap();

        let loaded = db
            .with_conn(|conn| MachineStore::get(conn, &machine.id))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.status, MachineStatus::Initializing);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let a = sample_machine("dup");
        let mut b = sample_machine("dup");
        b.id = uuid::Uuid::new_v4().to_string();

        db.with_conn(|conn| MachineStore::insert(conn, &a)).await.unwrap();
        let result = db.with_conn(|conn| MachineStore::insert(conn, &b)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_status_bumps_version() {
        let db = Database::open_in_memory().unwrap();
        let machine = sample_machine("beta");
        db.with_conn(|conn| MachineStore::insert(conn, &machine)).await.unwrap();

        db.with_conn(|conn| {
            MachineStore::update_status(conn, &machine.id, MachineStatus::Active, Some(Utc::now()), None)
        })
        .await
        .unwrap();

        let loaded = db
            .with_conn(|conn| MachineStore::get(conn, &machine.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, MachineStatus::Active);
        assert_eq!(loaded.version, 1);
    }
}

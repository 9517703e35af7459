use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{DatabaseError, DatabaseResult};
use crate::types::{Container, ContainerConfig, ContainerState, ContainerStats, ComposeDeployment};

pub struct ContainerStore;

impl ContainerStore {
    pub fn insert(conn: &Connection, container: &Container) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT INTO containers
                (id, machine_id, deployment_id, service_name, config, state, native_id,
                 stats, created_at, started_at, finished_at, exit_code, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                container.id,
                container.machine_id,
                container.deployment_id,
                container.service_name,
                serde_json::to_string(&container.config).map_err(ser_err)?,
                container.state.as_str(),
                container.native_id,
                container
                    .stats
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(ser_err)?,
                container.created_at.timestamp(),
                container.started_at.map(|t| t.timestamp()),
                container.finished_at.map(|t| t.timestamp()),
                container.exit_code,
                container.error,
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> DatabaseResult<Option<Container>> {
        conn.query_row(
            "SELECT id, machine_id, deployment_id, service_name, config, state, native_id, \
             stats, created_at, started_at, finished_at, exit_code, error \
             FROM containers WHERE id = ?1",
            [id],
            row_to_container,
        )
        .optional()
        .map_err(DatabaseError::from)
    }

    pub fn list_by_machine(conn: &Connection, machine_id: &str) -> DatabaseResult<Vec<Container>> {
        let mut stmt = conn.prepare(
            "SELECT id, machine_id, deployment_id, service_name, config, state, native_id, \
             stats, created_at, started_at, finished_at, exit_code, error \
             FROM containers WHERE machine_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([machine_id], row_to_container)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_by_deployment(
        conn: &Connection,
        deployment_id: &str,
    ) -> DatabaseResult<Vec<Container>> {
        let mut stmt = conn.prepare(
            "SELECT id, machine_id, deployment_id, service_name, config, state, native_id, \
             stats, created_at, started_at, finished_at, exit_code, error \
             FROM containers WHERE deployment_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([deployment_id], row_to_container)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update(conn: &Connection, container: &Container) -> DatabaseResult<()> {
        let updated = conn.execute(
            r#"
            UPDATE containers SET
                state = ?2, native_id = ?3, stats = ?4, started_at = ?5,
                finished_at = ?6, exit_code = ?7, error = ?8
            WHERE id = ?1
            "#,
            params![
                container.id,
                container.state.as_str(),
                container.native_id,
                container
                    .stats
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(ser_err)?,
                container.started_at.map(|t| t.timestamp()),
                container.finished_at.map(|t| t.timestamp()),
                container.exit_code,
                container.error,
            ],
        )?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(container.id.clone()));
        }
        Ok(())
    }

    pub fn update_state(
        conn: &Connection,
        id: &str,
        state: ContainerState,
        native_id: Option<&str>,
    ) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE containers SET state = ?2, native_id = COALESCE(?3, native_id) WHERE id = ?1",
            params![id, state.as_str(), native_id],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: &str) -> DatabaseResult<()> {
        conn.execute("DELETE FROM containers WHERE id = ?1", [id])?;
        Ok(())
    }
}

fn row_to_container(row: &rusqlite::Row) -> rusqlite::Result<Container> {
    let config_str: String = row.get(4)?;
    let state_str: String = row.get(5)?;
    let stats_str: Option<String> = row.get(7)?;
    let created_at: i64 = row.get(8)?;
    let started_at: Option<i64> = row.get(9)?;
    let finished_at: Option<i64> = row.get(10)?;

    Ok(Container {
        id: row.get(0)?,
        machine_id: row.get(1)?,
        deployment_id: row.get(2)?,
        service_name: row.get(3)?,
        config: serde_json::from_str::<ContainerConfig>(&config_str)
            .unwrap_or_else(|_| ContainerConfig::default()),
        state: ContainerState::from(state_str.as_str()),
        native_id: row.get(6)?,
        stats: stats_str.and_then(|s| serde_json::from_str::<ContainerStats>(&s).ok()),
        created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        started_at: started_at.and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
        finished_at: finished_at.and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
        exit_code: row.get(11)?,
        error: row.get(12)?,
    })
}

fn ser_err(e: serde_json::Error) -> DatabaseError {
    DatabaseError::Serialization(e.to_string())
}

pub struct DeploymentStore;

impl DeploymentStore {
    pub fn insert(conn: &Connection, deployment: &ComposeDeployment) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT INTO deployments (id, machine_id, config, network_name, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                deployment.id,
                deployment.machine_id,
                serde_json::to_string(&deployment.config).map_err(ser_err)?,
                deployment.network_name,
                deployment.created_at.timestamp(),
                deployment.updated_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> DatabaseResult<Option<ComposeDeployment>> {
        conn.query_row(
            "SELECT id, machine_id, config, network_name, created_at, updated_at \
             FROM deployments WHERE id = ?1",
            [id],
            row_to_deployment,
        )
        .optional()
        .map_err(DatabaseError::from)
    }

    pub fn list_by_machine(
        conn: &Connection,
        machine_id: &str,
    ) -> DatabaseResult<Vec<ComposeDeployment>> {
        let mut stmt = conn.prepare(
            "SELECT id, machine_id, config, network_name, created_at, updated_at \
             FROM deployments WHERE machine_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([machine_id], row_to_deployment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update(conn: &Connection, deployment: &ComposeDeployment) -> DatabaseResult<()> {
        let updated = conn.execute(
            "UPDATE deployments SET config = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                deployment.id,
                serde_json::to_string(&deployment.config).map_err(ser_err)?,
                Utc::now().timestamp(),
            ],
        )?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(deployment.id.clone()));
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, id: &str) -> DatabaseResult<()> {
        conn.execute("DELETE FROM deployments WHERE id = ?1", [id])?;
        Ok(())
    }
}

fn row_to_deployment(row: &rusqlite::Row) -> rusqlite::Result<ComposeDeployment> {
    let config_str: String = row.get(2)?;
    let created_at: i64 = row.get(4)?;
    let updated_at: i64 = row.get(5)?;

    Ok(ComposeDeployment {
        id: row.get(0)?,
        machine_id: row.get(1)?,
        config: serde_json::from_str(&config_str).unwrap_or_default(),
        containers: Default::default(),
        network_name: row.get(3)?,
        created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn sample_container(machine_id: &str, name: &str) -> Container {
        let now = Utc::now();
        let mut config = ContainerConfig::default();
        config.name = name.to_string();
        config.image = "alpine:latest".to_string();
        Container {
            id: uuid::Uuid::new_v4().to_string(),
            machine_id: machine_id.to_string(),
            deployment_id: None,
            service_name: None,
            config,
            state: ContainerState::Created,
            native_id: None,
            stats: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let container = sample_container("m1", "web");

        db.with_conn(|conn| ContainerStore::insert(conn, &container))
            .await
            .unwrap();

        let loaded = db
            .with_conn(|conn| ContainerStore::get(conn, &container.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.config.name, "web");
        assert_eq!(loaded.state, ContainerState::Created);
    }

    #[tokio::test]
    async fn duplicate_name_per_machine_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let a = sample_container("m1", "dup");
        let b = sample_container("m1", "dup");

        db.with_conn(|conn| ContainerStore::insert(conn, &a)).await.unwrap();
        let result = db.with_conn(|conn| ContainerStore::insert(conn, &b)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn same_name_on_different_machines_is_allowed() {
        let db = Database::open_in_memory().unwrap();
        let a = sample_container("m1", "web");
        let b = sample_container("m2", "web");

        db.with_conn(|conn| ContainerStore::insert(conn, &a)).await.unwrap();
        db.with_conn(|conn| ContainerStore::insert(conn, &b)).await.unwrap();
    }

    #[tokio::test]
    async fn update_state_transitions() {
        let db = Database::open_in_memory().unwrap();
        let container = sample_container("m1", "web");
        db.with_conn(|conn| ContainerStore::insert(conn, &container))
            .await
            .unwrap();

        db.with_conn(|conn| {
            ContainerStore::update_state(conn, &container.id, ContainerState::Running, Some("native-1"))
        })
        .await
        .unwrap();

        let loaded = db
            .with_conn(|conn| ContainerStore::get(conn, &container.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.state, ContainerState::Running);
        assert_eq!(loaded.native_id.as_deref(), Some("native-1"));
    }
}

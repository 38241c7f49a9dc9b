//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `stepwise-core` using sqlx with split
//! read/write pools. Each workflow is one row whose `definition` column holds
//! the whole aggregate (triggers, steps, history, analytics) as JSON; the
//! remaining columns exist for lookups.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepwise_core::repository::workflow::WorkflowRepository;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{WorkflowDefinition, WorkflowOwner, WorkflowStatus};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// List workflows in a given lifecycle status, ordered by name.
    pub async fn list_by_status(&self, status: WorkflowStatus) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflows WHERE status = ? ORDER BY name ASC")
            .bind(status_str(status)?)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows.iter().map(decode_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let definition: String = row.try_get("definition").map_err(query_error)?;
    serde_json::from_str(&definition)
        .map_err(|e| RepositoryError::Serialization(format!("invalid workflow JSON: {e}")))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection(e.to_string())
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn status_str(status: WorkflowStatus) -> Result<String, RepositoryError> {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| RepositoryError::Serialization(format!("unencodable status: {status:?}")))
}

/// Extract `owner_type` and `owner_id` columns from a `WorkflowOwner`.
fn owner_parts(owner: &WorkflowOwner) -> (&'static str, Option<&str>) {
    match owner {
        WorkflowOwner::User { user_id } => ("user", Some(user_id.as_str())),
        WorkflowOwner::Team { team_id } => ("team", Some(team_id.as_str())),
        WorkflowOwner::System => ("system", None),
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_workflow(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Serialization(format!("serialize workflow: {e}")))?;
        let (owner_type, owner_id) = owner_parts(&def.owner);

        let result = sqlx::query(
            r#"INSERT INTO workflows (id, name, owner_type, owner_id, status, version, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 owner_type = excluded.owner_type,
                 owner_id = excluded.owner_id,
                 status = excluded.status,
                 version = excluded.version,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(owner_type)
        .bind(owner_id)
        .bind(status_str(def.status)?)
        .bind(i64::from(def.version))
        .bind(&definition_json)
        .bind(format_datetime(&def.created_at))
        .bind(format_datetime(&def.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(workflow_id = %def.id, version = def.version, "workflow saved");
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(RepositoryError::Conflict(
                format!("workflow name '{}' already exists for this owner", def.name),
            )),
            Err(e) => Err(query_error(e)),
        }
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn get_workflow_by_name(
        &self,
        name: &str,
        owner: &WorkflowOwner,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let (owner_type, owner_id) = owner_parts(owner);

        let row = sqlx::query(
            "SELECT definition FROM workflows WHERE name = ? AND owner_type = ? AND COALESCE(owner_id, '') = ?",
        )
        .bind(name)
        .bind(owner_type)
        .bind(owner_id.unwrap_or(""))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn list_workflows(&self, owner: Option<&WorkflowOwner>) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = match owner {
            Some(o) => {
                let (owner_type, owner_id) = owner_parts(o);
                sqlx::query(
                    "SELECT definition FROM workflows WHERE owner_type = ? AND COALESCE(owner_id, '') = ? ORDER BY name ASC",
                )
                .bind(owner_type)
                .bind(owner_id.unwrap_or(""))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT definition FROM workflows ORDER BY name ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        rows.iter().map(decode_row).collect()
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }
}

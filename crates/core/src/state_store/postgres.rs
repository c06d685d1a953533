use altec_common::ids::{TaskId, WorkerId};
use altec_common::model::{
    DurationClass, Policy, RefreshPolicy, Task, TaskError, TaskKey, TaskKind, TaskStatus,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

/// PostgreSQL-backed half of the State Store: the durable Task table.
///
/// Mirrors the teacher's `StoreClient` — a `PgPool`, a `migrate()` entry point running
/// `sqlx::migrate!`, a `health_check()`, and task CRUD grouped in this one `impl` block.
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, TaskStoreError> {
        tracing::info!("Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| TaskStoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.health_check().await?;
        tracing::info!("PostgreSQL connection established");
        Ok(store)
    }

    pub async fn health_check(&self) -> Result<(), TaskStoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| TaskStoreError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn migrate(&self) -> Result<(), TaskStoreError> {
        tracing::info!("Running PostgreSQL migrations");
        sqlx::migrate!("src/state_store/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TaskStoreError::Migration(e.to_string()))?;
        tracing::info!("PostgreSQL migrations complete");
        Ok(())
    }

    pub async fn put_task_if_absent(
        &self,
        key: &TaskKey,
        initial: &Task,
    ) -> Result<PutResult, TaskStoreError> {
        if let Some(existing) = self.load_task_opt(key).await? {
            return Ok(PutResult::Existing(existing));
        }

        let policy_json =
            serde_json::to_value(&initial.policy).map_err(|e| TaskStoreError::Query(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, kind, resource_id, status, phase_cursor, checkpoint,
                                progress_percent, progress_message, policy, attempts,
                                cancel_requested, resource_deleted, owner_worker, started_at,
                                updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (kind, resource_id) DO NOTHING
            "#,
        )
        .bind(initial.id.0)
        .bind(key.kind.as_str())
        .bind(&key.resource_id)
        .bind(initial.status.as_db_str())
        .bind(initial.phase_cursor as i32)
        .bind(&initial.checkpoint)
        .bind(initial.progress_percent)
        .bind(&initial.progress_message)
        .bind(&policy_json)
        .bind(initial.attempts as i32)
        .bind(initial.cancel_requested)
        .bind(initial.resource_deleted)
        .bind(initial.owner_worker.as_ref().map(|w| w.0.clone()))
        .bind(initial.started_at)
        .bind(initial.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskStoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Lost the insert race to a concurrent submitter.
            let existing = self
                .load_task_opt(key)
                .await?
                .ok_or_else(|| TaskStoreError::NotFound(key.to_string()))?;
            return Ok(PutResult::Existing(existing));
        }

        Ok(PutResult::Created(initial.clone()))
    }

    pub async fn load_task(&self, key: &TaskKey) -> Result<Task, TaskStoreError> {
        self.load_task_opt(key)
            .await?
            .ok_or_else(|| TaskStoreError::NotFound(key.to_string()))
    }

    async fn load_task_opt(&self, key: &TaskKey) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, kind, resource_id, status, phase_cursor, checkpoint,
                   progress_percent, progress_message, policy, attempts,
                   cancel_requested, resource_deleted, owner_worker, started_at, updated_at,
                   completed_at, error_kind, error_message, result_ref
            FROM tasks
            WHERE kind = $1 AND resource_id = $2
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TaskStoreError::Query(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// Owner-checked CAS: only applies the write if `owner_worker` still matches.
    pub async fn update_task_progress(
        &self,
        key: &TaskKey,
        owner_worker: &WorkerId,
        phase_cursor: u32,
        checkpoint: &[u8],
        progress_percent: f64,
        progress_message: &str,
    ) -> Result<(), TaskStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET phase_cursor = $3, checkpoint = $4, progress_percent = $5,
                progress_message = $6, updated_at = now()
            WHERE kind = $1 AND resource_id = $2 AND owner_worker = $7
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.resource_id)
        .bind(phase_cursor as i32)
        .bind(checkpoint)
        .bind(progress_percent)
        .bind(progress_message)
        .bind(&owner_worker.0)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskStoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotOwner);
        }
        Ok(())
    }

    pub async fn finalize_task(
        &self,
        key: &TaskKey,
        owner_worker: &WorkerId,
        status: TaskStatus,
        result_ref: Option<&str>,
        error: Option<&TaskError>,
    ) -> Result<(), TaskStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $3, result_ref = $4, error_kind = $5, error_message = $6,
                completed_at = now(), updated_at = now(), owner_worker = NULL
            WHERE kind = $1 AND resource_id = $2 AND owner_worker = $7
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.resource_id)
        .bind(status.as_db_str())
        .bind(result_ref)
        .bind(error.map(|e| e.kind.as_str()))
        .bind(error.map(|e| e.message.as_str()))
        .bind(&owner_worker.0)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskStoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotOwner);
        }
        Ok(())
    }

    pub async fn set_status(&self, key: &TaskKey, status: TaskStatus) -> Result<(), TaskStoreError> {
        sqlx::query(
            r#"UPDATE tasks SET status = $3, updated_at = now() WHERE kind = $1 AND resource_id = $2"#,
        )
        .bind(key.kind.as_str())
        .bind(&key.resource_id)
        .bind(status.as_db_str())
        .execute(&self.pool)
        .await
        .map_err(|e| TaskStoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Marks a Task ABANDONED and bumps `attempts` in one statement, returning the new
    /// count — the reclaim sweeper's write.
    pub async fn mark_abandoned(&self, key: &TaskKey) -> Result<u32, TaskStoreError> {
        let row: (i32,) = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = $3, attempts = attempts + 1, updated_at = now()
            WHERE kind = $1 AND resource_id = $2
            RETURNING attempts
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.resource_id)
        .bind(TaskStatus::Abandoned.as_db_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TaskStoreError::Query(e.to_string()))?;
        Ok(row.0 as u32)
    }

    pub async fn request_cancel(&self, key: &TaskKey) -> Result<(), TaskStoreError> {
        sqlx::query(
            r#"UPDATE tasks SET cancel_requested = true, updated_at = now() WHERE kind = $1 AND resource_id = $2"#,
        )
        .bind(key.kind.as_str())
        .bind(&key.resource_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskStoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Tombstones the underlying resource; the next pre-phase check observes this and
    /// aborts the in-flight execution without finalizing (§4.2).
    pub async fn request_tombstone(&self, key: &TaskKey) -> Result<(), TaskStoreError> {
        sqlx::query(
            r#"UPDATE tasks SET resource_deleted = true, updated_at = now() WHERE kind = $1 AND resource_id = $2"#,
        )
        .bind(key.kind.as_str())
        .bind(&key.resource_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskStoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Stamp a worker as current owner after a lock win outside this store (the lock
    /// itself lives in Redis; this keeps the durable row's `owner_worker` in sync for
    /// display purposes).
    pub async fn set_owner(
        &self,
        key: &TaskKey,
        owner_worker: Option<&WorkerId>,
    ) -> Result<(), TaskStoreError> {
        sqlx::query(
            r#"UPDATE tasks SET owner_worker = $3, updated_at = now() WHERE kind = $1 AND resource_id = $2"#,
        )
        .bind(key.kind.as_str())
        .bind(&key.resource_id)
        .bind(owner_worker.map(|w| w.0.as_str()))
        .execute(&self.pool)
        .await
        .map_err(|e| TaskStoreError::Query(e.to_string()))?;
        Ok(())
    }
}

/// Tagged result of `put_task_if_absent` so callers can distinguish a fresh insert
/// from an already-existing row without a second racy read.
pub enum PutResult {
    Created(Task),
    Existing(Task),
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    kind: String,
    resource_id: String,
    status: String,
    phase_cursor: i32,
    checkpoint: Vec<u8>,
    progress_percent: f64,
    progress_message: String,
    policy: serde_json::Value,
    attempts: i32,
    cancel_requested: bool,
    resource_deleted: bool,
    owner_worker: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_kind: Option<String>,
    error_message: Option<String>,
    result_ref: Option<String>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        let kind = TaskKind::parse(&row.kind).unwrap_or(TaskKind::TextProfile);
        let policy: Policy = serde_json::from_value(row.policy).unwrap_or(Policy {
            duration_class: DurationClass::S,
            predicted_seconds: 0.0,
            heartbeat_interval_secs: 60,
            lock_lease_secs: 300,
            segment_count: 1,
            client_refresh_interval_secs: RefreshPolicy::Off,
        });
        let error = match (row.error_kind, row.error_message) {
            (Some(kind), Some(message)) => Some(TaskError::new(kind, message)),
            _ => None,
        };
        Task {
            id: TaskId::from_uuid(row.id),
            key: TaskKey::new(kind, row.resource_id),
            status: TaskStatus::parse(&row.status),
            phase_cursor: row.phase_cursor as u32,
            checkpoint: row.checkpoint,
            progress_percent: row.progress_percent,
            progress_message: row.progress_message,
            policy,
            attempts: row.attempts as u32,
            cancel_requested: row.cancel_requested,
            resource_deleted: row.resource_deleted,
            owner_worker: row.owner_worker.map(WorkerId::new),
            started_at: row.started_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            error,
            result_ref: row.result_ref,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("PostgreSQL connection error: {0}")]
    Connection(String),
    #[error("PostgreSQL query error: {0}")]
    Query(String),
    #[error("PostgreSQL migration error: {0}")]
    Migration(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Not the current lock owner")]
    NotOwner,
}

impl From<TaskStoreError> for altec_common::AltecError {
    fn from(e: TaskStoreError) -> Self {
        match e {
            TaskStoreError::NotOwner => altec_common::AltecError::NotOwner,
            TaskStoreError::NotFound(m) => altec_common::AltecError::TaskNotFound(m),
            other => altec_common::AltecError::Postgres(other.to_string()),
        }
    }
}

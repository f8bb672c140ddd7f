//! Enqueue half of component J. Pre-registers the `Operation` row in the
//! *same* call as inserting the queue row (§9 "task-ownership
//! pre-registration": the dispatcher, not the task body, must do this).

use std::sync::Arc;

use serde_json::Value;
use sqlx::AnyPool;
use uuid::Uuid;

use crate::error::SyncError;
use crate::journal::OperationJournal;
use crate::model::OperationType;
use crate::queue::types::Lane;
use crate::time::now_secs;

#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<AnyPool>,
    journal: OperationJournal,
}

impl Dispatcher {
    pub fn new(pool: Arc<AnyPool>, journal: OperationJournal) -> Self {
        Self { pool, journal }
    }

    pub async fn enqueue(
        &self,
        user_id: Uuid,
        operation_type: OperationType,
        payload: Option<Value>,
    ) -> Result<Uuid, SyncError> {
        let task_id = Uuid::new_v4();
        let lane = Lane::for_operation(&operation_type);

        // Pre-registration before the queue row exists at all: a status
        // poll that lands between these two statements still finds the
        // operation, just not yet claimed by a worker.
        self.journal
            .register_pending(task_id, user_id, operation_type.clone())
            .await?;

        let now = now_secs();
        let payload_json = payload.map(|v| serde_json::to_string(&v)).transpose().map_err(|e| {
            SyncError::Validation {
                detail: format!("payload not serializable: {e}"),
                field: None,
            }
        })?;

        sqlx::query(
            r#"INSERT INTO queue_tasks
                 (task_id, user_id, lane, operation_type, payload, status, attempt, available_at, created_at)
               VALUES (?, ?, ?, ?, ?, 'queued', 0, ?, ?)"#,
        )
        .bind(task_id.to_string())
        .bind(user_id.to_string())
        .bind(lane.as_str())
        .bind(operation_type.as_str())
        .bind(payload_json)
        .bind(now)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| SyncError::Database {
            operation: "enqueue".into(),
            detail: e.to_string(),
        })?;

        Ok(task_id)
    }
}

//! Component K: the operation journal. A thin, ownership-checking wrapper
//! around `db::repo::SyncRepository`'s `operations` methods — kept as its
//! own module because every background-task flow (F/G/H/I) and every
//! status-poll caller talks to it, and §3's ownership invariant needs to
//! live in exactly one place rather than be re-checked ad hoc.

use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::db::repo::SyncRepository;
use crate::error::SyncError;
use crate::model::{Operation, OperationType};

#[derive(Clone)]
pub struct OperationJournal {
    repo: Arc<dyn SyncRepository>,
}

impl OperationJournal {
    pub fn new(repo: Arc<dyn SyncRepository>) -> Self {
        Self { repo }
    }

    /// Must be called by the dispatcher before a task body starts running
    /// (§4.J "pre-registration", §9 "task-ownership pre-registration").
    pub async fn register_pending(
        &self,
        operation_id: Uuid,
        user_id: Uuid,
        operation_type: OperationType,
    ) -> Result<(), SyncError> {
        self.repo
            .register_pending(operation_id, user_id, operation_type)
            .await
            .map_err(|e| SyncError::Database {
                operation: "register_pending".into(),
                detail: e.to_string(),
            })
    }

    /// Progress metadata shape for bulk-sync / drift (§4.F step 5):
    /// `{total_products, total_chunks, processed_chunks, progress_percent,
    /// processed, created, updated, skipped}`. Last-writer-wins, advisory
    /// (§5 "ordering guarantees").
    pub async fn update_progress(
        &self,
        operation_id: Uuid,
        total_products: u64,
        total_chunks: u64,
        processed_chunks: u64,
        processed: u64,
        created: u64,
        updated: u64,
        skipped: u64,
    ) -> Result<(), SyncError> {
        let progress_percent = if total_chunks == 0 {
            100
        } else {
            ((processed_chunks as f64 / total_chunks as f64) * 100.0).round() as u64
        };
        let metadata = json!({
            "total_products": total_products,
            "total_chunks": total_chunks,
            "processed_chunks": processed_chunks,
            "progress_percent": progress_percent,
            "processed": processed,
            "created": created,
            "updated": updated,
            "skipped": skipped,
        });
        self.repo
            .update_metadata(operation_id, metadata)
            .await
            .map_err(|e| SyncError::Database {
                operation: "update_progress".into(),
                detail: e.to_string(),
            })
    }

    pub async fn complete(&self, operation_id: Uuid) -> Result<(), SyncError> {
        self.repo
            .complete_operation(operation_id)
            .await
            .map_err(|e| SyncError::Database {
                operation: "complete_operation".into(),
                detail: e.to_string(),
            })
    }

    pub async fn fail(&self, operation_id: Uuid, error_detail: &str) -> Result<(), SyncError> {
        self.repo
            .fail_operation(operation_id, json!({ "error": error_detail }))
            .await
            .map_err(|e| SyncError::Database {
                operation: "fail_operation".into(),
                detail: e.to_string(),
            })
    }

    /// §3 ownership invariant: `user_id` on the operation authorizes status
    /// reads by that user. Callers outside this module never see an
    /// `Operation` belonging to someone else.
    pub async fn get_status_for(
        &self,
        operation_id: Uuid,
        requesting_user: Uuid,
    ) -> Result<Operation, SyncError> {
        let op = self
            .repo
            .get_operation(operation_id)
            .await
            .map_err(|e| SyncError::Database {
                operation: "get_operation".into(),
                detail: e.to_string(),
            })?
            .ok_or(SyncError::SyncNotFound {
                user_id: requesting_user.to_string(),
            })?;

        if op.user_id != requesting_user {
            // Indistinguishable from "not found" to the caller: we don't
            // leak the existence of another user's operation.
            return Err(SyncError::SyncNotFound {
                user_id: requesting_user.to_string(),
            });
        }
        Ok(op)
    }

    /// Raw metadata accessor, for internal chunk-loop callers that already
    /// hold the operation and just need the JSON bag back (e.g. to merge
    /// forward rather than overwrite).
    pub async fn metadata(&self, operation_id: Uuid) -> Result<Option<Value>, SyncError> {
        Ok(self
            .repo
            .get_operation(operation_id)
            .await
            .map_err(|e| SyncError::Database {
                operation: "get_operation".into(),
                detail: e.to_string(),
            })?
            .and_then(|op| op.metadata))
    }
}

use serde_json::Value;
use uuid::Uuid;

use crate::model::OperationType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lane {
    HighPriority,
    BulkSync,
    Default,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighPriority => "high-priority",
            Self::BulkSync => "bulk-sync",
            Self::Default => "default",
        }
    }

    /// §4.J: webhooks and single-item updates/deletes are high-priority;
    /// bulk ingest gets its own lane so a large export can't starve
    /// interactive writes.
    pub fn for_operation(operation_type: &OperationType) -> Self {
        match operation_type {
            OperationType::Webhook | OperationType::SyncUpdate | OperationType::SyncDelete => {
                Self::HighPriority
            }
            OperationType::BulkSync => Self::BulkSync,
            OperationType::Periodic => Self::Default,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueuedTask {
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub lane: Lane,
    pub operation_type: OperationType,
    pub payload: Option<Value>,
    pub attempt: i64,
}

/// Retry budget is per task kind, not per error (§7).
pub fn max_retries(operation_type: &OperationType) -> u32 {
    match operation_type {
        OperationType::BulkSync => 10,
        OperationType::SyncUpdate | OperationType::SyncDelete => 5,
        OperationType::Webhook => 3,
        OperationType::Periodic => 5,
    }
}

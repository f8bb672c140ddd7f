//! §3 data model: the three persistent entities of the local relational
//! store. Plain data, no persistence logic — repositories in `db::repo` map
//! these to/from SQL rows via small `row_to_*` functions.

use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    InitialSync,
    Active,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InitialSync => "initial_sync",
            Self::Active => "active",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "initial_sync" => Some(Self::InitialSync),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One per user. `user_id` is an opaque 128-bit identifier (a `Uuid`).
#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub user_id: Uuid,
    pub token_encrypted: String,
    pub webhook_secret: Option<String>,
    pub sync_status: SyncStatus,
    pub last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

/// One per `(user, blueprint, external_stock_id)`.
#[derive(Clone, Debug)]
pub struct InventoryItem {
    pub id: i64,
    pub user_id: Uuid,
    pub blueprint_id: i64,
    pub external_stock_id: Option<String>,
    pub quantity: i64,
    pub price_cents: i64,
    pub description: Option<String>,
    pub user_data_field: Option<String>,
    pub graded: Option<bool>,
    pub properties: Option<Value>,
}

impl InventoryItem {
    /// Clamp-at-zero quantity arithmetic, used by every caller that mutates
    /// quantity: bulk sync, reconciler, webhook processor, drift sync.
    pub fn clamp_quantity(q: i64) -> i64 {
        q.max(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationType {
    BulkSync,
    SyncUpdate,
    SyncDelete,
    Webhook,
    Periodic,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BulkSync => "bulk_sync",
            Self::SyncUpdate => "sync_update",
            Self::SyncDelete => "sync_delete",
            Self::Webhook => "webhook",
            Self::Periodic => "periodic",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One per background task, keyed by the job queue's task id
/// (`operation_id`). Must exist before the task body begins executing
/// (pre-registration, §4.J / §9).
#[derive(Clone, Debug)]
pub struct Operation {
    pub operation_id: Uuid,
    pub user_id: Uuid,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub metadata: Option<Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

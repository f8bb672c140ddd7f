use serde_json::{Value, json};
use thiserror::Error;

/// Stable, machine-readable error taxonomy for the sync service.
///
/// Each variant corresponds to one row of the error taxonomy table: a
/// stable `error_code`, an HTTP status shown only for documentation/logging
/// purposes (no HTTP framing lives in this crate), and a context bag carried
/// as opaque JSON so callers can log or forward it without this crate
/// knowing about their transport.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sync already in progress for user {user_id}, status {current_status}")]
    SyncInProgress {
        user_id: String,
        current_status: String,
    },

    #[error("sync settings not found for user {user_id}")]
    SyncNotFound { user_id: String },

    #[error("inventory item {item_id} not found")]
    InventoryItemNotFound { item_id: i64, user_id: Option<String> },

    #[error("inventory item {item_id} missing external_stock_id; run bulk sync first")]
    InventoryItemMissingExternalId { item_id: i64 },

    #[error("validation failed: {detail}")]
    Validation {
        detail: String,
        field: Option<String>,
    },

    #[error("rate limit exceeded{}", .retry_after.map(|s| format!("; retry after {s:.2}s")).unwrap_or_default())]
    RateLimitExceeded { retry_after: Option<f64> },

    #[error("marketplace temporarily unavailable{}", .timeout.map(|t| format!("; retry in {t}s")).unwrap_or_default())]
    MarketplaceServiceUnavailable { timeout: Option<u64> },

    #[error("marketplace API error: {detail}")]
    MarketplaceApiError { detail: String },

    #[error("database error during {operation}: {detail}")]
    Database { operation: String, detail: String },

    #[error("configuration error for {setting}: {detail}")]
    Configuration { setting: String, detail: String },

    #[error("webhook signature validation failed")]
    WebhookValidation,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SyncInProgress { .. } => "SYNC_IN_PROGRESS",
            Self::SyncNotFound { .. } => "SYNC_NOT_FOUND",
            Self::InventoryItemNotFound { .. } => "INVENTORY_ITEM_NOT_FOUND",
            Self::InventoryItemMissingExternalId { .. } => "INVENTORY_ITEM_MISSING_EXTERNAL_ID",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::MarketplaceServiceUnavailable { .. } => "MARKETPLACE_SERVICE_UNAVAILABLE",
            Self::MarketplaceApiError { .. } => "MARKETPLACE_API_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::WebhookValidation => "WEBHOOK_VALIDATION_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status this error would map to at an API boundary. Not used by
    /// any HTTP framing in this crate — kept for logging and for callers
    /// that do own a transport layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::SyncInProgress { .. } => 409,
            Self::SyncNotFound { .. }
            | Self::InventoryItemNotFound { .. } => 404,
            Self::InventoryItemMissingExternalId { .. } | Self::Validation { .. } => 400,
            Self::RateLimitExceeded { .. } => 429,
            Self::MarketplaceServiceUnavailable { .. } => 503,
            Self::MarketplaceApiError { .. } => 502,
            Self::Database { .. } | Self::Configuration { .. } | Self::Other(_) => 500,
            Self::WebhookValidation => 401,
        }
    }

    pub fn context(&self) -> Value {
        match self {
            Self::SyncInProgress {
                user_id,
                current_status,
            } => json!({ "user_id": user_id, "current_status": current_status }),
            Self::SyncNotFound { user_id } => json!({ "user_id": user_id }),
            Self::InventoryItemNotFound { item_id, user_id } => {
                json!({ "item_id": item_id, "user_id": user_id })
            }
            Self::InventoryItemMissingExternalId { item_id } => json!({ "item_id": item_id }),
            Self::Validation { field, .. } => json!({ "field": field }),
            Self::RateLimitExceeded { retry_after } => json!({ "retry_after": retry_after }),
            Self::MarketplaceServiceUnavailable { timeout } => json!({ "timeout": timeout }),
            Self::MarketplaceApiError { .. }
            | Self::Database { .. }
            | Self::Configuration { .. }
            | Self::WebhookValidation
            | Self::Other(_) => json!({}),
        }
    }
}

//! Wire types for the Marketplace HTTP surface consumed in §6.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct InfoResponse {
    pub id: i64,
    pub name: String,
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteProduct {
    pub id: String,
    pub blueprint_id: Option<i64>,
    pub quantity: i64,
    pub price_cents: i64,
    pub description: Option<String>,
    pub user_data_field: Option<String>,
    pub graded: Option<bool>,
    #[serde(default)]
    pub properties_hash: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkUpdateRequest {
    pub products: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobEnvelope {
    pub job: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatus {
    pub state: String,
    #[serde(default)]
    pub stats: Option<Value>,
    #[serde(default)]
    pub results: Option<Value>,
}

//! `TaskHandler` implementations binding each `OperationType` to the
//! component that actually does the work. Thin glue: all real logic lives
//! in `reconciler`, `sync`, and `webhook`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::crypto::TokenCipher;
use crate::db::repo::SyncRepository;
use crate::marketplace::MarketplaceClient;
use crate::marketplace::payload::to_wire_product;
use crate::queue::types::QueuedTask;
use crate::queue::worker::TaskHandler;
use crate::sync::{BulkSyncEngine, DriftSyncEngine};
use crate::webhook::WebhookProcessor;

pub struct SyncUpdateHandler {
    pub repo: Arc<dyn SyncRepository>,
    pub marketplace: MarketplaceClient,
    pub cipher: Arc<dyn TokenCipher>,
}

#[async_trait]
impl TaskHandler for SyncUpdateHandler {
    async fn handle(&self, task: &QueuedTask) -> anyhow::Result<()> {
        let item_id = task
            .payload
            .as_ref()
            .and_then(|p| p.get("item_id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("sync_update task missing item_id"))?;

        // Re-reads the latest row rather than trusting anything captured
        // at enqueue time (§4.G "Update").
        let item = self
            .repo
            .get_item(item_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("item {item_id} no longer exists"))?;
        if item.external_stock_id.is_none() {
            return Ok(()); // deleted/detached locally before the task ran
        }

        let settings = self
            .repo
            .get_settings(task.user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("sync settings missing for {}", task.user_id))?;
        let token = self.cipher.decrypt(&settings.token_encrypted)?;

        let wire = to_wire_product(&item);
        self.marketplace
            .bulk_update(task.user_id, &token, vec![wire])
            .await?;
        Ok(())
    }
}

pub struct SyncDeleteHandler {
    pub repo: Arc<dyn SyncRepository>,
    pub marketplace: MarketplaceClient,
    pub cipher: Arc<dyn TokenCipher>,
}

#[async_trait]
impl TaskHandler for SyncDeleteHandler {
    async fn handle(&self, task: &QueuedTask) -> anyhow::Result<()> {
        let external_stock_id = task
            .payload
            .as_ref()
            .and_then(|p| p.get("external_stock_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("sync_delete task missing external_stock_id"))?;

        let settings = self
            .repo
            .get_settings(task.user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("sync settings missing for {}", task.user_id))?;
        let token = self.cipher.decrypt(&settings.token_encrypted)?;

        // 404 is already folded into success by `MarketplaceClient::delete`.
        self.marketplace
            .delete(task.user_id, &token, external_stock_id)
            .await?;
        Ok(())
    }
}

pub struct BulkSyncHandler {
    pub engine: Arc<BulkSyncEngine>,
}

#[async_trait]
impl TaskHandler for BulkSyncHandler {
    async fn handle(&self, task: &QueuedTask) -> anyhow::Result<()> {
        let force = task
            .payload
            .as_ref()
            .and_then(|p| p.get("force"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.engine
            .run(task.user_id, task.task_id, force)
            .await
            .map_err(anyhow::Error::from)
    }
}

pub struct PeriodicDriftHandler {
    pub engine: Arc<DriftSyncEngine>,
}

#[async_trait]
impl TaskHandler for PeriodicDriftHandler {
    async fn handle(&self, task: &QueuedTask) -> anyhow::Result<()> {
        let blueprint_id = task
            .payload
            .as_ref()
            .and_then(|p| p.get("blueprint_id"))
            .and_then(Value::as_i64);
        self.engine
            .run(task.user_id, task.task_id, blueprint_id)
            .await
            .map_err(anyhow::Error::from)
    }
}

pub struct WebhookHandler {
    pub processor: Arc<WebhookProcessor>,
}

#[async_trait]
impl TaskHandler for WebhookHandler {
    async fn handle(&self, task: &QueuedTask) -> anyhow::Result<()> {
        let body = task
            .payload
            .clone()
            .ok_or_else(|| anyhow::anyhow!("webhook task missing body"))?;
        let result = self.processor.apply(task.user_id, &body).await?;
        if let Some(errors) = result.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                tracing::warn!(task_id = %task.task_id, ?errors, "webhook processed with per-item errors");
            }
        }
        Ok(())
    }
}

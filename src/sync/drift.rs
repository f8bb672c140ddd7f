//! Component I: periodic drift sync. Reapplies F's per-item upsert logic
//! (blueprint resolution, deny-list, existing-row lookup) against a
//! possibly-filtered export to repair divergence that accumulated between
//! webhook deliveries and bulk syncs.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::db::repo::SyncRepository;
use crate::error::SyncError;
use crate::journal::OperationJournal;
use crate::kv::BlueprintMapper;
use crate::marketplace::MarketplaceClient;
use crate::sync::bulk::process_chunk;

pub struct DriftSyncEngine {
    repo: Arc<dyn SyncRepository>,
    marketplace: MarketplaceClient,
    blueprint_mapper: Arc<BlueprintMapper>,
    journal: OperationJournal,
    cipher: Arc<dyn TokenCipher>,
    deny_listed_tables: Arc<HashSet<String>>,
}

impl DriftSyncEngine {
    pub fn new(
        repo: Arc<dyn SyncRepository>,
        marketplace: MarketplaceClient,
        blueprint_mapper: Arc<BlueprintMapper>,
        journal: OperationJournal,
        cipher: Arc<dyn TokenCipher>,
        deny_listed_tables: Vec<String>,
    ) -> Self {
        Self {
            repo,
            marketplace,
            blueprint_mapper,
            journal,
            cipher,
            deny_listed_tables: Arc::new(deny_listed_tables.into_iter().collect()),
        }
    }

    pub async fn run(
        &self,
        user_id: Uuid,
        operation_id: Uuid,
        blueprint_id: Option<i64>,
    ) -> Result<(), SyncError> {
        let result = self.run_inner(user_id, blueprint_id).await;
        match &result {
            Ok(()) => self.journal.complete(operation_id).await?,
            Err(e) => self.journal.fail(operation_id, &e.to_string()).await?,
        }
        result
    }

    async fn run_inner(&self, user_id: Uuid, blueprint_id: Option<i64>) -> Result<(), SyncError> {
        let settings = self
            .repo
            .get_settings(user_id)
            .await
            .map_err(|e| SyncError::Database {
                operation: "get_settings".into(),
                detail: e.to_string(),
            })?
            .ok_or_else(|| SyncError::SyncNotFound {
                user_id: user_id.to_string(),
            })?;

        let token = self.cipher.decrypt(&settings.token_encrypted)?;

        let products = self
            .marketplace
            .products_export(user_id, &token, blueprint_id)
            .await?;

        process_chunk(
            self.repo.clone(),
            self.blueprint_mapper.clone(),
            self.deny_listed_tables.clone(),
            user_id,
            products,
        )
        .await
        .map_err(|e| SyncError::Database {
            operation: "drift_sync".into(),
            detail: e.to_string(),
        })?;

        Ok(())
    }
}

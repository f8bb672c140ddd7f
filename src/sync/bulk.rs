//! Component F: the bulk-sync engine. Follows §4.F's algorithm exactly —
//! export, chunk, P-way concurrent per-chunk upsert using isolated
//! connections (§9 "explicit per-chunk database handles"), progress
//! metadata after each batch, synchronous-fallback error write on
//! unrecoverable failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::db::repo::{NewInventoryItem, SyncRepository};
use crate::error::SyncError;
use crate::journal::OperationJournal;
use crate::kv::BlueprintMapper;
use crate::marketplace::MarketplaceClient;
use crate::marketplace::types::RemoteProduct;
use crate::model::InventoryItem;

pub(crate) struct ChunkOutcome {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
}

pub struct BulkSyncEngine {
    repo: Arc<dyn SyncRepository>,
    /// Independent pool/connection used only to record a terminal failure
    /// if the primary path is compromised (§4.F step 7).
    fallback_repo: Arc<dyn SyncRepository>,
    marketplace: MarketplaceClient,
    blueprint_mapper: Arc<BlueprintMapper>,
    journal: OperationJournal,
    cipher: Arc<dyn TokenCipher>,
    chunk_size: usize,
    parallel_chunks: usize,
    deny_listed_tables: Arc<HashSet<String>>,
}

impl BulkSyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn SyncRepository>,
        fallback_repo: Arc<dyn SyncRepository>,
        marketplace: MarketplaceClient,
        blueprint_mapper: Arc<BlueprintMapper>,
        journal: OperationJournal,
        cipher: Arc<dyn TokenCipher>,
        chunk_size: usize,
        parallel_chunks: usize,
        deny_listed_tables: Vec<String>,
    ) -> Self {
        Self {
            repo,
            fallback_repo,
            marketplace,
            blueprint_mapper,
            journal,
            cipher,
            chunk_size,
            parallel_chunks,
            deny_listed_tables: Arc::new(deny_listed_tables.into_iter().collect()),
        }
    }

    pub async fn run(&self, user_id: Uuid, operation_id: Uuid, force: bool) -> Result<(), SyncError> {
        let settings = self
            .repo
            .get_settings(user_id)
            .await
            .map_err(db_err("get_settings"))?
            .ok_or_else(|| SyncError::SyncNotFound {
                user_id: user_id.to_string(),
            })?;

        let token = self.cipher.decrypt(&settings.token_encrypted)?;
        if token.is_empty() {
            return Err(SyncError::Configuration {
                setting: "token_encrypted".into(),
                detail: "stored token is empty".into(),
            });
        }

        let began = self
            .repo
            .try_begin_initial_sync(user_id, force)
            .await
            .map_err(db_err("try_begin_initial_sync"))?;
        if !began {
            return Err(SyncError::SyncInProgress {
                user_id: user_id.to_string(),
                current_status: settings.sync_status.as_str().to_string(),
            });
        }

        let result = self.run_inner(user_id, operation_id, &token).await;

        match &result {
            Ok(()) => {
                self.repo
                    .finish_sync_active(user_id, Utc::now())
                    .await
                    .map_err(db_err("finish_sync_active"))?;
                self.journal.complete(operation_id).await?;
            }
            Err(e) => {
                if let Err(fallback_err) = self
                    .fallback_repo
                    .finish_sync_error(user_id, &e.to_string())
                    .await
                {
                    tracing::error!(
                        error = %fallback_err,
                        original_error = %e,
                        "fallback status write also failed; user stuck in initial_sync"
                    );
                }
                self.journal.fail(operation_id, &e.to_string()).await.ok();
            }
        }

        result
    }

    async fn run_inner(&self, user_id: Uuid, operation_id: Uuid, token: &str) -> Result<(), SyncError> {
        let products = self.marketplace.products_export(user_id, token, None).await?;
        let total_products = products.len() as u64;

        let chunks: Vec<Vec<Value>> = products
            .chunks(self.chunk_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        let total_chunks = chunks.len() as u64;

        let mut processed_chunks = 0u64;
        let mut processed = 0u64;
        let mut created_total = 0u64;
        let mut updated_total = 0u64;
        let mut skipped_total = 0u64;

        for batch in chunks.chunks(self.parallel_chunks.max(1)) {
            let mut handles = Vec::with_capacity(batch.len());
            for chunk in batch {
                let repo = self.repo.clone();
                let mapper = self.blueprint_mapper.clone();
                let deny_listed = self.deny_listed_tables.clone();
                let chunk = chunk.clone();
                handles.push(tokio::spawn(async move {
                    process_chunk(repo, mapper, deny_listed, user_id, chunk).await
                }));
            }

            for handle in handles {
                let outcome = handle
                    .await
                    .map_err(|e| SyncError::Database {
                        operation: "bulk_sync_chunk".into(),
                        detail: format!("chunk task panicked: {e}"),
                    })?
                    .map_err(|e| SyncError::Database {
                        operation: "bulk_sync_chunk".into(),
                        detail: e.to_string(),
                    })?;
                processed += outcome.processed;
                created_total += outcome.created;
                updated_total += outcome.updated;
                skipped_total += outcome.skipped;
            }

            processed_chunks += batch.len() as u64;
            self.journal
                .update_progress(
                    operation_id,
                    total_products,
                    total_chunks,
                    processed_chunks,
                    processed,
                    created_total,
                    updated_total,
                    skipped_total,
                )
                .await?;
        }

        Ok(())
    }
}

/// Runs on its own tokio task with its own `Arc<dyn SyncRepository>` clone
/// so one slow chunk never holds a connection across another chunk's work
/// (§9 "Bulk-sync parallelism").
pub(crate) async fn process_chunk(
    repo: Arc<dyn SyncRepository>,
    blueprint_mapper: Arc<BlueprintMapper>,
    deny_listed_tables: Arc<HashSet<String>>,
    user_id: Uuid,
    chunk: Vec<Value>,
) -> anyhow::Result<ChunkOutcome> {
    let mut skipped = 0u64;
    let mut parsed: Vec<RemoteProduct> = Vec::with_capacity(chunk.len());

    for raw in chunk {
        match serde_json::from_value::<RemoteProduct>(raw) {
            Ok(p) if p.blueprint_id.is_some() && !p.id.is_empty() => parsed.push(p),
            _ => skipped += 1,
        }
    }

    let blueprint_ids: Vec<i64> = parsed.iter().map(|p| p.blueprint_id.unwrap()).collect();
    let resolved = blueprint_mapper.resolve_batch(&blueprint_ids).await?;

    let mut accepted = Vec::with_capacity(parsed.len());
    for p in parsed {
        let blueprint_id = p.blueprint_id.unwrap();
        match resolved.get(&blueprint_id) {
            Some((_, catalog_table)) if deny_listed_tables.contains(catalog_table) => skipped += 1,
            Some(_) => accepted.push(p),
            None => skipped += 1, // unresolvable blueprint: cannot place safely
        }
    }

    let keys: Vec<(i64, Option<String>)> = accepted
        .iter()
        .map(|p| (p.blueprint_id.unwrap(), Some(p.id.clone())))
        .collect();
    let existing: HashMap<(i64, Option<String>), InventoryItem> =
        repo.find_existing_for_chunk(user_id, &keys).await?;

    let mut to_insert = Vec::new();
    let mut to_update = Vec::new();

    for p in accepted {
        let key = (p.blueprint_id.unwrap(), Some(p.id.clone()));
        let new_item = NewInventoryItem {
            user_id,
            blueprint_id: key.0,
            external_stock_id: Some(p.id.clone()),
            quantity: InventoryItem::clamp_quantity(p.quantity),
            price_cents: p.price_cents.max(0),
            description: p.description,
            user_data_field: p.user_data_field,
            graded: p.graded,
            properties: p.properties_hash.map(|h| json!({ "properties_hash": h })),
        };

        match existing.get(&key) {
            Some(existing_item) => to_update.push((existing_item.id, new_item)),
            None => to_insert.push(new_item),
        }
    }

    let created = repo.bulk_insert(&to_insert).await?;
    let updated = repo.bulk_update(&to_update).await?;

    Ok(ChunkOutcome {
        processed: created + updated + skipped,
        created,
        updated,
        skipped,
    })
}

fn db_err(operation: &'static str) -> impl Fn(anyhow::Error) -> SyncError {
    move |e| SyncError::Database {
        operation: operation.to_string(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_hash_stored_as_opaque_marker() {
        let item = NewInventoryItem {
            user_id: Uuid::new_v4(),
            blueprint_id: 1,
            external_stock_id: Some("abc".into()),
            quantity: 3,
            price_cents: 100,
            description: None,
            user_data_field: None,
            graded: None,
            properties: Some(json!({"properties_hash": "deadbeef"})),
        };
        assert_eq!(
            item.properties.unwrap().get("properties_hash").unwrap(),
            "deadbeef"
        );
    }
}

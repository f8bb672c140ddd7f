//! Component G: the write-path reconciler. Update/delete enqueue a
//! background sync after the local mutation commits; purchase is the
//! three-step saga of §4.G, with the row lock scoped to steps 1 and 3 only
//! (§5/§9 "Long transaction vs external I/O").

use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::db::repo::SyncRepository;
use crate::error::SyncError;
use crate::marketplace::MarketplaceClient;
use crate::marketplace::payload::merge_properties;
use crate::model::{InventoryItem, OperationType};
use crate::queue::Dispatcher;

#[derive(Clone, Debug, Default)]
pub struct ItemPatch {
    pub quantity: Option<i64>,
    pub price_cents: Option<i64>,
    pub description: Option<String>,
    pub user_data_field: Option<String>,
    pub graded: Option<bool>,
    pub properties_patch: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct PurchaseOutcome {
    pub quantity_after: i64,
}

pub struct Reconciler {
    repo: Arc<dyn SyncRepository>,
    marketplace: MarketplaceClient,
    dispatcher: Dispatcher,
    cipher: Arc<dyn TokenCipher>,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn SyncRepository>,
        marketplace: MarketplaceClient,
        dispatcher: Dispatcher,
        cipher: Arc<dyn TokenCipher>,
    ) -> Self {
        Self {
            repo,
            marketplace,
            dispatcher,
            cipher,
        }
    }

    pub async fn update_item(
        &self,
        user_id: Uuid,
        item_id: i64,
        patch: ItemPatch,
    ) -> Result<InventoryItem, SyncError> {
        let mut item = self.get_owned_item(user_id, item_id).await?;

        let mut synced_field_changed = false;
        if let Some(q) = patch.quantity {
            synced_field_changed |= q != item.quantity;
            item.quantity = InventoryItem::clamp_quantity(q);
        }
        if let Some(p) = patch.price_cents {
            synced_field_changed |= p != item.price_cents;
            item.price_cents = p.max(0);
        }
        if patch.description.is_some() {
            synced_field_changed = true;
            item.description = patch.description;
        }
        if patch.user_data_field.is_some() {
            synced_field_changed = true;
            item.user_data_field = patch.user_data_field;
        }
        if let Some(g) = patch.graded {
            synced_field_changed |= Some(g) != item.graded;
            item.graded = Some(g);
        }
        if let Some(props_patch) = &patch.properties_patch {
            item.properties = Some(merge_properties(item.properties.as_ref(), props_patch));
            synced_field_changed = true;
        }

        self.repo
            .update_item_full(&item)
            .await
            .map_err(|e| SyncError::Database {
                operation: "update_item_full".into(),
                detail: e.to_string(),
            })?;

        if item.external_stock_id.is_some() && synced_field_changed {
            // Parameters are deliberately just the item id: the task
            // re-reads the latest row rather than trusting a stale
            // snapshot taken at enqueue time (§4.G "Update").
            self.dispatcher
                .enqueue(user_id, OperationType::SyncUpdate, Some(json!({ "item_id": item_id })))
                .await?;
        }

        Ok(item)
    }

    pub async fn delete_item(&self, user_id: Uuid, item_id: i64) -> Result<(), SyncError> {
        let item = self.get_owned_item(user_id, item_id).await?;

        self.repo
            .delete_item(item_id)
            .await
            .map_err(|e| SyncError::Database {
                operation: "delete_item".into(),
                detail: e.to_string(),
            })?;

        if let Some(external_stock_id) = item.external_stock_id {
            self.dispatcher
                .enqueue(
                    user_id,
                    OperationType::SyncDelete,
                    Some(json!({ "external_stock_id": external_stock_id })),
                )
                .await?;
        }

        Ok(())
    }

    /// §4.G "Purchase": the three-step saga plus best-effort compensation.
    pub async fn purchase(
        &self,
        user_id: Uuid,
        item_id: i64,
        req: i64,
    ) -> Result<PurchaseOutcome, SyncError> {
        // Step 1: Reserve.
        let reservation = self
            .repo
            .purchase_reserve(user_id, item_id)
            .await
            .map_err(|e| SyncError::Database {
                operation: "purchase_reserve".into(),
                detail: e.to_string(),
            })?
            .ok_or(SyncError::InventoryItemNotFound {
                item_id,
                user_id: Some(user_id.to_string()),
            })?;

        let external_stock_id = reservation.external_stock_id.clone().ok_or(
            SyncError::InventoryItemMissingExternalId { item_id },
        )?;

        if reservation.quantity_before < req {
            let fresh_quantity = self
                .best_effort_refresh_from_remote(user_id, item_id, &external_stock_id)
                .await
                .unwrap_or(reservation.quantity_before);
            return Err(SyncError::Validation {
                detail: format!("insufficient local quantity: available {fresh_quantity}"),
                field: Some("quantity".into()),
            });
        }

        // Step 2: Decide & apply remotely, outside any local transaction.
        let settings = self
            .repo
            .get_settings(user_id)
            .await
            .map_err(|e| SyncError::Database {
                operation: "get_settings".into(),
                detail: e.to_string(),
            })?
            .ok_or(SyncError::SyncNotFound {
                user_id: user_id.to_string(),
            })?;
        let token = self.cipher.decrypt(&settings.token_encrypted)?;

        let remote = self
            .marketplace
            .get_product(user_id, &token, &external_stock_id)
            .await?
            .ok_or(SyncError::InventoryItemNotFound {
                item_id,
                user_id: Some(user_id.to_string()),
            })?;
        let remote_quantity = remote.get("quantity").and_then(Value::as_i64).unwrap_or(0);

        if remote_quantity < req {
            self.repo
                .refresh_quantity(item_id, remote_quantity)
                .await
                .map_err(|e| SyncError::Database {
                    operation: "refresh_quantity".into(),
                    detail: e.to_string(),
                })?;
            return Err(SyncError::Validation {
                detail: format!("insufficient remote quantity: available {remote_quantity}"),
                field: Some("quantity".into()),
            });
        }

        let remote_after = remote_quantity - req;
        let deleted_remotely = remote_after <= 0;
        if deleted_remotely {
            self.marketplace
                .delete(user_id, &token, &external_stock_id)
                .await?;
        } else {
            self.marketplace
                .increment(user_id, &token, &external_stock_id, -req)
                .await?;
        }

        // Step 3: Commit locally.
        match self
            .repo
            .purchase_commit(item_id, reservation.quantity_before, req)
            .await
        {
            Ok(()) => Ok(PurchaseOutcome {
                quantity_after: reservation.quantity_before - req,
            }),
            Err(commit_err) => {
                // Step 4: Compensate. Best-effort, never retried (§7).
                if deleted_remotely {
                    tracing::error!(
                        %user_id, item_id, external_stock_id,
                        "purchase commit failed after remote product was deleted; irrecoverable divergence, needs human reconciliation"
                    );
                } else if let Err(compensate_err) = self
                    .marketplace
                    .increment(user_id, &token, &external_stock_id, req)
                    .await
                {
                    tracing::error!(
                        %user_id, item_id, error = %compensate_err,
                        "purchase compensation failed; remote quantity is now divergent from local"
                    );
                }
                Err(SyncError::Database {
                    operation: "purchase_commit".into(),
                    detail: commit_err.to_string(),
                })
            }
        }
    }

    /// Refreshes the local row from the remote quantity and returns that
    /// fresh value, so the caller can report it instead of a stale one.
    async fn best_effort_refresh_from_remote(
        &self,
        user_id: Uuid,
        item_id: i64,
        external_stock_id: &str,
    ) -> Option<i64> {
        let settings = self.repo.get_settings(user_id).await.ok().flatten()?;
        let token = self.cipher.decrypt(&settings.token_encrypted).ok()?;
        let remote = self
            .marketplace
            .get_product(user_id, &token, external_stock_id)
            .await
            .ok()
            .flatten()?;
        let q = remote.get("quantity").and_then(Value::as_i64)?;
        self.repo.refresh_quantity(item_id, q).await.ok()?;
        Some(q)
    }

    async fn get_owned_item(&self, user_id: Uuid, item_id: i64) -> Result<InventoryItem, SyncError> {
        let item = self
            .repo
            .get_item(item_id)
            .await
            .map_err(|e| SyncError::Database {
                operation: "get_item".into(),
                detail: e.to_string(),
            })?
            .ok_or(SyncError::InventoryItemNotFound {
                item_id,
                user_id: Some(user_id.to_string()),
            })?;

        if item.user_id != user_id {
            return Err(SyncError::InventoryItemNotFound {
                item_id,
                user_id: Some(user_id.to_string()),
            });
        }
        Ok(item)
    }
}

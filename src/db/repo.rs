//! Repository layer for the three §3 entities: raw SQL over
//! `sqlx::AnyPool`, explicit row-mapping functions, and CAS-style
//! single-statement updates wherever a concurrent actor could otherwise
//! race a read-modify-write.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::model::{
    InventoryItem, Operation, OperationStatus, OperationType, SyncSettings, SyncStatus,
};

#[derive(Clone, Debug)]
pub struct NewInventoryItem {
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

/// Outcome of §4.G step 1 (the "Reserve" half of the purchase saga).
#[derive(Clone, Debug)]
pub struct PurchaseReservation {
    pub quantity_before: i64,
    pub external_stock_id: Option<String>,
}

#[async_trait]
pub trait SyncRepository: Send + Sync {
    // --- SyncSettings ---
    async fn get_settings(&self, user_id: Uuid) -> Result<Option<SyncSettings>>;
    async fn upsert_token(&self, user_id: Uuid, token_encrypted: &str) -> Result<()>;
    async fn set_webhook_secret(&self, user_id: Uuid, secret: &str) -> Result<()>;
    /// Atomically transitions IDLE/ACTIVE/ERROR -> INITIAL_SYNC. Returns
    /// `false` (no row changed) if a sync is already in progress, unless
    /// `force` is set.
    async fn try_begin_initial_sync(&self, user_id: Uuid, force: bool) -> Result<bool>;
    async fn finish_sync_active(&self, user_id: Uuid, last_sync_at: DateTime<Utc>) -> Result<()>;
    async fn finish_sync_error(&self, user_id: Uuid, last_error: &str) -> Result<()>;

    // --- InventoryItem ---
    async fn get_item(&self, id: i64) -> Result<Option<InventoryItem>>;
    async fn find_by_external_stock_id(
        &self,
        user_id: Uuid,
        external_stock_id: &str,
    ) -> Result<Option<InventoryItem>>;
    /// Batched existence probe keyed by `(blueprint_id, external_stock_id)`,
    /// used by the bulk-sync engine's chunk processing (§4.F step 4).
    async fn find_existing_for_chunk(
        &self,
        user_id: Uuid,
        keys: &[(i64, Option<String>)],
    ) -> Result<HashMap<(i64, Option<String>), InventoryItem>>;
    async fn bulk_insert(&self, items: &[NewInventoryItem]) -> Result<u64>;
    /// Per-row UPDATE of quantity/price/properties, keyed by local id.
    async fn bulk_update(&self, items: &[(i64, NewInventoryItem)]) -> Result<u64>;
    async fn update_item_full(&self, item: &InventoryItem) -> Result<()>;
    async fn delete_item(&self, id: i64) -> Result<()>;
    /// Atomic `quantity = max(0, quantity + delta)`, returns the row after
    /// the change. Used by the webhook processor and periodic drift sync so
    /// no caller ever reads-then-writes quantity.
    async fn adjust_quantity(&self, id: i64, delta: i64) -> Result<Option<InventoryItem>>;

    /// §4.G step 1: lock the row, read `quantity_before`, release the lock
    /// on commit without mutating. Requires the Postgres backend for a real
    /// row lock (see DESIGN.md); against SQLite this degrades to a plain
    /// read within a transaction.
    async fn purchase_reserve(
        &self,
        user_id: Uuid,
        item_id: i64,
    ) -> Result<Option<PurchaseReservation>>;
    /// §4.G step 3: new transaction, unconditional
    /// `quantity = quantity_before - req`, matching the source's own
    /// "trust the captured quantity_before" semantics (§5 ordering
    /// guarantees: the saga tolerates interleaving between steps).
    async fn purchase_commit(&self, item_id: i64, quantity_before: i64, req: i64) -> Result<()>;
    /// Used by both of §4.G's "insufficient quantity" error paths to
    /// refresh the local row to a freshly observed value.
    async fn refresh_quantity(&self, item_id: i64, new_quantity: i64) -> Result<()>;

    // --- Operation journal (component K) ---
    async fn register_pending(
        &self,
        operation_id: Uuid,
        user_id: Uuid,
        operation_type: OperationType,
    ) -> Result<()>;
    async fn get_operation(&self, operation_id: Uuid) -> Result<Option<Operation>>;
    async fn update_metadata(&self, operation_id: Uuid, metadata: Value) -> Result<()>;
    async fn complete_operation(&self, operation_id: Uuid) -> Result<()>;
    async fn fail_operation(&self, operation_id: Uuid, error_metadata: Value) -> Result<()>;
}

pub struct SqlxSyncRepository {
    pool: Arc<AnyPool>,
}

impl SqlxSyncRepository {
    pub fn new(pool: Arc<AnyPool>) -> Self {
        Self { pool }
    }
}

fn row_to_settings(row: &sqlx::any::AnyRow) -> Result<SyncSettings> {
    let user_id: String = row.try_get("user_id")?;
    let status: String = row.try_get("sync_status")?;
    Ok(SyncSettings {
        user_id: Uuid::parse_str(&user_id).context("bad user_id in sync_settings")?,
        token_encrypted: row.try_get("token_encrypted")?,
        webhook_secret: row.try_get("webhook_secret")?,
        sync_status: SyncStatus::parse(&status).context("bad sync_status")?,
        last_sync_at: row
            .try_get::<Option<String>, _>("last_sync_at")?
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .context("bad last_sync_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn row_to_item(row: &sqlx::any::AnyRow) -> Result<InventoryItem> {
    let user_id: String = row.try_get("user_id")?;
    let properties: Option<String> = row.try_get("properties")?;
    Ok(InventoryItem {
        id: row.try_get("id")?,
        user_id: Uuid::parse_str(&user_id).context("bad user_id in inventory_items")?,
        blueprint_id: row.try_get("blueprint_id")?,
        external_stock_id: row.try_get("external_stock_id")?,
        quantity: row.try_get("quantity")?,
        price_cents: row.try_get("price_cents")?,
        description: row.try_get("description")?,
        user_data_field: row.try_get("user_data_field")?,
        graded: row.try_get("graded")?,
        properties: properties
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .context("bad properties json")?,
    })
}

fn row_to_operation(row: &sqlx::any::AnyRow) -> Result<Operation> {
    let operation_id: String = row.try_get("operation_id")?;
    let user_id: String = row.try_get("user_id")?;
    let op_type: String = row.try_get("operation_type")?;
    let status: String = row.try_get("status")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let created_at: String = row.try_get("created_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    let operation_type = match op_type.as_str() {
        "bulk_sync" => OperationType::BulkSync,
        "sync_update" => OperationType::SyncUpdate,
        "sync_delete" => OperationType::SyncDelete,
        "webhook" => OperationType::Webhook,
        "periodic" => OperationType::Periodic,
        other => anyhow::bail!("unknown operation_type {other}"),
    };
    let status = match status.as_str() {
        "pending" => OperationStatus::Pending,
        "completed" => OperationStatus::Completed,
        "failed" => OperationStatus::Failed,
        other => anyhow::bail!("unknown operation status {other}"),
    };

    Ok(Operation {
        operation_id: Uuid::parse_str(&operation_id)?,
        user_id: Uuid::parse_str(&user_id)?,
        operation_type,
        status,
        metadata: metadata.map(|s| serde_json::from_str(&s)).transpose()?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        completed_at: completed_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()?,
    })
}

#[async_trait]
impl SyncRepository for SqlxSyncRepository {
    async fn get_settings(&self, user_id: Uuid) -> Result<Option<SyncSettings>> {
        let row = sqlx::query("SELECT * FROM sync_settings WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&*self.pool)
            .await?;
        row.as_ref().map(row_to_settings).transpose()
    }

    async fn upsert_token(&self, user_id: Uuid, token_encrypted: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO sync_settings (user_id, token_encrypted, sync_status)
               VALUES (?, ?, 'idle')
               ON CONFLICT (user_id) DO UPDATE SET token_encrypted = excluded.token_encrypted"#,
        )
        .bind(user_id.to_string())
        .bind(token_encrypted)
        .execute(&*self.pool)
        .await
        .context("upsert_token")?;
        Ok(())
    }

    async fn set_webhook_secret(&self, user_id: Uuid, secret: &str) -> Result<()> {
        sqlx::query("UPDATE sync_settings SET webhook_secret = ? WHERE user_id = ?")
            .bind(secret)
            .bind(user_id.to_string())
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn try_begin_initial_sync(&self, user_id: Uuid, force: bool) -> Result<bool> {
        let query = if force {
            "UPDATE sync_settings SET sync_status = 'initial_sync' WHERE user_id = ?"
        } else {
            "UPDATE sync_settings SET sync_status = 'initial_sync' \
             WHERE user_id = ? AND sync_status != 'initial_sync'"
        };
        let res = sqlx::query(query)
            .bind(user_id.to_string())
            .execute(&*self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn finish_sync_active(&self, user_id: Uuid, last_sync_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE sync_settings SET sync_status = 'active', last_sync_at = ?, last_error = NULL \
             WHERE user_id = ?",
        )
        .bind(last_sync_at.to_rfc3339())
        .bind(user_id.to_string())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn finish_sync_error(&self, user_id: Uuid, last_error: &str) -> Result<()> {
        sqlx::query("UPDATE sync_settings SET sync_status = 'error', last_error = ? WHERE user_id = ?")
            .bind(last_error)
            .bind(user_id.to_string())
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn get_item(&self, id: i64) -> Result<Option<InventoryItem>> {
        let row = sqlx::query("SELECT * FROM inventory_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn find_by_external_stock_id(
        &self,
        user_id: Uuid,
        external_stock_id: &str,
    ) -> Result<Option<InventoryItem>> {
        let row = sqlx::query(
            "SELECT * FROM inventory_items WHERE user_id = ? AND external_stock_id = ?",
        )
        .bind(user_id.to_string())
        .bind(external_stock_id)
        .fetch_optional(&*self.pool)
        .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn find_existing_for_chunk(
        &self,
        user_id: Uuid,
        keys: &[(i64, Option<String>)],
    ) -> Result<HashMap<(i64, Option<String>), InventoryItem>> {
        // One SELECT for the whole chunk rather than per-row lookups,
        // matching §4.F step 4's "single SELECT of existing items".
        let mut out = HashMap::new();
        if keys.is_empty() {
            return Ok(out);
        }

        let rows = sqlx::query("SELECT * FROM inventory_items WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_all(&*self.pool)
            .await?;

        let wanted: std::collections::HashSet<&(i64, Option<String>)> = keys.iter().collect();
        for row in &rows {
            let item = row_to_item(row)?;
            let key = (item.blueprint_id, item.external_stock_id.clone());
            if wanted.contains(&key) {
                out.insert(key, item);
            }
        }
        Ok(out)
    }

    async fn bulk_insert(&self, items: &[NewInventoryItem]) -> Result<u64> {
        let mut inserted = 0u64;
        for it in items {
            let props = it
                .properties
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let res = sqlx::query(
                r#"INSERT INTO inventory_items
                   (user_id, blueprint_id, external_stock_id, quantity, price_cents,
                    description, user_data_field, graded, properties)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (user_id, blueprint_id, external_stock_id) DO NOTHING"#,
            )
            .bind(it.user_id.to_string())
            .bind(it.blueprint_id)
            .bind(it.external_stock_id.clone())
            .bind(it.quantity)
            .bind(it.price_cents)
            .bind(it.description.clone())
            .bind(it.user_data_field.clone())
            .bind(it.graded)
            .bind(props.clone())
            .execute(&*self.pool)
            .await
            .context("bulk_insert row")?;

            if res.rows_affected() == 1 {
                inserted += 1;
                continue;
            }

            // Lost the uniqueness race to a row inserted by a concurrent
            // chunk for the same (user_id, blueprint_id, external_stock_id):
            // fold this item's values into the row that won instead of
            // failing the whole chunk.
            sqlx::query(
                r#"UPDATE inventory_items SET
                     quantity = ?, price_cents = ?, description = ?,
                     user_data_field = ?, graded = ?, properties = ?
                   WHERE user_id = ? AND blueprint_id = ?
                     AND (external_stock_id = ? OR (external_stock_id IS NULL AND ? IS NULL))"#,
            )
            .bind(it.quantity)
            .bind(it.price_cents)
            .bind(it.description.clone())
            .bind(it.user_data_field.clone())
            .bind(it.graded)
            .bind(props)
            .bind(it.user_id.to_string())
            .bind(it.blueprint_id)
            .bind(it.external_stock_id.clone())
            .bind(it.external_stock_id.clone())
            .execute(&*self.pool)
            .await
            .context("bulk_insert row: resolve conflict via update")?;
        }
        Ok(inserted)
    }

    async fn bulk_update(&self, items: &[(i64, NewInventoryItem)]) -> Result<u64> {
        let mut updated = 0u64;
        for (id, it) in items {
            let props = it
                .properties
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let res = sqlx::query(
                r#"UPDATE inventory_items SET
                     quantity = ?, price_cents = ?, description = ?,
                     user_data_field = ?, graded = ?, properties = ?
                   WHERE id = ?"#,
            )
            .bind(it.quantity)
            .bind(it.price_cents)
            .bind(it.description.clone())
            .bind(it.user_data_field.clone())
            .bind(it.graded)
            .bind(props)
            .bind(id)
            .execute(&*self.pool)
            .await
            .context("bulk_update row")?;
            updated += res.rows_affected();
        }
        Ok(updated)
    }

    async fn update_item_full(&self, item: &InventoryItem) -> Result<()> {
        let props = item
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"UPDATE inventory_items SET
                 quantity = ?, price_cents = ?, description = ?,
                 user_data_field = ?, graded = ?, properties = ?, external_stock_id = ?
               WHERE id = ?"#,
        )
        .bind(item.quantity)
        .bind(item.price_cents)
        .bind(item.description.clone())
        .bind(item.user_data_field.clone())
        .bind(item.graded)
        .bind(props)
        .bind(item.external_stock_id.clone())
        .bind(item.id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn delete_item(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM inventory_items WHERE id = ?")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn adjust_quantity(&self, id: i64, delta: i64) -> Result<Option<InventoryItem>> {
        sqlx::query("UPDATE inventory_items SET quantity = MAX(0, quantity + ?) WHERE id = ?")
            .bind(delta)
            .bind(id)
            .execute(&*self.pool)
            .await
            .context("adjust_quantity")?;
        self.get_item(id).await
    }

    async fn purchase_reserve(
        &self,
        user_id: Uuid,
        item_id: i64,
    ) -> Result<Option<PurchaseReservation>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT quantity, external_stock_id FROM inventory_items \
             WHERE id = ? AND user_id = ? FOR UPDATE",
        )
        .bind(item_id)
        .bind(user_id.to_string())
        .fetch_optional(&mut *tx)
        .await;

        // SQLite (dev fallback, see config.rs) doesn't understand FOR
        // UPDATE; fall back to a plain read so local development still
        // works. Production targets Postgres, where the lock is real.
        let row = match row {
            Ok(r) => r,
            Err(_) => {
                sqlx::query("SELECT quantity, external_stock_id FROM inventory_items WHERE id = ? AND user_id = ?")
                    .bind(item_id)
                    .bind(user_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?
            }
        };

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let quantity_before: i64 = row.try_get("quantity")?;
        let external_stock_id: Option<String> = row.try_get("external_stock_id")?;

        // No mutation in this step: commit releases the lock immediately.
        tx.commit().await?;

        Ok(Some(PurchaseReservation {
            quantity_before,
            external_stock_id,
        }))
    }

    async fn purchase_commit(&self, item_id: i64, quantity_before: i64, req: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE inventory_items SET quantity = ? WHERE id = ?")
            .bind(quantity_before - req)
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .context("purchase_commit")?;
        tx.commit().await?;
        Ok(())
    }

    async fn refresh_quantity(&self, item_id: i64, new_quantity: i64) -> Result<()> {
        sqlx::query("UPDATE inventory_items SET quantity = ? WHERE id = ?")
            .bind(new_quantity)
            .bind(item_id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn register_pending(
        &self,
        operation_id: Uuid,
        user_id: Uuid,
        operation_type: OperationType,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO operations (operation_id, user_id, operation_type, status, created_at)
               VALUES (?, ?, ?, 'pending', ?)
               ON CONFLICT (operation_id) DO NOTHING"#,
        )
        .bind(operation_id.to_string())
        .bind(user_id.to_string())
        .bind(operation_type.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&*self.pool)
        .await
        .context("register_pending")?;
        Ok(())
    }

    async fn get_operation(&self, operation_id: Uuid) -> Result<Option<Operation>> {
        let row = sqlx::query("SELECT * FROM operations WHERE operation_id = ?")
            .bind(operation_id.to_string())
            .fetch_optional(&*self.pool)
            .await?;
        row.as_ref().map(row_to_operation).transpose()
    }

    async fn update_metadata(&self, operation_id: Uuid, metadata: Value) -> Result<()> {
        sqlx::query("UPDATE operations SET metadata = ? WHERE operation_id = ?")
            .bind(serde_json::to_string(&metadata)?)
            .bind(operation_id.to_string())
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn complete_operation(&self, operation_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE operations SET status = 'completed', completed_at = ? WHERE operation_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(operation_id.to_string())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn fail_operation(&self, operation_id: Uuid, error_metadata: Value) -> Result<()> {
        sqlx::query(
            "UPDATE operations SET status = 'failed', completed_at = ?, metadata = ? \
             WHERE operation_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(serde_json::to_string(&error_metadata)?)
        .bind(operation_id.to_string())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}

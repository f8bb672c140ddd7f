//! §4.B blueprint mapper: batched, TTL-cached resolution of
//! `marketplace_blueprint_id -> (local_print_id, catalog_table)`.
//!
//! The catalog query itself is explicitly out of scope (§1: "Blueprint
//! lookup against a read-only catalog store is treated as an external
//! cached lookup function") — this module owns only the cache and the
//! batching discipline; the actual lookup is a `CatalogLookup` trait
//! object the caller supplies, the same external-collaborator seam the
//! teacher uses for `Arc<dyn SwapExecutor>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{AnyPool, Row};

use crate::time::now_secs;

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// Resolves as many of `blueprint_ids` as the catalog recognizes.
    /// Unresolvable ids are simply absent from the returned map.
    async fn resolve_batch(
        &self,
        blueprint_ids: &[i64],
    ) -> anyhow::Result<HashMap<i64, (i64, String)>>;
}

#[derive(Clone)]
pub struct BlueprintMapper {
    pool: Arc<AnyPool>,
    catalog: Arc<dyn CatalogLookup>,
    ttl_secs: i64,
}

impl BlueprintMapper {
    pub fn new(pool: Arc<AnyPool>, catalog: Arc<dyn CatalogLookup>, ttl_secs: i64) -> Self {
        Self {
            pool,
            catalog,
            ttl_secs,
        }
    }

    /// Batched resolution used by the bulk-sync engine (§4.F step 4): reads
    /// whatever unexpired entries the cache already holds, falls back to
    /// `CatalogLookup` for the rest, and repopulates the cache.
    pub async fn resolve_batch(
        &self,
        blueprint_ids: &[i64],
    ) -> anyhow::Result<HashMap<i64, (i64, String)>> {
        if blueprint_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let now = now_secs();
        let mut resolved = HashMap::new();
        let mut misses = Vec::new();

        for &id in blueprint_ids {
            let row = sqlx::query(
                "SELECT local_print_id, catalog_table FROM blueprint_mapping_cache \
                 WHERE blueprint_id = ? AND expires_at > ?",
            )
            .bind(id)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await?;

            match row {
                Some(r) => {
                    let local_print_id: i64 = r.try_get("local_print_id")?;
                    let catalog_table: String = r.try_get("catalog_table")?;
                    resolved.insert(id, (local_print_id, catalog_table));
                }
                None => misses.push(id),
            }
        }

        if !misses.is_empty() {
            let fetched = self.catalog.resolve_batch(&misses).await?;
            let expires_at = now + self.ttl_secs;
            for (&id, (local_print_id, catalog_table)) in &fetched {
                sqlx::query(
                    r#"INSERT INTO blueprint_mapping_cache (blueprint_id, local_print_id, catalog_table, expires_at)
                       VALUES (?, ?, ?, ?)
                       ON CONFLICT (blueprint_id) DO UPDATE SET
                         local_print_id = excluded.local_print_id,
                         catalog_table = excluded.catalog_table,
                         expires_at = excluded.expires_at"#,
                )
                .bind(id)
                .bind(local_print_id)
                .bind(catalog_table)
                .bind(expires_at)
                .execute(&*self.pool)
                .await?;
            }
            resolved.extend(fetched);
        }

        Ok(resolved)
    }

    /// The periodic drift sync path (§9's open question: "the source's
    /// periodic-drift path calls a blueprint-mapping method that doesn't
    /// appear on the mapper in that form") — this is the same operation as
    /// `resolve_batch`, singular, named for call-site clarity in `sync::drift`.
    pub async fn resolve_local_id(&self, blueprint_id: i64) -> anyhow::Result<Option<(i64, String)>> {
        let mut map = self.resolve_batch(&[blueprint_id]).await?;
        Ok(map.remove(&blueprint_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::any::AnyPoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCatalog {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogLookup for CountingCatalog {
        async fn resolve_batch(
            &self,
            blueprint_ids: &[i64],
        ) -> anyhow::Result<HashMap<i64, (i64, String)>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(blueprint_ids
                .iter()
                .map(|&id| (id, (id * 10, "prints".to_string())))
                .collect())
        }
    }

    async fn test_mapper() -> (BlueprintMapper, Arc<CountingCatalog>) {
        sqlx::any::install_default_drivers();
        let pool = Arc::new(
            AnyPoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap(),
        );
        crate::db::schema::migrate(&pool).await.unwrap();
        let catalog = Arc::new(CountingCatalog {
            calls: AtomicUsize::new(0),
        });
        (
            BlueprintMapper::new(pool, catalog.clone(), 86_400),
            catalog,
        )
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let (mapper, catalog) = test_mapper().await;
        let first = mapper.resolve_batch(&[1, 2, 3]).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);

        let second = mapper.resolve_batch(&[1, 2, 3]).await.unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1, "cached entries should not re-invoke the catalog");
    }

    #[tokio::test]
    async fn partial_cache_hit_only_looks_up_misses() {
        let (mapper, catalog) = test_mapper().await;
        mapper.resolve_batch(&[1]).await.unwrap();
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);

        let result = mapper.resolve_batch(&[1, 2]).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resolve_local_id_matches_batch_semantics() {
        let (mapper, _catalog) = test_mapper().await;
        let result = mapper.resolve_local_id(42).await.unwrap();
        assert_eq!(result, Some((420, "prints".to_string())));
    }
}

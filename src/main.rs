use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::AnyPool;

use brx_sync::config::AppConfig;
use brx_sync::crypto::{AesGcmCipher, TokenCipher};
use brx_sync::db::Db;
use brx_sync::db::repo::{SqlxSyncRepository, SyncRepository};
use brx_sync::journal::OperationJournal;
use brx_sync::kv::{AdaptiveRateLimiter, BlueprintMapper, CatalogLookup, CircuitBreaker};
use brx_sync::logger::init_tracing;
use brx_sync::marketplace::MarketplaceClient;
use brx_sync::model::OperationType;
use brx_sync::queue::handlers::{
    BulkSyncHandler, PeriodicDriftHandler, SyncDeleteHandler, SyncUpdateHandler, WebhookHandler,
};
use brx_sync::queue::{Dispatcher, Lane, TaskHandler, Worker};
use brx_sync::reconciler::Reconciler;
use brx_sync::sync::{BulkSyncEngine, DriftSyncEngine};
use brx_sync::webhook::WebhookProcessor;

/// The catalog query against the read-only print database is explicitly
/// out of scope (§1). This stub lets the crate wire up end-to-end; a real
/// deployment supplies its own `CatalogLookup` backed by that store.
struct UnimplementedCatalogLookup;

#[async_trait]
impl CatalogLookup for UnimplementedCatalogLookup {
    async fn resolve_batch(
        &self,
        _blueprint_ids: &[i64],
    ) -> anyhow::Result<HashMap<i64, (i64, String)>> {
        Ok(HashMap::new())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);
    tracing::info!("starting inventory sync service");

    let cfg = AppConfig::from_env();

    let db = Db::connect(&cfg.database_url).await?;
    db.migrate().await?;
    let fallback_db = Db::connect_fallback(&cfg.database_url).await?;

    let repo: Arc<dyn SyncRepository> = Arc::new(SqlxSyncRepository::new(db.pool.clone()));
    let fallback_repo: Arc<dyn SyncRepository> =
        Arc::new(SqlxSyncRepository::new(fallback_db.pool.clone()));
    let cipher: Arc<dyn TokenCipher> = Arc::new(AesGcmCipher::from_env()?);

    let limiter = AdaptiveRateLimiter::new(
        db.pool.clone(),
        cfg.rate_limiter_base_capacity,
        cfg.rate_limiter_window_secs,
        cfg.rate_limiter_min_factor,
        cfg.rate_limiter_max_factor,
        cfg.rate_limiter_reduction_factor,
        cfg.rate_limiter_increase_factor,
        cfg.rate_limiter_quiet_window_secs,
    );
    let breaker = CircuitBreaker::new(
        db.pool.clone(),
        cfg.breaker_failure_threshold,
        cfg.breaker_success_threshold,
        cfg.breaker_timeout_secs,
    );
    let marketplace = MarketplaceClient::new(
        cfg.marketplace_base_url.clone(),
        cfg.marketplace_request_timeout_secs,
        cfg.marketplace_export_timeout_secs,
        cfg.marketplace_max_429_retries,
        limiter,
        breaker,
    )?;

    let catalog: Arc<dyn CatalogLookup> = Arc::new(UnimplementedCatalogLookup);
    let blueprint_mapper = Arc::new(BlueprintMapper::new(
        db.pool.clone(),
        catalog,
        cfg.blueprint_cache_ttl_secs,
    ));

    let journal = OperationJournal::new(repo.clone());
    let dispatcher = Dispatcher::new(db.pool.clone(), journal.clone());

    // Constructed so the (out-of-scope) HTTP surface can call into it
    // directly; this binary only runs the background queue workers.
    let _reconciler = Arc::new(Reconciler::new(
        repo.clone(),
        marketplace.clone(),
        dispatcher.clone(),
        cipher.clone(),
    ));

    let bulk_engine = Arc::new(BulkSyncEngine::new(
        repo.clone(),
        fallback_repo,
        marketplace.clone(),
        blueprint_mapper.clone(),
        journal.clone(),
        cipher.clone(),
        cfg.bulk_chunk_size,
        cfg.bulk_parallel_chunks,
        cfg.blueprint_deny_listed_tables.clone(),
    ));
    let drift_engine = Arc::new(DriftSyncEngine::new(
        repo.clone(),
        marketplace.clone(),
        blueprint_mapper,
        journal.clone(),
        cipher.clone(),
        cfg.blueprint_deny_listed_tables.clone(),
    ));
    let webhook_processor = Arc::new(WebhookProcessor::new(repo.clone(), dispatcher));

    let hard_limit = Duration::from_secs(cfg.queue_hard_task_limit_secs);
    let soft_limit = Duration::from_secs(cfg.queue_soft_task_limit_secs);

    spawn_lane_worker(
        db.pool.clone(),
        Lane::HighPriority,
        journal.clone(),
        hard_limit,
        soft_limit,
        cfg.queue_backoff_cap_secs,
        vec![
            (
                OperationType::SyncUpdate,
                Arc::new(SyncUpdateHandler {
                    repo: repo.clone(),
                    marketplace: marketplace.clone(),
                    cipher: cipher.clone(),
                }) as Arc<dyn TaskHandler>,
            ),
            (
                OperationType::SyncDelete,
                Arc::new(SyncDeleteHandler {
                    repo: repo.clone(),
                    marketplace: marketplace.clone(),
                    cipher: cipher.clone(),
                }),
            ),
            (
                OperationType::Webhook,
                Arc::new(WebhookHandler {
                    processor: webhook_processor,
                }),
            ),
        ],
    );

    spawn_lane_worker(
        db.pool.clone(),
        Lane::BulkSync,
        journal.clone(),
        hard_limit,
        soft_limit,
        cfg.queue_backoff_cap_secs,
        vec![(
            OperationType::BulkSync,
            Arc::new(BulkSyncHandler { engine: bulk_engine }),
        )],
    );

    spawn_lane_worker(
        db.pool.clone(),
        Lane::Default,
        journal,
        hard_limit,
        soft_limit,
        cfg.queue_backoff_cap_secs,
        vec![(
            OperationType::Periodic,
            Arc::new(PeriodicDriftHandler { engine: drift_engine }),
        )],
    );

    tracing::info!("queue workers started; waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    Ok(())
}

fn spawn_lane_worker(
    pool: Arc<AnyPool>,
    lane: Lane,
    journal: OperationJournal,
    hard_limit: Duration,
    soft_limit: Duration,
    backoff_cap_secs: u64,
    handlers: Vec<(OperationType, Arc<dyn TaskHandler>)>,
) {
    let mut worker = Worker::new(pool, lane, journal, hard_limit, soft_limit, backoff_cap_secs);
    for (operation_type, handler) in handlers {
        worker.register_handler(operation_type, handler);
    }
    tokio::spawn(worker.run());
}

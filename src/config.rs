#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string. Backs both the relational entities of
    /// §3 and the atomic shared-state tables of §4.C/D/B (see `src/kv`).
    pub database_url: String,

    // =========================
    // Adaptive rate limiter (4.C)
    // =========================
    /// Base per-user token bucket capacity `B`, refilled each window.
    pub rate_limiter_base_capacity: u32,
    /// Refill window in seconds `W`.
    pub rate_limiter_window_secs: i64,
    /// Lower bound of the adaptive factor `f(user)`.
    pub rate_limiter_min_factor: f64,
    /// Upper bound of the adaptive factor `f(user)`.
    pub rate_limiter_max_factor: f64,
    /// Multiplier applied to `f` on a 429 (`f <- max(min_factor, f * reduction)`).
    pub rate_limiter_reduction_factor: f64,
    /// Multiplier applied to `f` on sustained success.
    pub rate_limiter_increase_factor: f64,
    /// Window (seconds) during which a recent 429 suppresses growth.
    pub rate_limiter_quiet_window_secs: i64,

    // =========================
    // Circuit breaker (4.D)
    // =========================
    /// Consecutive failures (rate_limit or generic) before CLOSED -> OPEN.
    pub breaker_failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN before HALF_OPEN -> CLOSED.
    pub breaker_success_threshold: u32,
    /// Seconds an OPEN breaker waits before admitting a HALF_OPEN probe.
    pub breaker_timeout_secs: i64,

    // =========================
    // Marketplace client (4.E)
    // =========================
    pub marketplace_base_url: String,
    /// Connect/request timeout for most calls.
    pub marketplace_request_timeout_secs: u64,
    /// Timeout for the large, slow products_export call.
    pub marketplace_export_timeout_secs: u64,
    /// Max in-process retries on 429 before surfacing RATE_LIMIT_EXCEEDED.
    pub marketplace_max_429_retries: u32,

    // =========================
    // Bulk-sync engine (4.F)
    // =========================
    /// Products per chunk (spec default 5000).
    pub bulk_chunk_size: usize,
    /// Chunks processed concurrently (spec default 3).
    pub bulk_parallel_chunks: usize,

    // =========================
    // Blueprint mapper (4.B)
    // =========================
    /// TTL, in seconds, for cached blueprint_id -> (local_print_id, table) entries.
    pub blueprint_cache_ttl_secs: i64,
    /// Catalog tables the bulk-sync engine refuses to ingest products into
    /// (§4.F step 4: "drop products whose resolved catalog table is on the
    /// deny-list").
    pub blueprint_deny_listed_tables: Vec<String>,

    // =========================
    // Job queue adapter (4.J)
    // =========================
    pub queue_hard_task_limit_secs: u64,
    pub queue_soft_task_limit_secs: u64,
    /// Cap applied to the `min(300, 2^attempt)` backoff formula.
    pub queue_backoff_cap_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://brx_sync_dev.db".to_string());

        let marketplace_base_url = std::env::var("MARKETPLACE_BASE_URL")
            .unwrap_or_else(|_| "https://api.cardtrader.com/api/v2".to_string());

        Self {
            database_url,

            rate_limiter_base_capacity: 200,
            rate_limiter_window_secs: 10,
            rate_limiter_min_factor: 0.5,
            rate_limiter_max_factor: 1.5,
            rate_limiter_reduction_factor: 0.9,
            rate_limiter_increase_factor: 1.01,
            rate_limiter_quiet_window_secs: 300,

            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_timeout_secs: 60,

            marketplace_base_url,
            marketplace_request_timeout_secs: 30,
            marketplace_export_timeout_secs: 180,
            marketplace_max_429_retries: 3,

            bulk_chunk_size: 5_000,
            bulk_parallel_chunks: 3,

            blueprint_cache_ttl_secs: 86_400,
            blueprint_deny_listed_tables: vec!["memorabilia".to_string(), "sealed_product".to_string()],

            queue_hard_task_limit_secs: 30 * 60,
            queue_soft_task_limit_secs: 25 * 60,
            queue_backoff_cap_secs: 300,
        }
    }
}

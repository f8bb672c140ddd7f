use sqlx::AnyPool;

/// Creates every table this crate owns. Idempotent, run on startup via
/// `CREATE TABLE IF NOT EXISTS`, no migration framework (schema-migration
/// tooling is explicitly out of scope, §1).
pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // --- §3 persistent entities ---

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS sync_settings (
  user_id TEXT PRIMARY KEY,
  token_encrypted TEXT NOT NULL,
  webhook_secret TEXT,
  sync_status TEXT NOT NULL,
  last_sync_at TEXT,
  last_error TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS inventory_items (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  blueprint_id BIGINT NOT NULL,
  external_stock_id TEXT,
  quantity BIGINT NOT NULL,
  price_cents BIGINT NOT NULL,
  description TEXT,
  user_data_field TEXT,
  graded BOOLEAN,
  properties TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    // Drives the chunk-wide existence probe in §4.F and enforces the
    // uniqueness invariant from §3.
    sqlx::query(
        r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_inventory_user_blueprint_stock
           ON inventory_items(user_id, blueprint_id, external_stock_id);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS operations (
  operation_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  operation_type TEXT NOT NULL,
  status TEXT NOT NULL,
  metadata TEXT,
  created_at TEXT NOT NULL,
  completed_at TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_operations_user ON operations(user_id);"#)
        .execute(pool)
        .await?;

    // --- §3 ephemeral KV-store state, realized as atomically-updated tables
    // (see SPEC_FULL.md's resolution of the "shared KV store" question) ---

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS rate_limit_buckets (
  user_id TEXT PRIMARY KEY,
  tokens BIGINT NOT NULL,
  refill_at BIGINT NOT NULL,
  adaptive_factor DOUBLE PRECISION NOT NULL,
  last_429_at BIGINT,
  total_429_count BIGINT NOT NULL DEFAULT 0,
  recent_429s TEXT NOT NULL DEFAULT '[]'
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS circuit_breaker_state (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  state TEXT NOT NULL,
  failure_count BIGINT NOT NULL,
  success_count BIGINT NOT NULL,
  opened_at BIGINT
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS blueprint_mapping_cache (
  blueprint_id BIGINT PRIMARY KEY,
  local_print_id BIGINT NOT NULL,
  catalog_table TEXT NOT NULL,
  expires_at BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // --- §4.J job queue adapter, durable via this table rather than an
    // external broker dependency ---

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS queue_tasks (
  task_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  lane TEXT NOT NULL,
  operation_type TEXT NOT NULL,
  payload TEXT,
  status TEXT NOT NULL,
  attempt BIGINT NOT NULL DEFAULT 0,
  available_at BIGINT NOT NULL,
  leased_until BIGINT,
  created_at BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_queue_tasks_poll
           ON queue_tasks(lane, status, available_at);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

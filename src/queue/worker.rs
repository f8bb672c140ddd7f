//! Dispatch half of component J: a polling worker per lane, ack-late
//! (a task stays `leased` until it finishes; a crash leaves it leasable
//! again once `leased_until` passes), exponential backoff with jitter, and
//! hard/soft wall-clock limits enforced with `tokio::time::timeout`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::journal::OperationJournal;
use crate::model::OperationType;
use crate::queue::types::{Lane, QueuedTask, max_retries};
use crate::time::now_secs;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &QueuedTask) -> anyhow::Result<()>;
}

pub struct Worker {
    pool: Arc<AnyPool>,
    lane: Lane,
    journal: OperationJournal,
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
    hard_limit: Duration,
    soft_limit: Duration,
    backoff_cap_secs: u64,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        pool: Arc<AnyPool>,
        lane: Lane,
        journal: OperationJournal,
        hard_limit: Duration,
        soft_limit: Duration,
        backoff_cap_secs: u64,
    ) -> Self {
        Self {
            pool,
            lane,
            journal,
            handlers: HashMap::new(),
            hard_limit,
            soft_limit,
            backoff_cap_secs,
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn register_handler(&mut self, operation_type: OperationType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(operation_type.as_str(), handler);
    }

    /// Runs forever, polling this lane. Intended to be spawned as a
    /// background task per lane by `main`.
    pub async fn run(self) {
        loop {
            match self.poll_once().await {
                Ok(true) => continue, // immediately look for more work
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    tracing::warn!(error = %e, lane = self.lane.as_str(), "queue poll failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Leases and runs at most one task. Returns `true` if a task was
    /// found (regardless of outcome), so `run` can tighten its poll loop.
    async fn poll_once(&self) -> anyhow::Result<bool> {
        let Some(task) = self.lease_one().await? else {
            return Ok(false);
        };

        let Some(handler) = self.handlers.get(task.operation_type.as_str()).cloned() else {
            tracing::error!(
                task_id = %task.task_id,
                operation_type = task.operation_type.as_str(),
                "no handler registered for operation type"
            );
            return Ok(true);
        };

        let outcome = crate::logger::warn_if_slow(
            "queue_task",
            self.soft_limit,
            tokio::time::timeout(self.hard_limit, handler.handle(&task)),
        )
        .await;

        match outcome {
            Ok(Ok(())) => self.finish_success(&task).await?,
            Ok(Err(e)) => self.finish_failure(&task, &e.to_string()).await?,
            Err(_elapsed) => self.finish_failure(&task, "hard task limit exceeded").await?,
        }

        Ok(true)
    }

    async fn lease_one(&self) -> anyhow::Result<Option<QueuedTask>> {
        let now = now_secs();

        // Atomically claim the oldest eligible task in this lane. Portable
        // across Postgres and SQLite: no `FOR UPDATE SKIP LOCKED`, just a
        // single-statement conditional update keyed by primary key. A row
        // whose lease expired (worker crashed mid-task) is just as eligible
        // as a freshly queued one, so redelivery doesn't need a separate
        // sweeper.
        let candidate = sqlx::query(
            "SELECT task_id FROM queue_tasks \
             WHERE lane = ? AND ( \
               (status = 'queued' AND available_at <= ?) \
               OR (status = 'leased' AND leased_until <= ?) \
             ) \
             ORDER BY available_at ASC LIMIT 1",
        )
        .bind(self.lane.as_str())
        .bind(now)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        let Some(row) = candidate else {
            return Ok(None);
        };
        let task_id: String = row.try_get("task_id")?;

        let leased_until = now + self.hard_limit.as_secs() as i64;
        let res = sqlx::query(
            "UPDATE queue_tasks SET status = 'leased', leased_until = ?, attempt = attempt + 1 \
             WHERE task_id = ? AND ( \
               (status = 'queued' AND available_at <= ?) \
               OR (status = 'leased' AND leased_until <= ?) \
             )",
        )
        .bind(leased_until)
        .bind(&task_id)
        .bind(now)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        if res.rows_affected() != 1 {
            // Another worker won the race.
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM queue_tasks WHERE task_id = ?")
            .bind(&task_id)
            .fetch_one(&*self.pool)
            .await?;

        Ok(Some(row_to_task(&row)?))
    }

    async fn finish_success(&self, task: &QueuedTask) -> anyhow::Result<()> {
        sqlx::query("UPDATE queue_tasks SET status = 'done' WHERE task_id = ?")
            .bind(task.task_id.to_string())
            .execute(&*self.pool)
            .await?;
        self.journal.complete(task.task_id).await?;
        Ok(())
    }

    async fn finish_failure(&self, task: &QueuedTask, detail: &str) -> anyhow::Result<()> {
        let cap = max_retries(&task.operation_type);
        if task.attempt as u32 >= cap {
            sqlx::query("UPDATE queue_tasks SET status = 'failed' WHERE task_id = ?")
                .bind(task.task_id.to_string())
                .execute(&*self.pool)
                .await?;
            self.journal.fail(task.task_id, detail).await?;
            return Ok(());
        }

        let backoff_secs = backoff_with_jitter(task.attempt, self.backoff_cap_secs);
        let available_at = now_secs() + backoff_secs as i64;
        sqlx::query("UPDATE queue_tasks SET status = 'queued', available_at = ? WHERE task_id = ?")
            .bind(available_at)
            .bind(task.task_id.to_string())
            .execute(&*self.pool)
            .await?;
        Ok(())
    }
}

/// `min(cap, 2^attempt)` seconds plus `uniform(0,1)` jitter (§4.J).
fn backoff_with_jitter(attempt: i64, cap_secs: u64) -> f64 {
    let base = 2f64.powi(attempt.max(0) as i32).min(cap_secs as f64);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::any::AnyPoolOptions;

    use crate::db::repo::SqlxSyncRepository;

    async fn test_worker() -> (Worker, Arc<AnyPool>) {
        sqlx::any::install_default_drivers();
        let pool = Arc::new(
            AnyPoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap(),
        );
        crate::db::schema::migrate(&pool).await.unwrap();
        let repo = Arc::new(SqlxSyncRepository::new(pool.clone()));
        let journal = OperationJournal::new(repo);
        let worker = Worker::new(
            pool.clone(),
            Lane::Default,
            journal,
            Duration::from_secs(30),
            Duration::from_secs(10),
            60,
        );
        (worker, pool)
    }

    async fn insert_task(pool: &AnyPool, status: &str, leased_until: Option<i64>, available_at: i64) -> Uuid {
        let task_id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO queue_tasks
                 (task_id, user_id, lane, operation_type, payload, status, attempt, available_at, leased_until, created_at)
               VALUES (?, ?, 'default', 'periodic', NULL, ?, 0, ?, ?, ?)"#,
        )
        .bind(task_id.to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(status)
        .bind(available_at)
        .bind(leased_until)
        .bind(available_at)
        .execute(pool)
        .await
        .unwrap();
        task_id
    }

    #[tokio::test]
    async fn lease_one_reclaims_expired_lease() {
        let (worker, pool) = test_worker().await;
        let now = now_secs();
        let task_id = insert_task(&pool, "leased", Some(now - 5), now - 100).await;

        let leased = worker.lease_one().await.unwrap();
        assert_eq!(leased.map(|t| t.task_id), Some(task_id), "an expired lease must be reclaimable");
    }

    #[tokio::test]
    async fn lease_one_ignores_lease_not_yet_expired() {
        let (worker, pool) = test_worker().await;
        let now = now_secs();
        insert_task(&pool, "leased", Some(now + 300), now - 100).await;

        let leased = worker.lease_one().await.unwrap();
        assert!(leased.is_none(), "a still-live lease must not be reclaimed");
    }
}

fn row_to_task(row: &sqlx::any::AnyRow) -> anyhow::Result<QueuedTask> {
    let task_id: String = row.try_get("task_id")?;
    let user_id: String = row.try_get("user_id")?;
    let lane: String = row.try_get("lane")?;
    let operation_type: String = row.try_get("operation_type")?;
    let payload: Option<String> = row.try_get("payload")?;
    let attempt: i64 = row.try_get("attempt")?;

    let operation_type = match operation_type.as_str() {
        "bulk_sync" => OperationType::BulkSync,
        "sync_update" => OperationType::SyncUpdate,
        "sync_delete" => OperationType::SyncDelete,
        "webhook" => OperationType::Webhook,
        "periodic" => OperationType::Periodic,
        other => anyhow::bail!("unknown operation_type {other}"),
    };
    let lane = match lane.as_str() {
        "high-priority" => Lane::HighPriority,
        "bulk-sync" => Lane::BulkSync,
        _ => Lane::Default,
    };

    Ok(QueuedTask {
        task_id: Uuid::parse_str(&task_id)?,
        user_id: Uuid::parse_str(&user_id)?,
        lane,
        operation_type,
        payload: payload.map(|s| serde_json::from_str(&s)).transpose()?,
        attempt,
    })
}

//! §4.D circuit breaker: a single global row (`circuit_breaker_state`,
//! `id = 1` enforced by a CHECK constraint) mutated by two single-statement
//! `UPDATE`s whose `CASE` expressions compute the whole transition
//! server-side — there is no point at which application code reads
//! `failure_count`/`state` before writing it back.

use std::sync::Arc;

use sqlx::{AnyPool, Row};

use crate::time::now_secs;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum FailureKind {
    RateLimit,
    Generic,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    pool: Arc<AnyPool>,
    failure_threshold: u32,
    success_threshold: u32,
    timeout_secs: i64,
}

impl CircuitBreaker {
    pub fn new(
        pool: Arc<AnyPool>,
        failure_threshold: u32,
        success_threshold: u32,
        timeout_secs: i64,
    ) -> Self {
        Self {
            pool,
            failure_threshold,
            success_threshold,
            timeout_secs,
        }
    }

    async fn ensure_row(&self) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO circuit_breaker_state (id, state, failure_count, success_count) \
             VALUES (1, 'closed', 0, 0) ON CONFLICT (id) DO NOTHING",
        )
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Consults and, if due, advances OPEN -> HALF_OPEN (§4.D: the
    /// transition only happens when "next call arrives", i.e. here).
    /// Fails open (reports CLOSED) on a storage error rather than wedge
    /// every caller behind a broken breaker store.
    pub async fn get_state(&self) -> BreakerState {
        match self.try_get_state().await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "circuit breaker store error, failing open");
                BreakerState::Closed
            }
        }
    }

    async fn try_get_state(&self) -> anyhow::Result<BreakerState> {
        self.ensure_row().await?;
        let now = now_secs();
        sqlx::query(
            "UPDATE circuit_breaker_state SET state = 'half_open', success_count = 0 \
             WHERE id = 1 AND state = 'open' AND opened_at IS NOT NULL AND (? - opened_at) >= ?",
        )
        .bind(now)
        .bind(self.timeout_secs)
        .execute(&*self.pool)
        .await?;

        let row = sqlx::query("SELECT state FROM circuit_breaker_state WHERE id = 1")
            .fetch_one(&*self.pool)
            .await?;
        let state: String = row.try_get("state")?;
        Ok(BreakerState::parse(&state))
    }

    pub async fn record_failure(&self, _kind: FailureKind) {
        if let Err(e) = self.try_record_failure().await {
            tracing::warn!(error = %e, "circuit breaker store error recording failure");
        }
    }

    async fn try_record_failure(&self) -> anyhow::Result<()> {
        self.ensure_row().await?;
        let now = now_secs();
        sqlx::query(
            r#"UPDATE circuit_breaker_state SET
                 failure_count = CASE WHEN state = 'half_open' THEN failure_count ELSE failure_count + 1 END,
                 success_count = CASE WHEN state = 'half_open' THEN 0 ELSE success_count END,
                 state = CASE
                   WHEN state = 'half_open' THEN 'open'
                   WHEN state = 'closed' AND failure_count + 1 >= ? THEN 'open'
                   ELSE state
                 END,
                 opened_at = CASE
                   WHEN state = 'half_open' THEN ?
                   WHEN state = 'closed' AND failure_count + 1 >= ? THEN ?
                   ELSE opened_at
                 END
               WHERE id = 1"#,
        )
        .bind(self.failure_threshold as i64)
        .bind(now)
        .bind(self.failure_threshold as i64)
        .bind(now)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_success(&self) {
        if let Err(e) = self.try_record_success().await {
            tracing::warn!(error = %e, "circuit breaker store error recording success");
        }
    }

    async fn try_record_success(&self) -> anyhow::Result<()> {
        self.ensure_row().await?;
        sqlx::query(
            r#"UPDATE circuit_breaker_state SET
                 success_count = CASE WHEN state = 'half_open' THEN success_count + 1 ELSE success_count END,
                 failure_count = CASE WHEN state = 'closed' THEN 0 ELSE failure_count END,
                 state = CASE
                   WHEN state = 'half_open' AND success_count + 1 >= ? THEN 'closed'
                   ELSE state
                 END,
                 opened_at = CASE
                   WHEN state = 'half_open' AND success_count + 1 >= ? THEN NULL
                   ELSE opened_at
                 END
               WHERE id = 1"#,
        )
        .bind(self.success_threshold as i64)
        .bind(self.success_threshold as i64)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::any::AnyPoolOptions;

    async fn test_breaker(failure_threshold: u32, success_threshold: u32, timeout_secs: i64) -> CircuitBreaker {
        sqlx::any::install_default_drivers();
        let pool = Arc::new(
            AnyPoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap(),
        );
        crate::db::schema::migrate(&pool).await.unwrap();
        CircuitBreaker::new(pool, failure_threshold, success_threshold, timeout_secs)
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = test_breaker(5, 2, 60).await;
        assert_eq!(breaker.get_state().await, BreakerState::Closed);
        for _ in 0..4 {
            breaker.record_failure(FailureKind::Generic).await;
        }
        assert_eq!(breaker.get_state().await, BreakerState::Closed);
        breaker.record_failure(FailureKind::Generic).await;
        assert_eq!(breaker.get_state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = test_breaker(1, 2, 0).await;
        breaker.record_failure(FailureKind::Generic).await;
        assert_eq!(breaker.get_state().await, BreakerState::HalfOpen);
        breaker.record_failure(FailureKind::Generic).await;
        assert_eq!(breaker.get_state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = test_breaker(1, 2, 0).await;
        breaker.record_failure(FailureKind::Generic).await;
        assert_eq!(breaker.get_state().await, BreakerState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.get_state().await, BreakerState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.get_state().await, BreakerState::Closed);
    }
}

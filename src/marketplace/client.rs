//! §4.E Marketplace client. Wraps the HTTP boundary behind the limiter (C)
//! and breaker (D): a thin, `#[instrument]`-annotated struct around a
//! plain `reqwest::Client` whose methods return a typed error.

use std::time::Duration;

use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::error::SyncError;
use crate::kv::{BreakerState, CircuitBreaker, FailureKind};
use crate::kv::AdaptiveRateLimiter;
use crate::marketplace::types::{BulkUpdateRequest, InfoResponse, JobEnvelope, JobStatus};

#[derive(Clone)]
pub struct MarketplaceClient {
    http: Client,
    base_url: String,
    limiter: AdaptiveRateLimiter,
    breaker: CircuitBreaker,
    max_429_retries: u32,
}

impl MarketplaceClient {
    pub fn new(
        base_url: String,
        request_timeout_secs: u64,
        export_timeout_secs: u64,
        max_429_retries: u32,
        limiter: AdaptiveRateLimiter,
        breaker: CircuitBreaker,
    ) -> Result<Self, SyncError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(export_timeout_secs.max(request_timeout_secs)))
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Configuration {
                setting: "marketplace_http_client".into(),
                detail: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url,
            limiter,
            breaker,
            max_429_retries,
        })
    }

    #[instrument(skip(self, token, body), fields(%user_id, path = path))]
    async fn request(
        &self,
        user_id: Uuid,
        token: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>, SyncError> {
        // Step 1: breaker gate.
        if self.breaker.get_state().await == BreakerState::Open {
            return Err(SyncError::MarketplaceServiceUnavailable { timeout: None });
        }

        // Step 2: token bucket. Not a hard block: a denial just means we
        // wait out the window once before giving up, per §4.E step 2.
        let (allowed, wait) = self.limiter.acquire(user_id, 1).await;
        if !allowed {
            if let Some(secs) = wait {
                tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
            }
            let (allowed_again, _) = self.limiter.acquire(user_id, 1).await;
            if !allowed_again {
                return Err(SyncError::RateLimitExceeded { retry_after: wait });
            }
        }

        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            let mut req = self.http.request(method.clone(), &url).bearer_auth(token);
            if let Some(b) = &body {
                req = req.json(b);
            }

            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    self.breaker.record_failure(FailureKind::Generic).await;
                    return Err(SyncError::MarketplaceApiError {
                        detail: format!("request error: {e}"),
                    });
                }
            };

            let status = resp.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                // Always inform the limiter; only inform the breaker once
                // the in-process retry budget is exhausted (SPEC_FULL.md's
                // resolution of §9's double-counting open question).
                self.limiter.on_limit_exceeded(user_id).await;

                if attempt >= self.max_429_retries {
                    self.breaker.record_failure(FailureKind::RateLimit).await;
                    let retry_after = retry_after_secs(&resp);
                    return Err(SyncError::RateLimitExceeded {
                        retry_after: Some(retry_after),
                    });
                }

                let retry_after = retry_after_secs(&resp);
                let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
                let backoff = retry_after + (attempt as f64) * 2.0 + jitter;
                tokio::time::sleep(Duration::from_secs_f64(backoff.max(0.0))).await;
                attempt += 1;
                continue;
            }

            if status == StatusCode::NOT_FOUND {
                // Callers that treat 404 as success (delete) handle this
                // themselves; surface it as a typed "not found" otherwise.
                self.breaker.record_success().await;
                return Ok(None);
            }

            if !status.is_success() {
                self.breaker.record_failure(FailureKind::Generic).await;
                let detail = resp
                    .text()
                    .await
                    .unwrap_or_else(|_| status.to_string());
                return Err(SyncError::MarketplaceApiError { detail });
            }

            self.limiter.on_success(user_id).await;
            self.breaker.record_success().await;

            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }

            let value: Value = resp.json().await.map_err(|e| SyncError::MarketplaceApiError {
                detail: format!("invalid response body: {e}"),
            })?;
            return Ok(Some(value));
        }
    }

    pub async fn info(&self, user_id: Uuid, token: &str) -> Result<InfoResponse, SyncError> {
        let value = self
            .request(user_id, token, Method::GET, "/info", None)
            .await?
            .ok_or_else(|| SyncError::MarketplaceApiError {
                detail: "empty /info response".into(),
            })?;
        serde_json::from_value(value).map_err(|e| SyncError::MarketplaceApiError {
            detail: format!("malformed /info response: {e}"),
        })
    }

    /// `products_export[?blueprint_id=&expansion_id=]`. One large, slow
    /// page — the client-wide timeout already covers the 180 s budget.
    pub async fn products_export(
        &self,
        user_id: Uuid,
        token: &str,
        blueprint_id: Option<i64>,
    ) -> Result<Vec<Value>, SyncError> {
        let path = match blueprint_id {
            Some(id) => format!("/products/export?blueprint_id={id}"),
            None => "/products/export".to_string(),
        };
        let value = self
            .request(user_id, token, Method::GET, &path, None)
            .await?
            .unwrap_or_else(|| Value::Array(vec![]));
        value
            .as_array()
            .cloned()
            .ok_or_else(|| SyncError::MarketplaceApiError {
                detail: "products_export did not return an array".into(),
            })
    }

    pub async fn bulk_update(
        &self,
        user_id: Uuid,
        token: &str,
        products: Vec<Value>,
    ) -> Result<String, SyncError> {
        let body = serde_json::to_value(BulkUpdateRequest { products }).unwrap();
        let value = self
            .request(user_id, token, Method::POST, "/products/bulk_update", Some(body))
            .await?
            .ok_or_else(|| SyncError::MarketplaceApiError {
                detail: "bulk_update returned no job envelope".into(),
            })?;
        let envelope: JobEnvelope = serde_json::from_value(value).map_err(|e| SyncError::MarketplaceApiError {
            detail: format!("malformed bulk_update response: {e}"),
        })?;
        Ok(envelope.job)
    }

    pub async fn bulk_create(
        &self,
        user_id: Uuid,
        token: &str,
        products: Vec<Value>,
    ) -> Result<String, SyncError> {
        let body = serde_json::to_value(BulkUpdateRequest { products }).unwrap();
        let value = self
            .request(user_id, token, Method::POST, "/products/bulk_create", Some(body))
            .await?
            .ok_or_else(|| SyncError::MarketplaceApiError {
                detail: "bulk_create returned no job envelope".into(),
            })?;
        let envelope: JobEnvelope = serde_json::from_value(value).map_err(|e| SyncError::MarketplaceApiError {
            detail: format!("malformed bulk_create response: {e}"),
        })?;
        Ok(envelope.job)
    }

    /// 404 is treated as success (`already_deleted`), per §4.E.
    pub async fn delete(&self, user_id: Uuid, token: &str, product_id: &str) -> Result<(), SyncError> {
        let path = format!("/products/{product_id}");
        self.request(user_id, token, Method::DELETE, &path, None).await?;
        Ok(())
    }

    pub async fn increment(
        &self,
        user_id: Uuid,
        token: &str,
        product_id: &str,
        delta_quantity: i64,
    ) -> Result<(), SyncError> {
        let path = format!("/products/{product_id}/increment");
        let body = serde_json::json!({ "delta_quantity": delta_quantity });
        self.request(user_id, token, Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    /// There is no single-product GET on this API; mirror the upstream's
    /// own `get_product_by_id` by pulling the full export and scanning it
    /// linearly for a matching id. Slow, but it is the only contract the
    /// API actually offers.
    pub async fn get_product(
        &self,
        user_id: Uuid,
        token: &str,
        product_id: &str,
    ) -> Result<Option<Value>, SyncError> {
        let products = self.products_export(user_id, token, None).await?;
        Ok(products.into_iter().find(|p| {
            p.get("id")
                .map(|id| match id {
                    Value::String(s) => s == product_id,
                    Value::Number(n) => n.to_string() == product_id,
                    _ => false,
                })
                .unwrap_or(false)
        }))
    }

    pub async fn job_status(&self, user_id: Uuid, token: &str, job_id: &str) -> Result<JobStatus, SyncError> {
        let path = format!("/jobs/{job_id}");
        let value = self
            .request(user_id, token, Method::GET, &path, None)
            .await?
            .ok_or_else(|| SyncError::MarketplaceApiError {
                detail: format!("job {job_id} not found"),
            })?;
        serde_json::from_value(value).map_err(|e| SyncError::MarketplaceApiError {
            detail: format!("malformed job status response: {e}"),
        })
    }
}

fn retry_after_secs(resp: &reqwest::Response) -> f64 {
    resp.headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(1.0)
}

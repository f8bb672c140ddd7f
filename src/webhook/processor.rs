//! Component H: the webhook processor. `ingress` is the fast path called
//! synchronously at the HTTP boundary (out of scope here, but this is the
//! function it would call): validate the signature, enqueue, always
//! succeed. `apply` is the slow path run by a queue worker against the
//! latest DB state (§4.H table).

use serde_json::{Value, json};
use uuid::Uuid;

use crate::db::repo::SyncRepository;
use crate::error::SyncError;
use crate::model::OperationType;
use crate::queue::Dispatcher;
use crate::webhook::signature::validate_signature;
use std::sync::Arc;

pub struct WebhookProcessor {
    repo: Arc<dyn SyncRepository>,
    dispatcher: Dispatcher,
}

impl WebhookProcessor {
    pub fn new(repo: Arc<dyn SyncRepository>, dispatcher: Dispatcher) -> Self {
        Self { repo, dispatcher }
    }

    /// §4.H / §6: validates the signature and enqueues for later
    /// processing. Always returns `Ok` — a rejected signature is logged,
    /// not surfaced, because the ingest endpoint must still ack within
    /// 100 ms to stop upstream retries.
    pub async fn ingress(
        &self,
        user_id: Uuid,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<(), SyncError> {
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

        let Some(secret) = settings.webhook_secret else {
            tracing::warn!(%user_id, "webhook received but no webhook_secret configured");
            return Ok(());
        };

        if !validate_signature(raw_body, signature_header, &secret) {
            tracing::warn!(%user_id, "webhook signature validation failed");
            return Ok(());
        }

        let body: Value = serde_json::from_slice(raw_body).map_err(|e| SyncError::Validation {
            detail: format!("webhook body is not valid JSON: {e}"),
            field: None,
        })?;

        self.dispatcher
            .enqueue(user_id, OperationType::Webhook, Some(body))
            .await?;
        Ok(())
    }

    /// §4.H's cause-dispatch table, run by the queue worker against the
    /// latest row state. Missing local items are recorded in the returned
    /// `errors` array but never abort processing of the rest of the order.
    pub async fn apply(&self, user_id: Uuid, body: &Value) -> Result<Value, SyncError> {
        let cause = body.get("cause").and_then(Value::as_str).unwrap_or("");
        let data = body.get("data").cloned().unwrap_or(Value::Null);
        let state = data.get("state").and_then(Value::as_str);
        let previous_state = data.get("previous_state").and_then(Value::as_str);
        let order_items = data
            .get("order_items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut errors = Vec::new();

        for order_item in &order_items {
            let Some(product_id) = order_item.get("product_id").and_then(Value::as_str) else {
                continue;
            };
            let item_qty = order_item
                .get("item_qty")
                .and_then(Value::as_i64)
                .unwrap_or(0);

            let Some(delta) = delta_for(cause, state, previous_state, item_qty) else {
                continue;
            };

            match self.repo.find_by_external_stock_id(user_id, product_id).await {
                Ok(Some(item)) => {
                    if let Err(e) = self.repo.adjust_quantity(item.id, delta).await {
                        errors.push(json!({ "product_id": product_id, "error": e.to_string() }));
                    }
                }
                Ok(None) => {
                    errors.push(json!({ "product_id": product_id, "error": "inventory item not found" }));
                }
                Err(e) => {
                    errors.push(json!({ "product_id": product_id, "error": e.to_string() }));
                }
            }
        }

        Ok(json!({ "errors": errors }))
    }
}

/// Quantity delta (in units to add, possibly negative) for one order item
/// under §4.H's table. `None` means the cause/state combination doesn't
/// apply to this item at all (not an error, just a no-op).
fn delta_for(cause: &str, state: Option<&str>, previous_state: Option<&str>, item_qty: i64) -> Option<i64> {
    match cause {
        "order.create" if state == Some("paid") => Some(-item_qty),
        "order.update" => {
            let canceled = matches!(state, Some("canceled") | Some("request_for_cancel"));
            let reverted_from_paid = previous_state == Some("paid") && state != Some("paid");
            if canceled || reverted_from_paid {
                Some(item_qty)
            } else {
                None
            }
        }
        "order.destroy" => Some(item_qty),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_create_paid_decrements() {
        assert_eq!(delta_for("order.create", Some("paid"), None, 2), Some(-2));
    }

    #[test]
    fn order_create_unpaid_is_noop() {
        assert_eq!(delta_for("order.create", Some("pending"), None, 2), None);
    }

    #[test]
    fn order_update_canceled_restores() {
        assert_eq!(delta_for("order.update", Some("canceled"), Some("paid"), 2), Some(2));
    }

    #[test]
    fn order_update_paid_to_paid_is_noop() {
        assert_eq!(delta_for("order.update", Some("paid"), Some("paid"), 2), None);
    }

    #[test]
    fn order_update_reverted_from_paid_restores() {
        assert_eq!(
            delta_for("order.update", Some("refunded"), Some("paid"), 3),
            Some(3)
        );
    }

    #[test]
    fn order_destroy_always_restores() {
        assert_eq!(delta_for("order.destroy", None, None, 5), Some(5));
    }
}

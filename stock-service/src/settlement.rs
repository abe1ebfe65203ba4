//! Order settlement adapter: the boundary between payment-provider webhook
//! events and the ledger. Applies each event exactly once; providers
//! redeliver webhooks, so the event id is recorded before any mutation.

use axum::extract::State;
use axum::Json;
use common_http_errors::ApiError;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{alerts, ledger, AppState};

#[derive(Debug, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Payment intent / checkout session id the reservations were keyed by.
    pub correlation_id: String,
    #[serde(default)]
    pub order_reference: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
pub struct LineItem {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Settled,
    Failed,
    Ignored,
}

/// Both success-shaped provider events land on the same settled path; the
/// intent event and the session event for one checkout share a correlation
/// id, so whichever arrives second finds nothing left to consume.
pub fn kind_of(event_type: &str) -> EventKind {
    match event_type {
        "payment_intent.succeeded" | "checkout.session.completed" => EventKind::Settled,
        "payment_intent.payment_failed" => EventKind::Failed,
        _ => EventKind::Ignored,
    }
}

/// Record the event id, returning false when it was already processed.
async fn mark_processed(db: &PgPool, event_id: &str, event_type: &str) -> Result<bool, sqlx::Error> {
    let inserted = sqlx::query_scalar::<_, i32>(
        "INSERT INTO processed_events (event_id, event_type) VALUES ($1, $2) \
         ON CONFLICT (event_id) DO NOTHING RETURNING 1",
    )
    .bind(event_id)
    .bind(event_type)
    .fetch_optional(db)
    .await?;
    Ok(inserted.is_some())
}

/// POST /webhooks/payments (behind the signature middleware).
///
/// Always acknowledges once the payload parsed: per-item failures are logged
/// and must not trigger a provider retry storm against items that already
/// settled. Only a failure to record the event id is surfaced, since nothing
/// was mutated yet and the redelivery is safe.
pub async fn handle_payment_event(
    State(state): State<AppState>,
    Json(event): Json<PaymentEvent>,
) -> Result<Json<Value>, ApiError> {
    let kind = kind_of(&event.event_type);
    if kind == EventKind::Ignored {
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "unhandled payment event type");
        return Ok(Json(json!({ "received": true })));
    }

    let fresh = mark_processed(&state.db, &event.id, &event.event_type)
        .await
        .map_err(|err| ApiError::internal(err, None))?;
    if !fresh {
        state.metrics.duplicate_events.inc();
        tracing::info!(event_id = %event.id, "duplicate settlement event acknowledged without effect");
        return Ok(Json(json!({ "received": true, "duplicate": true })));
    }

    let order_reference = event.order_reference.as_deref().unwrap_or(&event.correlation_id);

    for item in &event.line_items {
        if item.quantity <= 0 {
            tracing::warn!(event_id = %event.id, product_id = %item.product_id, size = %item.size, quantity = item.quantity, "skipping line item with non-positive quantity");
            continue;
        }
        match kind {
            EventKind::Settled => {
                match ledger::decrement(
                    &state.db,
                    item.product_id,
                    &item.size,
                    item.quantity,
                    Some(&event.correlation_id),
                    order_reference,
                )
                .await
                {
                    Ok(snapshot) => {
                        tracing::info!(event_id = %event.id, product_id = %item.product_id, size = %item.size, quantity = item.quantity, "stock decremented for settled order");
                        if let Err(err) = alerts::evaluate(&state.db, item.product_id, &item.size, snapshot).await {
                            tracing::error!(?err, product_id = %item.product_id, size = %item.size, "alert evaluation failed after settlement");
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, event_id = %event.id, product_id = %item.product_id, size = %item.size, "failed to decrement stock for settled order");
                    }
                }
            }
            EventKind::Failed => {
                match ledger::release(&state.db, item.product_id, &item.size, &event.correlation_id).await {
                    Ok(Some(snapshot)) => {
                        tracing::info!(event_id = %event.id, product_id = %item.product_id, size = %item.size, "reservation released after failed payment");
                        if let Err(err) = alerts::evaluate(&state.db, item.product_id, &item.size, snapshot).await {
                            tracing::error!(?err, product_id = %item.product_id, size = %item.size, "alert evaluation failed after release");
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(event_id = %event.id, product_id = %item.product_id, size = %item.size, "no reservation left to release");
                    }
                    Err(err) => {
                        tracing::error!(%err, event_id = %event.id, product_id = %item.product_id, size = %item.size, "failed to release reservation");
                    }
                }
            }
            EventKind::Ignored => unreachable!("ignored events return early"),
        }
    }

    Ok(Json(json!({ "received": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_success_events_map_to_settled() {
        assert_eq!(kind_of("payment_intent.succeeded"), EventKind::Settled);
        assert_eq!(kind_of("checkout.session.completed"), EventKind::Settled);
        assert_eq!(kind_of("payment_intent.payment_failed"), EventKind::Failed);
        assert_eq!(kind_of("charge.refunded"), EventKind::Ignored);
    }

    #[test]
    fn event_parses_provider_payload() {
        let raw = serde_json::json!({
            "id": "evt_01",
            "type": "payment_intent.succeeded",
            "correlation_id": "pi_123",
            "order_reference": "TERRA-2024-0042",
            "line_items": [
                { "product_id": Uuid::nil(), "size": "42", "quantity": 2 }
            ]
        });
        let event: PaymentEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.id, "evt_01");
        assert_eq!(event.correlation_id, "pi_123");
        assert_eq!(event.order_reference.as_deref(), Some("TERRA-2024-0042"));
        assert_eq!(event.line_items.len(), 1);
        assert_eq!(event.line_items[0].size, "42");
    }

    #[test]
    fn event_without_items_or_reference_still_parses() {
        let raw = serde_json::json!({
            "id": "evt_02",
            "type": "payment_intent.payment_failed",
            "correlation_id": "pi_456"
        });
        let event: PaymentEvent = serde_json::from_value(raw).unwrap();
        assert!(event.line_items.is_empty());
        assert!(event.order_reference.is_none());
    }
}

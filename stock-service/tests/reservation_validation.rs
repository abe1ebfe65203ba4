use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{routing::post, Router};
use serde_json::json;
use stock_service::stock_handlers::create_reservation;
use tower::ServiceExt;
use uuid::Uuid;

mod test_utils;
use test_utils::lazy_app_state;

fn reservation_app() -> Router {
    Router::new()
        .route("/stock/reservations", post(create_reservation))
        .with_state(lazy_app_state())
}

async fn post_reservation(body: serde_json::Value) -> axum::response::Response {
    let req = Request::builder()
        .uri("/stock/reservations")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    reservation_app().oneshot(req).await.unwrap()
}

#[tokio::test]
async fn create_reservation_rejects_empty_items() {
    let resp = post_reservation(json!({
        "correlation_id": "pi_test_empty",
        "items": []
    }))
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "empty items should be rejected");
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "empty_reservation");
}

#[tokio::test]
async fn create_reservation_rejects_non_positive_quantity() {
    let resp = post_reservation(json!({
        "correlation_id": "pi_test_qty",
        "items": [ { "product_id": Uuid::new_v4(), "size": "42", "quantity": 0 } ]
    }))
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_quantity");
}

#[tokio::test]
async fn create_reservation_rejects_blank_size_label() {
    let resp = post_reservation(json!({
        "correlation_id": "pi_test_size",
        "items": [ { "product_id": Uuid::new_v4(), "size": "  ", "quantity": 1 } ]
    }))
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_size");
}

#[tokio::test]
async fn create_reservation_rejects_blank_correlation_id() {
    let resp = post_reservation(json!({
        "correlation_id": "   ",
        "items": [ { "product_id": Uuid::new_v4(), "size": "42", "quantity": 1 } ]
    }))
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "missing_correlation_id");
}

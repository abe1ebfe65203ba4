use axum::body::{to_bytes, Body};
use axum::http::Request;
use axum::{routing::post, Router};
use serde_json::json;
use stock_service::stock_handlers::{create_adjustment, create_reservation};
use tower::ServiceExt;
use uuid::Uuid;

mod test_utils;
use test_utils::lazy_app_state;

#[tokio::test]
async fn reservation_errors_use_the_json_envelope() {
    let app = Router::new()
        .route("/stock/reservations", post(create_reservation))
        .with_state(lazy_app_state());

    let body = json!({
        "correlation_id": "pi_shape",
        "items": [ { "product_id": Uuid::new_v4(), "size": "42", "quantity": -1 } ]
    })
    .to_string();
    let req = Request::builder()
        .uri("/stock/reservations")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert!(resp.status().as_u16() >= 400);
    assert!(resp.headers().get("X-Error-Code").is_some(), "missing X-Error-Code header");
    let bytes = to_bytes(resp.into_body(), 1024 * 16).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("\"code\":"), "body missing code field: {}", text);
    assert!(text.contains("invalid_quantity"), "unexpected code: {}", text);
}

#[tokio::test]
async fn adjustment_rejects_blank_size_with_envelope() {
    let app = Router::new()
        .route("/stock/adjustments", post(create_adjustment))
        .with_state(lazy_app_state());

    let body = json!({
        "product_id": Uuid::new_v4(),
        "size": "",
        "delta": 5,
        "movement_type": "restock"
    })
    .to_string();
    let req = Request::builder()
        .uri("/stock/adjustments")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_size");
}

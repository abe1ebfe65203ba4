use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::{routing::post, Router};
use serde_json::json;
use stock_service::stock_handlers::bulk_restock;
use tower::ServiceExt;
use uuid::Uuid;

mod test_utils;
use test_utils::lazy_app_state;

fn restock_app() -> Router {
    Router::new()
        .route("/stock/adjustments/bulk", post(bulk_restock))
        .with_state(lazy_app_state())
}

async fn post_restock(body: serde_json::Value) -> axum::response::Response {
    let req = Request::builder()
        .uri("/stock/adjustments/bulk")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    restock_app().oneshot(req).await.unwrap()
}

#[tokio::test]
async fn bulk_restock_rejects_empty_items() {
    let resp = post_restock(json!({ "items": [] })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "empty_restock");
}

#[tokio::test]
async fn bulk_restock_reports_bad_lines_without_failing_the_request() {
    let resp = post_restock(json!({
        "items": [
            { "product_id": Uuid::new_v4(), "size": "42", "quantity": 0 },
            { "product_id": Uuid::new_v4(), "size": "  ", "quantity": 3 }
        ]
    }))
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), 1024 * 16).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["summary"]["total"], 2);
    assert_eq!(body["summary"]["success"], 0);
    assert_eq!(body["summary"]["errors"], 2);
    assert_eq!(body["results"][0]["status"], "error");
    assert_eq!(body["results"][1]["status"], "error");
}

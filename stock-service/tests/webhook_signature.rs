use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{middleware, routing::get, routing::post, Router};
use stock_service::webhook::{signature_for, verify_webhook};
use tower::ServiceExt;

// Every test sets the same value, so parallel test threads sharing the
// process environment cannot race each other into a different secret.
const SECRET: &str = "whsec_stock_service_tests";

fn app() -> Router {
    Router::new()
        .route("/webhooks/payments", post(|| async { "delivered" }))
        .route("/healthz", get(|| async { "ok" }))
        .layer(middleware::from_fn(verify_webhook))
}

fn signed_request(body: &'static str, ts: String, tamper: bool) -> Request<Body> {
    let nonce = "nonce-1";
    let sig = signature_for(SECRET, &ts, nonce, body.as_bytes());
    let sig = if tamper { format!("{sig}00") } else { sig };
    Request::builder()
        .uri("/webhooks/payments")
        .method("POST")
        .header("content-type", "application/json")
        .header("X-Signature", sig)
        .header("X-Timestamp", ts)
        .header("X-Nonce", nonce)
        .body(Body::from(body))
        .unwrap()
}

fn now_ts() -> String {
    chrono::Utc::now().timestamp().to_string()
}

#[tokio::test]
async fn missing_signature_headers_are_rejected() {
    std::env::set_var("PAYMENT_WEBHOOK_SECRET", SECRET);
    let req = Request::builder()
        .uri("/webhooks/payments")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "sig_missing");
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    std::env::set_var("PAYMENT_WEBHOOK_SECRET", SECRET);
    let resp = app()
        .oneshot(signed_request("{\"id\":\"evt_1\"}", now_ts(), true))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "sig_mismatch");
}

#[tokio::test]
async fn stale_timestamp_is_rejected_even_with_valid_signature() {
    std::env::set_var("PAYMENT_WEBHOOK_SECRET", SECRET);
    let stale = (chrono::Utc::now().timestamp() - 3600).to_string();
    let resp = app()
        .oneshot(signed_request("{\"id\":\"evt_2\"}", stale, false))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "sig_skew");
}

#[tokio::test]
async fn valid_signature_reaches_the_handler() {
    std::env::set_var("PAYMENT_WEBHOOK_SECRET", SECRET);
    let resp = app()
        .oneshot(signed_request("{\"id\":\"evt_3\"}", now_ts(), false))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn non_webhook_paths_bypass_verification() {
    std::env::set_var("PAYMENT_WEBHOOK_SECRET", SECRET);
    let req = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

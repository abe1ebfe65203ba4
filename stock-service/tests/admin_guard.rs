use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{middleware, routing::post, Router};
use stock_service::webhook::require_admin_token;
use tower::ServiceExt;

// One token value shared by all tests in this binary so parallel threads
// writing the environment cannot disagree.
const TOKEN: &str = "admin-test-token";

fn app() -> Router {
    Router::new()
        .route("/admin/sweep", post(|| async { "swept" }))
        .route_layer(middleware::from_fn(require_admin_token))
}

#[tokio::test]
async fn missing_bearer_token_is_rejected() {
    std::env::set_var("ADMIN_API_TOKEN", TOKEN);
    let req = Request::builder()
        .uri("/admin/sweep")
        .method("POST")
        .body(Body::empty())
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers().get("X-Error-Code").unwrap(),
        "admin_token_invalid"
    );
}

#[tokio::test]
async fn wrong_bearer_token_is_rejected() {
    std::env::set_var("ADMIN_API_TOKEN", TOKEN);
    let req = Request::builder()
        .uri("/admin/sweep")
        .method("POST")
        .header("authorization", "Bearer not-the-token")
        .body(Body::empty())
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn correct_bearer_token_passes() {
    std::env::set_var("ADMIN_API_TOKEN", TOKEN);
    let req = Request::builder()
        .uri("/admin/sweep")
        .method("POST")
        .header("authorization", format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

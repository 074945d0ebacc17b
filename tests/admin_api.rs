//! Admin API tests, driven in-process through the router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use caching_proxy::admin::{setup_admin_router, AdminState};
use caching_proxy::net::ConnectionTracker;
use caching_proxy::CacheFlags;
use serde_json::Value;
use tower::ServiceExt;

const KEY: &str = "test-admin-key";

fn router(flags: &CacheFlags) -> Router {
    setup_admin_router(AdminState {
        flags: flags.clone(),
        api_key: Arc::from(KEY),
        store_name: "memory",
        connections: ConnectionTracker::new(),
    })
}

async fn call(router: Router, method: Method, uri: &str, key: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        request = request.header("Authorization", format!("Bearer {key}"));
    }
    let response = router.oneshot(request.body(Body::empty()).unwrap()).await.unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn requires_bearer_key() {
    let flags = CacheFlags::default();

    let (status, _) = call(router(&flags), Method::GET, "/admin/status", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(router(&flags), Method::GET, "/admin/status", Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(router(&flags), Method::GET, "/admin/status", Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "operational");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn reports_both_flags() {
    let flags = CacheFlags::new(true, false);
    let (status, body) = call(router(&flags), Method::GET, "/admin/cache", Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({ "enabled": true, "local_only": false }));
}

#[tokio::test]
async fn put_and_delete_toggle_shared_flags() {
    let flags = CacheFlags::default();

    let (status, body) = call(router(&flags), Method::PUT, "/admin/cache/local-only", Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({ "flag": "local-only", "value": true }));
    assert!(flags.local_only().get());

    let (_, body) = call(router(&flags), Method::DELETE, "/admin/cache/enabled", Some(KEY)).await;
    assert_eq!(body["value"], false);
    assert!(!flags.enabled().get());

    let (_, body) = call(router(&flags), Method::GET, "/admin/cache/local_only", Some(KEY)).await;
    assert_eq!(body["value"], true);
}

#[tokio::test]
async fn unknown_flag_is_not_found() {
    let flags = CacheFlags::default();
    let (status, body) = call(router(&flags), Method::PUT, "/admin/cache/turbo", Some(KEY)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown cache flag: turbo");
}

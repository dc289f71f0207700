//! Integration Tests for API Endpoints
//!
//! Tests full request/response cycle for each endpoint.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use cloud_cache::{api::create_router, AppState, Cache, CacheConfig, FsBlobStore, MemoryBlobStore};
use serde_json::Value;
use std::time::Duration;
use tower::ServiceExt;

// == Helper Functions ==

fn create_test_app() -> Router {
    let cache = Cache::new(MemoryBlobStore::new(), CacheConfig::default());
    create_router(AppState::new(cache))
}

async fn body_to_bytes(body: Body) -> Vec<u8> {
    axum::body::to_bytes(body, usize::MAX).await.unwrap().to_vec()
}

async fn body_to_json(body: Body) -> Value {
    serde_json::from_slice(&body_to_bytes(body).await).unwrap()
}

fn put_request(uri: &str, content_type: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", content_type)
        .body(body.into())
        .unwrap()
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// == PUT Endpoint Tests ==

#[tokio::test]
async fn test_put_json_success() {
    let app = create_test_app();

    let response = app
        .oneshot(put_request(
            "/cache/test_key",
            "application/json",
            r#"{"some":"object"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_to_json(response.into_body()).await;
    assert!(json["message"].as_str().unwrap().contains("test_key"));
    assert_eq!(json["type"], "jsonish");
    assert!(json["ttl"].is_null());
}

#[tokio::test]
async fn test_put_with_ttl() {
    let app = create_test_app();

    let response = app
        .oneshot(put_request(
            "/cache/ttl_key?ttl=60",
            "application/octet-stream",
            "ttl_value",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["type"], "buffer");
    assert_eq!(json["ttl"], 60.0);
}

// == GET Endpoint Tests ==

#[tokio::test]
async fn test_get_binary_round_trip() {
    let app = create_test_app();
    let payload: Vec<u8> = (0..=255u8).collect();

    let response = app
        .clone()
        .oneshot(put_request(
            "/cache/blob",
            "application/octet-stream",
            payload.clone(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(request("GET", "/cache/blob")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/octet-stream"
    );
    assert_eq!(response.headers()["x-cache-type"], "buffer");
    assert_eq!(body_to_bytes(response.into_body()).await, payload);
}

#[tokio::test]
async fn test_get_json_round_trip() {
    let app = create_test_app();

    app.clone()
        .oneshot(put_request(
            "/cache/obj",
            "application/json",
            r#"{"with": {"nested": [1, 2, 3]}}"#,
        ))
        .await
        .unwrap();

    let response = app.oneshot(request("GET", "/cache/obj")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json");

    let json = body_to_json(response.into_body()).await;
    assert_eq!(json, serde_json::json!({"with": {"nested": [1, 2, 3]}}));
}

#[tokio::test]
async fn test_get_endpoint_not_found() {
    let app = create_test_app();

    let response = app
        .oneshot(request("GET", "/cache/nonexistent"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_to_json(response.into_body()).await;
    assert!(json["error"].as_str().unwrap().contains("nonexistent"));
}

// == HEAD / DELETE Endpoint Tests ==

#[tokio::test]
async fn test_delete_endpoint_success() {
    let app = create_test_app();

    app.clone()
        .oneshot(put_request("/cache/to_delete", "text/plain", "value"))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request("HEAD", "/cache/to_delete"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request("DELETE", "/cache/to_delete"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["key"], "to_delete");

    let response = app
        .oneshot(request("HEAD", "/cache/to_delete"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_endpoint_absent_key() {
    let app = create_test_app();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(request("DELETE", "/cache/never_set"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

// == Health Endpoint Tests ==

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app();

    let response = app.oneshot(request("GET", "/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "healthy");
    assert!(json.get("timestamp").is_some());
}

// == Error Response Tests ==

#[tokio::test]
async fn test_invalid_json_request() {
    let app = create_test_app();

    let response = app
        .oneshot(put_request(
            "/cache/bad",
            "application/json",
            r#"{"invalid json"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert!(json.get("error").is_some());
}

#[tokio::test]
async fn test_negative_ttl_request() {
    let app = create_test_app();

    let response = app
        .oneshot(put_request("/cache/k?ttl=-1", "text/plain", "value"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert!(json["error"].as_str().unwrap().contains("TTL"));
}

#[tokio::test]
async fn test_json_body_over_limit_request() {
    let cache = Cache::new(MemoryBlobStore::new(), CacheConfig::default());
    let app = create_router(AppState::new(cache).with_max_json_body(16));

    let response = app
        .clone()
        .oneshot(put_request(
            "/cache/big",
            "application/json",
            r#"{"far": "longer than sixteen bytes"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json = body_to_json(response.into_body()).await;
    assert!(json["error"].as_str().unwrap().contains("16"));

    let response = app.oneshot(request("HEAD", "/cache/big")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// == TTL Expiration via API Tests ==

#[tokio::test]
async fn test_ttl_expiration_via_api() {
    let app = create_test_app();

    let set_response = app
        .clone()
        .oneshot(put_request(
            "/cache/ttl_test?ttl=0.2",
            "text/plain",
            "expires_soon",
        ))
        .await
        .unwrap();
    assert_eq!(set_response.status(), StatusCode::OK);

    // Verify it exists immediately
    let get_response = app
        .clone()
        .oneshot(request("GET", "/cache/ttl_test"))
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let get_response = app
        .clone()
        .oneshot(request("GET", "/cache/ttl_test"))
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::NOT_FOUND);

    // The expired read removed the entry
    let head_response = app
        .oneshot(request("HEAD", "/cache/ttl_test"))
        .await
        .unwrap();
    assert_eq!(head_response.status(), StatusCode::NOT_FOUND);
}

// == Filesystem-backed Server ==

#[tokio::test]
async fn test_fs_backed_router() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::new(FsBlobStore::new(dir.path()).unwrap(), CacheConfig::default());
    let app = create_router(AppState::new(cache));

    let response = app
        .clone()
        .oneshot(put_request("/cache/file", "text/plain", "on disk"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(dir.path().join("cloud-cache").join("file").is_file());

    let response = app.oneshot(request("GET", "/cache/file")).await.unwrap();
    assert_eq!(body_to_bytes(response.into_body()).await, b"on disk");
}

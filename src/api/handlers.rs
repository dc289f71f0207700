//! API Handlers
//!
//! HTTP request handlers for each cache server endpoint.

use std::io;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use tracing::debug;

use crate::cache::{Cache, CacheValue, SetOptions, TypeName};
use crate::config::{Config, DEFAULT_MAX_JSON_BODY};
use crate::error::{CacheError, Result};
use crate::models::{validate_key, DeleteResponse, HealthResponse, SetQuery, SetResponse};
use crate::store::FsBlobStore;

/// Header carrying the stored encoding on GET responses
pub const TYPE_HEADER: &str = "x-cache-type";

/// Application state shared across all handlers.
///
/// `Cache` is cheap to clone and safe to share; no lock is needed.
#[derive(Clone)]
pub struct AppState {
    pub cache: Cache,
    /// Size limit for buffered JSON bodies, in bytes
    pub max_json_body: usize,
}

impl AppState {
    /// Creates a new AppState around the given cache.
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            max_json_body: DEFAULT_MAX_JSON_BODY,
        }
    }

    pub fn with_max_json_body(mut self, limit: usize) -> Self {
        self.max_json_body = limit;
        self
    }

    /// Creates a new AppState from configuration.
    ///
    /// Opens a filesystem blob store rooted at `config.store_dir`.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        let store = FsBlobStore::new(config.store_dir.clone())?;
        Ok(Self::new(Cache::new(store, config.cache_config()))
            .with_max_json_body(config.max_json_body))
    }
}

fn content_type_for(type_name: TypeName) -> &'static str {
    match type_name {
        TypeName::Binary => "application/octet-stream",
        TypeName::Structured => "application/json",
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false)
}

/// Collects `body`, failing once it grows past `limit` bytes.
async fn read_limited(body: Body, limit: usize) -> Result<Bytes> {
    let mut chunks = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = chunks
        .try_next()
        .await
        .map_err(|err| CacheError::InvalidRequest(format!("request body failed: {err}")))?
    {
        if buf.len() + chunk.len() > limit {
            return Err(CacheError::PayloadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn check_key(key: &str) -> Result<()> {
    match validate_key(key) {
        Some(error_msg) => Err(CacheError::InvalidRequest(error_msg)),
        None => Ok(()),
    }
}

/// Handler for HEAD /cache/:key
///
/// 200 when an entry is stored, 404 otherwise. Freshness is not checked.
pub async fn exists_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode> {
    check_key(&key)?;
    if state.cache.exists(&key).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

/// Handler for GET /cache/:key
///
/// Streams the stored value. Expired entries are removed and reported as
/// not found.
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response> {
    check_key(&key)?;
    let entry = state.cache.open(&key).await?;
    let type_name = entry.metadata.type_name;

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static(content_type_for(type_name)),
            ),
            (
                header::HeaderName::from_static(TYPE_HEADER),
                HeaderValue::from_static(type_name.as_str()),
            ),
        ],
        Body::from_stream(entry.body),
    )
        .into_response())
}

/// Handler for PUT /cache/:key
///
/// JSON bodies (up to `max_json_body` bytes) are stored as structured
/// values; any other body is streamed into the cache as binary.
///
/// # Arguments
/// * `query` - optional `ttl` in seconds
pub async fn set_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SetQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<SetResponse>> {
    check_key(&key)?;
    if let Some(error_msg) = query.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }
    let opts = SetOptions { ttl: query.ttl() };

    let type_name = if is_json(&headers) {
        let bytes = read_limited(body, state.max_json_body).await?;
        let value = CacheValue::Structured(serde_json::from_slice(&bytes)?);
        let type_name = value.type_name();
        state.cache.set(&key, value, opts).await?;
        type_name
    } else {
        let mut handle = state.cache.set_stream(&key, opts);
        handle
            .send_all(body.into_data_stream().map_err(io::Error::other))
            .await
            .map_err(|err| match err {
                // The upload itself broke, not the cache
                CacheError::Producer(source) => {
                    CacheError::InvalidRequest(format!("request body failed: {source}"))
                }
                other => other,
            })?;
        TypeName::Binary
    };

    debug!("PUT {} stored as {}", key, type_name);
    Ok(Json(SetResponse::new(
        key,
        type_name.as_str(),
        opts.ttl.map(|ttl| ttl.as_secs_f64()),
    )))
}

/// Handler for DELETE /cache/:key
///
/// Deleting an absent key succeeds.
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>> {
    check_key(&key)?;
    state.cache.del(&key).await?;

    Ok(Json(DeleteResponse::new(key)))
}

/// Handler for GET /health
///
/// Returns health status of the server.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

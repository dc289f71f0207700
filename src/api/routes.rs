//! API Routes
//!
//! Configures the Axum router with all cache server endpoints.

use axum::{
    routing::{get, head},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    delete_handler, exists_handler, get_handler, health_handler, set_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `HEAD /cache/:key` - Check whether a key is stored
/// - `GET /cache/:key` - Stream a stored value
/// - `PUT /cache/:key?ttl=<secs>` - Store a value
/// - `DELETE /cache/:key` - Delete a key
/// - `GET /health` - Health check endpoint
///
/// # Middleware
/// - CORS: Allows any origin
/// - Tracing: Logs all requests
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Explicit HEAD replaces the one GET would otherwise answer
    Router::new()
        .route(
            "/cache/:key",
            head(exists_handler)
                .get(get_handler)
                .put(set_handler)
                .delete(delete_handler),
        )
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

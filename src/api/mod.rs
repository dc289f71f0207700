//! API Module
//!
//! HTTP handlers and routing for the cache server REST API.
//!
//! # Endpoints
//! - `HEAD /cache/:key` - Check whether a key is stored
//! - `GET /cache/:key` - Stream a stored value
//! - `PUT /cache/:key` - Store a value
//! - `DELETE /cache/:key` - Delete a key
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;

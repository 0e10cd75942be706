//! Streaming HTTP gateway in front of an object-storage backend.
//!
//! Requests of the form `/api/{bucket}/{path...}/{verb}` are mapped onto
//! create / read / list / delete / modify operations of an
//! [`ObjectStorage`](services::storage_service::ObjectStorage) backend, with
//! object bytes streamed through in both directions.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::storage_service::SharedStorage;

/// The full gateway router with `storage` installed as shared state.
pub fn app(storage: SharedStorage) -> Router {
    routes::routes::routes().with_state(storage)
}

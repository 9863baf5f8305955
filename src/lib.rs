//! Offline-first tab synchronization for point-of-sale devices.
//!
//! Staff actions commit to the on-device [`store::LocalStore`] and return at
//! once. The [`sync::SyncEngine`] replays the queued mutations against the
//! remote authority, and the [`sync::RealtimeMergeListener`] folds the
//! authority's change feed back in without clobbering unsent work.

pub mod api;
pub mod cli;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod identity;
pub mod model;
pub mod remote;
pub mod service;
pub mod sse;
pub mod store;
pub mod sync;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use service::TabService;

/// The local UI API: tab actions, sync status and the snapshot stream.
pub fn create_router(service: TabService) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .merge(api::router(service.clone()))
        .merge(sse::router(service))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

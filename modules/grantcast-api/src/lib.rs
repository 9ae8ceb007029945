//! Inbound HTTP surface: content submission, bulk submission, and
//! embedding deletion, all acknowledged by enqueueing onto the durable
//! queues. Processing happens in the pipeline workers.

pub mod rest;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use grantcast_store::queue::JobQueue;

pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub api_key: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(rest::health))
        .route("/add-job", post(rest::add_job))
        .route("/bulk-add-job", post(rest::bulk_add_job))
        .route("/delete-embedding", post(rest::delete_embedding))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

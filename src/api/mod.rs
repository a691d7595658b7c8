//! Pipeline agent control API
//!
//! HTTP handlers and router assembly

pub mod health;
pub mod pipelines;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health & Status
        .merge(health::router())
        // Trigger, runs, approval, logs
        .merge(pipelines::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

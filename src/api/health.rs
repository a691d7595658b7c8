//! Health API
//!
//! GET /health, GET /status

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    main_branch: String,
    deploy_gate: String,
    services: Vec<String>,
    active_runs: usize,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(health_check))
}

/// No auth required
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pipeline = &state.pipeline;
    Json(HealthResponse {
        status: "ok",
        service: "relay-stack-agent",
        version: VERSION,
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: state.uptime_secs(),
        main_branch: pipeline.config().main_branch.clone(),
        deploy_gate: format!("{:?}", pipeline.config().gate).to_lowercase(),
        services: pipeline
            .descriptor()
            .services()
            .iter()
            .map(|s| s.name.clone())
            .collect(),
        active_runs: pipeline.runs().active_count().await,
    })
}

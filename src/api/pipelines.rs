//! Pipeline control API
//!
//! /pipelines/trigger, /runs/*, /runs/:run_id/logs/stream

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

use crate::domain::pipeline::{LogLine, PipelineRun, PipelineState, TriggerRequest};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub run_id: String,
    pub state: PipelineState,
    pub stream_url: String,
}

#[derive(Debug, Deserialize)]
pub struct RunHistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// e.g. `failed`, `awaiting_approval`
    pub state: Option<PipelineState>,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct RunHistoryResponse {
    pub runs: Vec<PipelineRun>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RunActionResponse {
    pub run_id: String,
    pub state: PipelineState,
    pub message: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/pipelines/trigger", post(trigger_pipeline))
        .route("/runs/recent", get(get_recent_runs))
        .route("/runs/:run_id", get(get_run))
        .route("/runs/:run_id/approve", post(approve_run))
        .route("/runs/:run_id/cancel", post(cancel_run))
        .route("/runs/:run_id/logs/stream", get(stream_logs))
}

/// POST /pipelines/trigger
///
/// Push webhook. Requires the API key; only the main branch starts a run.
async fn trigger_pipeline(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<impl IntoResponse> {
    let run = state.pipeline.trigger(request).await?;

    Ok(Json(TriggerResponse {
        stream_url: format!("/runs/{}/logs/stream", run.id),
        run_id: run.id,
        state: run.state,
    }))
}

/// GET /runs/:run_id
///
/// Active runs and history alike
async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run = state
        .pipeline
        .runs()
        .get_any(&run_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Run '{}'", run_id)))?;

    Ok(Json(run))
}

/// GET /runs/recent
async fn get_recent_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunHistoryQuery>,
) -> impl IntoResponse {
    let runs = state
        .pipeline
        .runs()
        .recent(query.limit, query.state)
        .await;
    let total = runs.len();

    Json(RunHistoryResponse { runs, total })
}

/// POST /runs/:run_id/approve
async fn approve_run(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run = state.pipeline.approve(&run_id).await?;

    Ok(Json(RunActionResponse {
        run_id: run.id,
        state: run.state,
        message: "Rollout approved".to_string(),
    }))
}

/// POST /runs/:run_id/cancel
///
/// Only before the rollout starts
async fn cancel_run(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run = state.pipeline.cancel(&run_id).await?;

    Ok(Json(RunActionResponse {
        run_id: run.id,
        state: run.state,
        message: "Cancellation requested".to_string(),
    }))
}

fn log_event(line: &LogLine) -> Event {
    let json = serde_json::to_string(line).unwrap_or_default();
    Event::default().data(json)
}

/// GET /runs/:run_id/logs/stream
///
/// Replays buffered lines, follows live output, then sends a `complete` event
/// with the final state.
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let log = state
        .pipeline
        .logs()
        .get(&run_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Run '{}' logs", run_id)))?;

    let (backlog, mut rx) = log.subscribe();
    let mut finished = log.watch_finished();
    let state_clone = state.clone();

    let stream = async_stream::stream! {
        for line in &backlog {
            yield Ok(log_event(line));
        }

        loop {
            let done = *finished.borrow();
            if done {
                break;
            }
            let next = tokio::select! {
                msg = rx.recv() => Some(msg),
                _ = finished.changed() => None,
            };
            match next {
                Some(Ok(line)) => yield Ok(log_event(&line)),
                Some(Err(RecvError::Lagged(n))) => {
                    warn!(run_id = %run_id, lagged = n, "Log subscriber lagged");
                }
                Some(Err(RecvError::Closed)) => break,
                // flag flipped (or sender gone); re-checked at the top
                None => {
                    if !log.is_finished() {
                        break;
                    }
                }
            }
        }

        // lines emitted before the finish flag
        loop {
            match rx.try_recv() {
                Ok(line) => yield Ok(log_event(&line)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }

        if let Some(run) = state_clone.pipeline.runs().get_any(&run_id).await {
            yield Ok(Event::default().event("complete").data(
                serde_json::json!({
                    "state": run.state,
                    "error": run.error,
                }).to_string()
            ));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}

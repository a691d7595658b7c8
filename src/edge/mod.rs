//! Edge router
//!
//! Single entry point: every request is matched against the routing table.
//! Upstream rules are proxied, everything else falls through to the static
//! asset service.

pub mod assets;
pub mod proxy;

use axum::{
    extract::{Request, State},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    Router,
};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::config::RouterConfig;
use crate::domain::route::{RouteTableError, RouteTarget, RoutingTable};

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("invalid routing table: {0}")]
    Routes(#[from] RouteTableError),

    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Shared by all edge requests
pub struct EdgeState {
    pub table: RoutingTable,
    pub client: reqwest::Client,
    pub config: RouterConfig,
}

impl EdgeState {
    pub fn new(config: RouterConfig) -> Result<Self, EdgeError> {
        let table = RoutingTable::standard(&config.backend_url)?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.upstream_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self {
            table,
            client,
            config,
        })
    }
}

/// Build the edge app; serve it with `into_make_service_with_connect_info`
/// so the client address reaches the upstream headers
pub fn router(config: RouterConfig) -> Result<Router, EdgeError> {
    let assets = assets::service(&config);
    let state = Arc::new(EdgeState::new(config)?);

    for rule in state.table.rules() {
        tracing::info!(prefix = %rule.prefix, target = ?rule.target, "Route");
    }

    Ok(Router::new()
        .fallback_service(assets)
        .layer(from_fn_with_state(state, route_request))
        .layer(TraceLayer::new_for_http()))
}

async fn route_request(State(state): State<Arc<EdgeState>>, req: Request, next: Next) -> Response {
    let rule = state.table.resolve(req.uri().path());
    match rule.target {
        RouteTarget::Upstream(ref upstream) => proxy::forward(&state, upstream, req)
            .await
            .unwrap_or_else(|e| e.into_response()),
        RouteTarget::StaticRoot => next.run(req).await,
    }
}

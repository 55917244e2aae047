//! Port allocation API
//!
//! One read-style operation: `GET /port` hands the caller the next usable
//! local port for a reverse tunnel, as plain-text decimal. The caller's
//! address is recorded as a correlation hint on the pending reservation;
//! it is not assumed to be the eventual SSH peer. Exhaustion maps to a
//! distinct failure status, never a success with a misleading body.

pub mod models;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use sockspool_control::{ControlError, PortBroker, ProxyRegistry};

use crate::models::{ErrorResponse, HealthResponse};

/// Immutable handle injected into request handlers
///
/// Holds only the broker and registry interfaces the handlers need; no live
/// reference to the rest of the load balancer reaches the request path.
pub struct AppState {
    pub broker: Arc<PortBroker>,
    pub registry: Arc<ProxyRegistry>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/port", get(allocate_port))
        .route("/healthz", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the allocation API until the task is dropped
pub async fn serve(bind_addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "allocation API listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Reserve the next usable port for the calling host
async fn allocate_port(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    let caller = addr.ip().to_string();
    debug!(caller = %caller, "port allocation request");

    // the port scan probes local sockets; keep it off the async workers
    let broker = state.broker.clone();
    let allocation = tokio::task::spawn_blocking(move || broker.allocate(&caller)).await;

    match allocation {
        Ok(Ok(port)) => Ok(port.to_string()),
        Ok(Err(exhausted @ ControlError::AllocationExhausted { .. })) => {
            warn!(error = %exhausted, "port allocation failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: exhausted.to_string(),
                    code: Some("ALLOCATION_EXHAUSTED".to_string()),
                }),
            ))
        }
        Ok(Err(other)) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: other.to_string(),
                code: None,
            }),
        )),
        Err(join_error) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: join_error.to_string(),
                code: None,
            }),
        )),
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        pending: state.registry.pending_count(),
        active: state.registry.active_count(),
    })
}

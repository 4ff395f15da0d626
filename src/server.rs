//! HTTP surface: liveness, run lookup and transition-policy queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::{ErrorKind, StoreError};
use crate::models::{Run, RunState};
use crate::policy;
use crate::processor::{ConsumerStatus, ProcessorHandle, StatsSnapshot};
use crate::store::RunStateStore;

pub struct AppState {
    pub store: Arc<dyn RunStateStore>,
    pub processor: Arc<ProcessorHandle>,
}

pub type SharedState = Arc<AppState>;

/// Error body with a status derived from its [`ErrorKind`].
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(serde_json::json!({
                "error": self.message,
                "kind": format!("{:?}", self.kind),
            })),
        )
            .into_response()
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runs/{run_id}", get(get_run))
        .route("/transitions", get(transitions))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub consumers: BTreeMap<String, ConsumerStatus>,
    pub stats: StatsSnapshot,
    pub active_runs: Option<usize>,
}

async fn health(State(state): State<SharedState>) -> (StatusCode, Json<HealthReport>) {
    let consumers = state
        .processor
        .liveness()
        .into_iter()
        .map(|(source, status)| (source.to_string(), status))
        .collect();
    let active_runs = state.store.count().await.ok();
    let healthy = state.processor.is_alive() && active_runs.is_some();

    let report = HealthReport {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        consumers,
        stats: state.processor.stats(),
        active_runs,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    state
        .store
        .get(&run_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, format!("Run {} not found", run_id)))
}

#[derive(Debug, Deserialize)]
struct TransitionQuery {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransitionAnswer {
    pub from: RunState,
    pub to: Option<RunState>,
    pub resolved: Option<RunState>,
    pub allowed: Vec<RunState>,
}

fn parse_state(field: &str, raw: &str) -> Result<RunState, ApiError> {
    raw.parse()
        .map_err(|e: String| ApiError::new(ErrorKind::BadRequest, format!("{}: {}", field, e)))
}

async fn transitions(Query(query): Query<TransitionQuery>) -> Result<Json<TransitionAnswer>, ApiError> {
    let from = query
        .from
        .as_deref()
        .ok_or_else(|| ApiError::new(ErrorKind::BadRequest, "missing `from` state"))?;
    let from = parse_state("from", from)?;
    let allowed = policy::allowed_targets(from).to_vec();

    let Some(to) = query.to.as_deref() else {
        return Ok(Json(TransitionAnswer {
            from,
            to: None,
            resolved: None,
            allowed,
        }));
    };
    let to = parse_state("to", to)?;
    let resolved = policy::next_state(from, to).ok_or_else(|| {
        ApiError::new(
            ErrorKind::InvalidTransition,
            format!("No transition from {} to {}", from, to),
        )
    })?;

    Ok(Json(TransitionAnswer {
        from,
        to: Some(to),
        resolved: Some(resolved),
        allowed,
    }))
}

/// Serve until `shutdown` is cancelled.
pub async fn start_server(addr: &str, state: SharedState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "http server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Server error")?;

    info!("http server stopped");
    Ok(())
}

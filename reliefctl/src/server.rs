//! HTTP API around a shared [`PlanningCoordinator`].
//!
//! Event ingestion and planning run on the blocking pool; read-only routes
//! only hold the store lock long enough to clone what they return.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use relief_core::{
    AssetType, Depot, DisasterEvent, IngestOutcome, PlanError, PlanningCoordinator,
    ReconcileError, RejectedEvent, ReplanTicket, StoreSnapshot, Zone,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ApiState {
    coordinator: Arc<PlanningCoordinator>,
}

impl ApiState {
    pub fn new(coordinator: Arc<PlanningCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Reconcile(ReconcileError),
    Plan(PlanError),
    /// Accepted at ingest, refused when applied.
    Rejected(RejectedEvent),
    Join(JoinError),
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        ApiError::Reconcile(err)
    }
}

impl From<PlanError> for ApiError {
    fn from(err: PlanError) -> Self {
        ApiError::Plan(err)
    }
}

impl From<JoinError> for ApiError {
    fn from(err: JoinError) -> Self {
        ApiError::Join(err)
    }
}

fn status_for_code(code: &str) -> StatusCode {
    match code {
        "conflict" | "stale" => StatusCode::CONFLICT,
        "store" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Reconcile(err) => (status_for_code(err.code()), err.code(), err.to_string()),
            ApiError::Rejected(rejected) => (
                status_for_code(rejected.code),
                rejected.code,
                rejected.reason,
            ),
            ApiError::Plan(err) => {
                let (status, code) = match &err {
                    PlanError::StaleSnapshot { .. } => (StatusCode::CONFLICT, "stale_snapshot"),
                    PlanError::Inconsistent { .. } => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "inconsistent_plan")
                    }
                    PlanError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store"),
                };
                (status, code, err.to_string())
            }
            ApiError::Join(err) => {
                error!(target: "server", error = %err, "handler task failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
            }
        };
        if status.is_server_error() {
            warn!(target: "server", code, %message, "request failed");
        }
        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub event_id: String,
    pub status: IngestOutcome,
    pub pending: usize,
    pub applied: bool,
}

pub fn router(coordinator: Arc<PlanningCoordinator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(post_event))
        .route("/plan", get(get_plan).post(post_plan))
        .route("/snapshot", get(get_snapshot))
        .route("/depots", get(get_depots))
        .route("/zones", get(get_zones))
        .route("/assets", get(get_assets))
        .with_state(ApiState::new(coordinator))
}

/// Serves until ctrl-c, flushing released events in the background.
pub async fn serve(
    coordinator: Arc<PlanningCoordinator>,
    bind: &str,
    flush_interval: Duration,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(target: "server", addr = %listener.local_addr()?, "relief API listening");

    let flusher = tokio::spawn(Arc::clone(&coordinator).run_flush_loop(flush_interval));
    let result = axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "server", "shutdown requested");
        })
        .await;
    flusher.abort();
    result
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": state.coordinator.read().version(),
        "pending_events": state.coordinator.pending_events(),
        "planning": state.coordinator.is_planning(),
    }))
}

async fn post_event(
    State(state): State<ApiState>,
    Json(event): Json<DisasterEvent>,
) -> Result<(StatusCode, Json<EventAccepted>), ApiError> {
    let coordinator = Arc::clone(&state.coordinator);
    let accepted = tokio::task::spawn_blocking(move || -> Result<EventAccepted, ApiError> {
        let now = Utc::now();
        let receipt = coordinator.submit(event, now)?;
        let report = coordinator.flush(now)?;
        if let Some(rejected) = report
            .rejected
            .into_iter()
            .find(|rejected| rejected.event_id == receipt.event_id)
        {
            return Err(ApiError::Rejected(rejected));
        }
        let applied = report
            .applied
            .iter()
            .any(|outcome| outcome.event_id == receipt.event_id);
        Ok(EventAccepted {
            event_id: receipt.event_id,
            status: receipt.status,
            pending: report.pending,
            applied,
        })
    })
    .await??;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn get_plan(State(state): State<ApiState>) -> Response {
    match state.coordinator.latest_plan() {
        Some(plan) => Json(plan).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn post_plan(State(state): State<ApiState>) -> Result<Json<ReplanTicket>, ApiError> {
    let coordinator = Arc::clone(&state.coordinator);
    let ticket =
        tokio::task::spawn_blocking(move || coordinator.request_replan(Utc::now())).await??;
    Ok(Json(ticket))
}

async fn get_snapshot(State(state): State<ApiState>) -> Json<StoreSnapshot> {
    Json(state.coordinator.snapshot())
}

async fn get_depots(State(state): State<ApiState>) -> Json<Vec<Depot>> {
    Json(state.coordinator.read().depots().cloned().collect())
}

async fn get_zones(State(state): State<ApiState>) -> Json<Vec<Zone>> {
    Json(state.coordinator.read().zones().cloned().collect())
}

async fn get_assets(State(state): State<ApiState>) -> Json<Vec<AssetType>> {
    Json(state.coordinator.read().asset_types().cloned().collect())
}

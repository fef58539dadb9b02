//! HTTP control plane for simrund.
//!
//! Local-only REST API over the run registry, plus a Server-Sent Events
//! stream per run.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream::Stream, StreamExt};
use serde::{Deserialize, Serialize};
use simrun_core::ssh_config::SshConfig;
use simrun_core::{Config, ListScope, RunDescriptor, RunId, RunRecord, RunState, RunSummary, Target};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::controller::CancelOutcome;
use crate::notify::load_preference;
use crate::registry::{RegistryError, RunRegistry};

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub registry: Arc<RunRegistry>,
    pub config: Arc<Config>,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run).delete(purge_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/events", get(stream_events))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn registry_error(err: &RegistryError) -> ApiError {
    let status = match err {
        RegistryError::Validation(_) => StatusCode::BAD_REQUEST,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::StillActive { .. } => StatusCode::CONFLICT,
        RegistryError::Setup(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Request payload for POST /runs.
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    #[serde(flatten)]
    pub descriptor: RunDescriptor,
    /// Host alias resolved through the SSH client configuration. Ignored
    /// when `target` is given explicitly.
    #[serde(default)]
    pub host_alias: Option<String>,
}

/// Response for POST /runs.
#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run_id: RunId,
}

/// Query params for GET /runs.
#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub scope: Option<String>,
}

/// Response for GET /runs.
#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunSummary>,
}

/// Response for GET and DELETE /runs/{id}.
#[derive(Debug, Serialize)]
pub struct GetRunResponse {
    pub run: RunRecord,
}

/// Response for POST /runs/{id}/cancel.
#[derive(Debug, Serialize)]
pub struct CancelRunResponse {
    /// `requested` or `already_completed`.
    pub outcome: &'static str,
    pub state: RunState,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Fill in what the request left to daemon configuration: the target behind
/// a host alias and the saved notification preference.
fn complete_descriptor(config: &Config, req: CreateRunRequest) -> Result<RunDescriptor, ApiError> {
    let mut descriptor = req.descriptor;

    if let Some(alias) = req.host_alias.filter(|_| !descriptor.target.is_remote()) {
        let ssh_config = SshConfig::load(&config.ssh_config_path)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
        let remote = ssh_config
            .resolve(&alias)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
        descriptor.target = Target::Remote(remote);
    }

    if descriptor.notification.is_empty() {
        if let Some(path) = &config.notification_file {
            match load_preference(path) {
                Ok(Some(saved)) => descriptor.notification = saved,
                Ok(None) => {}
                Err(e) => warn!("ignoring saved notification preference: {}", e),
            }
        }
    }

    Ok(descriptor)
}

/// POST /runs - Submit a run.
async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let descriptor = complete_descriptor(&state.config, req)?;
    let run_id = state.registry.submit(descriptor).map_err(|e| {
        warn!("rejected run submission: {}", e);
        registry_error(&e)
    })?;

    Ok((StatusCode::CREATED, Json(CreateRunResponse { run_id })))
}

/// GET /runs - List runs.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let scope = match query.scope.as_deref() {
        Some(raw) => raw
            .parse::<ListScope>()
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?,
        None => ListScope::All,
    };

    Ok(Json(ListRunsResponse {
        runs: state.registry.list_runs(scope),
    }))
}

/// GET /runs/{id} - Full run record.
async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run = state
        .registry
        .get_status(&RunId::from_string(id))
        .map_err(|e| registry_error(&e))?;

    Ok(Json(GetRunResponse { run }))
}

/// DELETE /runs/{id} - Purge a finished run.
async fn purge_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run = state
        .registry
        .purge(&RunId::from_string(id))
        .map_err(|e| registry_error(&e))?;

    info!("purged run: {}", run.id);
    Ok(Json(GetRunResponse { run }))
}

/// POST /runs/{id}/cancel - Cancel a run.
async fn cancel_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = RunId::from_string(id);
    let response = match state.registry.cancel(&run_id).map_err(|e| registry_error(&e))? {
        CancelOutcome::Requested => CancelRunResponse {
            outcome: "requested",
            state: state
                .registry
                .get_status(&run_id)
                .map_or(RunState::Cancelled, |r| r.state),
        },
        CancelOutcome::AlreadyCompleted(state) => CancelRunResponse {
            outcome: "already_completed",
            state,
        },
    };

    Ok(Json(response))
}

/// GET /runs/{id}/events - Stream the run's events (SSE).
///
/// Replays the buffered output tail and current state first; the stream
/// closes after the terminal state event.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;

    let subscription = state
        .registry
        .subscribe(&RunId::from_string(id))
        .map_err(|e| registry_error(&e))?;

    let stream = subscription.into_stream().map(|event| {
        let sse = SseEvent::default()
            .event(event.kind())
            .json_data(&event)
            .unwrap_or_else(|e| SseEvent::default().event("error").data(e.to_string()));
        Ok(sse)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::pipeline::{ErrorReport, ErrorStatistics, ProcessedError};
use crate::registry::RegistryStatus;
use crate::service::GalaxyService;
use crate::workflow::{WorkflowStatusReport, WorkflowSummary};

#[derive(Clone)]
pub struct ServerState {
    pub service: GalaxyService,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub profile: String,
    pub agents: usize,
    pub running_workflows: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub kind: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub start: bool,
}

#[derive(Debug, Serialize)]
pub struct WorkflowStartResponse {
    pub id: String,
    pub started: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProcessErrorRequest {
    pub report: ErrorReport,
    #[serde(default)]
    pub auto_fix: bool,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn check_server_auth(state: &ServerState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(());
    };

    let provided_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .strip_prefix("Bearer ")
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    }
    Ok(())
}

pub async fn handle_server_health(State(state): State<Arc<ServerState>>) -> Json<ServerHealthResponse> {
    let service = &state.service;
    Json(ServerHealthResponse {
        status: "ok",
        profile: service.cfg.profile.clone(),
        agents: service.registry.agents().await.len(),
        running_workflows: service.orchestrator.running_count().await,
    })
}

pub async fn handle_list_agents(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> ApiResult<RegistryStatus> {
    check_server_auth(&state, &headers)?;
    Ok(Json(state.service.registry.status().await))
}

pub async fn handle_list_workflows(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<WorkflowSummary>> {
    check_server_auth(&state, &headers)?;
    Ok(Json(state.service.orchestrator.list_workflows().await))
}

pub async fn handle_create_workflow(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<CreateWorkflowRequest>,
) -> ApiResult<WorkflowStartResponse> {
    check_server_auth(&state, &headers)?;
    let orchestrator = &state.service.orchestrator;
    let id = orchestrator
        .create_workflow(request.kind.trim(), request.context)
        .await
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    let started = request.start && orchestrator.start_workflow(&id).await;
    Ok(Json(WorkflowStartResponse { id, started }))
}

pub async fn handle_get_workflow(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<WorkflowStatusReport> {
    check_server_auth(&state, &headers)?;
    state
        .service
        .orchestrator
        .workflow_status(&id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Unknown workflow: {id}")))
}

pub async fn handle_cancel_workflow(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<WorkflowStatusReport> {
    check_server_auth(&state, &headers)?;
    let orchestrator = &state.service.orchestrator;
    if orchestrator.workflow(&id).await.is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("Unknown workflow: {id}")));
    }
    if !orchestrator.cancel_workflow(&id).await {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("workflow {id} is not running"),
        ));
    }
    orchestrator
        .workflow_status(&id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Unknown workflow: {id}")))
}

pub async fn handle_resume_workflow(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<WorkflowStartResponse> {
    check_server_auth(&state, &headers)?;
    match state.service.orchestrator.resume_workflow(&id).await {
        Ok(started) => Ok(Json(WorkflowStartResponse { id, started })),
        Err(err) => {
            let message = err.to_string();
            let status = if message.starts_with("Unknown workflow") {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::CONFLICT
            };
            Err(api_error(status, message))
        }
    }
}

pub async fn handle_process_error(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<ProcessErrorRequest>,
) -> ApiResult<ProcessedError> {
    check_server_auth(&state, &headers)?;
    if request.report.message.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "report.message cannot be empty for /v1/errors",
        ));
    }
    state
        .service
        .pipeline
        .process_error(&request.report, request.auto_fix)
        .await
        .map(Json)
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))
}

pub async fn handle_error_stats(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> ApiResult<ErrorStatistics> {
    check_server_auth(&state, &headers)?;
    Ok(Json(state.service.pipeline.statistics().await))
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/v1/agents", get(handle_list_agents))
        .route(
            "/v1/workflows",
            get(handle_list_workflows).post(handle_create_workflow),
        )
        .route("/v1/workflows/{id}", get(handle_get_workflow))
        .route("/v1/workflows/{id}/cancel", post(handle_cancel_workflow))
        .route("/v1/workflows/{id}/resume", post(handle_resume_workflow))
        .route("/v1/errors", post(handle_process_error))
        .route("/v1/errors/stats", get(handle_error_stats))
        .with_state(state)
}

pub async fn run_server(service: GalaxyService, host: String, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{host}:{port}'"))?;

    let background = service.spawn_background();
    let state = Arc::new(ServerState {
        auth_token: service.cfg.server_auth_token.clone(),
        service: service.clone(),
    });

    service.telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "profile": service.cfg.profile,
            "auth": state.auth_token.is_some(),
        }),
    );
    println!(
        "galaxy-bridge listening on http://{addr} (health: /healthz, workflows: /v1/workflows, errors: /v1/errors)"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    let served = axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed");

    background.abort_all();
    service.shutdown()?;
    served
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}

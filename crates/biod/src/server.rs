//! HTTP control plane for biod.
//!
//! Local-only REST API over the run controller and the workflow planner.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bio_core::{Id, Run, RunStatus, Workflow};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::controller::{Controller, ControllerError, CreatedRun, WorkflowExecution};
use crate::executor::ExecutorError;
use crate::planner::{Planner, PlannerError};

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub controller: Arc<Controller>,
    /// `None` when no API key is configured.
    pub planner: Option<Arc<Planner>>,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/start", post(start_run))
        .route("/runs/{id}/rerun", post(rerun))
        .route("/workflows/generate", post(generate_workflow))
        .route("/workflows/refine", post(refine_workflow))
        .route("/workflows/execute", post(execute_workflow))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    // Local only.
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

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

/// Map controller failures onto HTTP statuses.
fn controller_error(e: ControllerError) -> ApiError {
    let status = match &e {
        ControllerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ControllerError::RunNotFound(_) => StatusCode::NOT_FOUND,
        ControllerError::NotPending { .. } => StatusCode::CONFLICT,
        ControllerError::Executor(ExecutorError::ExternalTool(_)) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("request failed: {}", e);
    } else {
        warn!("request rejected: {}", e);
    }
    api_error(status, e.to_string())
}

fn planner_error(e: PlannerError) -> ApiError {
    let status = match &e {
        PlannerError::MissingApiKey => StatusCode::SERVICE_UNAVAILABLE,
        PlannerError::Request(_) | PlannerError::Api { .. } | PlannerError::Malformed(_) => {
            StatusCode::BAD_GATEWAY
        }
    };
    warn!("planner request failed: {}", e);
    api_error(status, e.to_string())
}

fn planner(state: &AppState) -> Result<&Planner, ApiError> {
    state.planner.as_deref().ok_or_else(|| {
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            PlannerError::MissingApiKey.to_string(),
        )
    })
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
    pub input_files: Vec<String>,
    #[serde(default)]
    pub tool: Option<String>,
}

/// Response for POST /runs and POST /runs/{id}/rerun.
#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run: Run,
    /// Inputs that did not exist and were not copied.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_inputs: Vec<String>,
}

impl From<CreatedRun> for CreateRunResponse {
    fn from(created: CreatedRun) -> Self {
        Self {
            run: created.run,
            skipped_inputs: created.skipped_inputs,
        }
    }
}

/// Query params for GET /runs.
#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

/// Response for GET /runs.
#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
}

/// Response for GET /runs/{id} and POST /runs/{id}/start.
#[derive(Debug, Serialize)]
pub struct GetRunResponse {
    pub run: Run,
}

/// Request payload for POST /workflows/generate.
#[derive(Debug, Deserialize)]
pub struct GenerateWorkflowRequest {
    #[serde(default)]
    pub request: String,
}

/// Request payload for POST /workflows/refine.
#[derive(Debug, Deserialize)]
pub struct RefineWorkflowRequest {
    pub workflow: Workflow,
    #[serde(default)]
    pub feedback: String,
}

/// Response for workflow endpoints.
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub workflow: Workflow,
}

/// Request payload for POST /workflows/execute.
#[derive(Debug, Deserialize)]
pub struct ExecuteWorkflowRequest {
    pub workflow: Workflow,
    pub input_files: Vec<String>,
}

/// Response for POST /workflows/execute.
#[derive(Debug, Serialize)]
pub struct ExecuteWorkflowResponse {
    /// One run per executed step; a failed run is always the last one.
    pub runs: Vec<Run>,
    pub completed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_inputs: Vec<String>,
}

impl From<WorkflowExecution> for ExecuteWorkflowResponse {
    fn from(execution: WorkflowExecution) -> Self {
        Self {
            runs: execution.runs,
            completed: execution.completed,
            skipped_inputs: execution.skipped_inputs,
        }
    }
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /runs - Create a new pending run.
async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let created = state
        .controller
        .create_run(req.input_files, req.tool)
        .await
        .map_err(controller_error)?;

    Ok((StatusCode::CREATED, Json(CreateRunResponse::from(created))))
}

/// GET /runs - List runs, newest first.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let status = query
        .status
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let runs = state
        .controller
        .list_runs(status)
        .await
        .map_err(controller_error)?;

    Ok(Json(ListRunsResponse { runs }))
}

/// GET /runs/{id} - Get a single run.
async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run = state
        .controller
        .get_run(&Id::from_string(id))
        .await
        .map_err(controller_error)?;

    Ok(Json(GetRunResponse { run }))
}

/// POST /runs/{id}/start - Execute a pending run in the background.
async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = Id::from_string(id);
    let run = state
        .controller
        .ensure_pending(&run_id)
        .await
        .map_err(controller_error)?;

    let controller = Arc::clone(&state.controller);
    tokio::spawn(async move {
        match controller.start_run(&run_id).await {
            Ok(outcome) => info!(
                run_id = %run_id,
                steps = outcome.steps_completed,
                duration_ms = outcome.duration_ms,
                "run finished"
            ),
            Err(e) => warn!(run_id = %run_id, error = %e, "run did not complete"),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(GetRunResponse { run })))
}

/// POST /runs/{id}/rerun - Create a fresh run with the same inputs and tool.
async fn rerun(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let created = state
        .controller
        .rerun(&Id::from_string(id))
        .await
        .map_err(controller_error)?;

    Ok((StatusCode::CREATED, Json(CreateRunResponse::from(created))))
}

/// POST /workflows/generate - Draft a workflow from a free-text request.
async fn generate_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<GenerateWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    if req.request.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "request must not be empty"));
    }
    let workflow = planner(&state)?
        .generate(&req.request)
        .await
        .map_err(planner_error)?;

    Ok(Json(WorkflowResponse { workflow }))
}

/// POST /workflows/refine - Revise a workflow with user feedback.
async fn refine_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RefineWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    if req.feedback.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "feedback must not be empty"));
    }
    let workflow = planner(&state)?
        .refine(&req.workflow, &req.feedback)
        .await
        .map_err(planner_error)?;

    Ok(Json(WorkflowResponse { workflow }))
}

/// POST /workflows/execute - Run each workflow step as its own run, in order.
///
/// Responds once the workflow has finished or stopped at a failed step. Does
/// not need the planner.
async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ExecuteWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let execution = state
        .controller
        .execute_workflow(&req.workflow, req.input_files)
        .await
        .map_err(controller_error)?;
    info!(
        runs = execution.runs.len(),
        completed = execution.completed,
        "workflow executed"
    );

    Ok(Json(ExecuteWorkflowResponse::from(execution)))
}

//! HTTP client for the biod daemon.

use bio_core::types::{Run, RunStatus};
use bio_core::Workflow;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: biod\n  → or set BIOD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: check BIOD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error("workflow planner unavailable: {0}")]
    PlannerUnavailable(String),

    #[error("daemon not ready after {timeout_ms}ms at {addr}\n  → ensure biod is running")]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for creating a run (POST /runs).
#[derive(Debug, Serialize)]
pub struct CreateRunRequest {
    pub input_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// Response from create and rerun endpoints.
#[derive(Debug, Deserialize)]
pub struct CreateRunResponse {
    pub run: Run,
    #[serde(default)]
    pub skipped_inputs: Vec<String>,
}

/// Response from POST /workflows/execute.
#[derive(Debug, Deserialize)]
pub struct ExecuteWorkflowResponse {
    pub runs: Vec<Run>,
    pub completed: bool,
    #[serde(default)]
    pub skipped_inputs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListRunsResponse {
    runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
struct GetRunResponse {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct WorkflowResponse {
    workflow: Workflow,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Default total timeout for the daemon readiness check.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness check.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for biod.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Check /health; Err if the connection failed.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon with exponential backoff (200ms start, 5s total).
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;

                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        match status {
            404 => ClientError::NotFound(message),
            409 => ClientError::Conflict(message),
            503 => ClientError::PlannerUnavailable(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// POST /runs
    pub async fn create_run(
        &self,
        req: CreateRunRequest,
    ) -> Result<CreateRunResponse, ClientError> {
        let url = format!("{}/runs", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&req)
            .send()
            .await?;
        self.decode(response).await
    }

    /// GET /runs?status=...
    pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<Run>, ClientError> {
        let mut url = format!("{}/runs", self.base_url);
        if let Some(s) = status {
            url = format!("{}?status={}", url, urlencoding::encode(s.as_str()));
        }
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: ListRunsResponse = self.decode(response).await?;
        Ok(body.runs)
    }

    /// GET /runs/{id}
    pub async fn get_run(&self, run_id: &str) -> Result<Run, ClientError> {
        let url = format!("{}/runs/{}", self.base_url, urlencoding::encode(run_id));
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: GetRunResponse = self.decode(response).await?;
        Ok(body.run)
    }

    /// POST /runs/{id}/start
    pub async fn start_run(&self, run_id: &str) -> Result<Run, ClientError> {
        let url = format!("{}/runs/{}/start", self.base_url, urlencoding::encode(run_id));
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        let body: GetRunResponse = self.decode(response).await?;
        Ok(body.run)
    }

    /// POST /runs/{id}/rerun
    pub async fn rerun(&self, run_id: &str) -> Result<CreateRunResponse, ClientError> {
        let url = format!("{}/runs/{}/rerun", self.base_url, urlencoding::encode(run_id));
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        self.decode(response).await
    }

    /// POST /workflows/generate
    pub async fn generate_workflow(&self, request: &str) -> Result<Workflow, ClientError> {
        let url = format!("{}/workflows/generate", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "request": request }))
            .send()
            .await?;
        let body: WorkflowResponse = self.decode(response).await?;
        Ok(body.workflow)
    }

    /// POST /workflows/refine
    pub async fn refine_workflow(
        &self,
        workflow: &Workflow,
        feedback: &str,
    ) -> Result<Workflow, ClientError> {
        let url = format!("{}/workflows/refine", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "workflow": workflow, "feedback": feedback }))
            .send()
            .await?;
        let body: WorkflowResponse = self.decode(response).await?;
        Ok(body.workflow)
    }

    /// POST /workflows/execute
    pub async fn execute_workflow(
        &self,
        workflow: &Workflow,
        input_files: Vec<String>,
    ) -> Result<ExecuteWorkflowResponse, ClientError> {
        let url = format!("{}/workflows/execute", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "workflow": workflow, "input_files": input_files }))
            .send()
            .await?;
        self.decode(response).await
    }
}

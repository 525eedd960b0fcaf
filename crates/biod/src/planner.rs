//! Workflow planner backed by an OpenAI-compatible chat completions endpoint.
//!
//! The planner only drafts workflows; it never touches the run store.

use std::fmt;
use std::time::Duration;

use bio_core::prompt::{generate_prompt, refine_prompt};
use bio_core::{parse_workflow, Config, ModuleCatalog, Workflow, WorkflowError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable holding the planner API key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("planner API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Malformed(#[from] WorkflowError),
    #[error("planner API key not set (export {API_KEY_ENV})")]
    MissingApiKey,
}

pub type Result<T> = std::result::Result<T, PlannerError>;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone)]
pub struct Planner {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    catalog: ModuleCatalog,
}

// The API key never appears in debug output.
impl fmt::Debug for Planner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Planner")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("modules", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

impl Planner {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        catalog: ModuleCatalog,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
            catalog,
        })
    }

    /// Build from config, reading the API key from the environment.
    pub fn from_config(config: &Config, catalog: ModuleCatalog) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(PlannerError::MissingApiKey)?;
        Self::new(
            config.planner_endpoint.clone(),
            config.planner_model.clone(),
            api_key,
            catalog,
        )
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    /// Draft a workflow for a free-text analysis request.
    pub async fn generate(&self, request: &str) -> Result<Workflow> {
        let prompt = generate_prompt(request, &self.catalog);
        let workflow = self.plan(&prompt).await?;
        info!(steps = workflow.steps.len(), "workflow generated");
        Ok(workflow)
    }

    /// Revise `workflow` according to user feedback.
    pub async fn refine(&self, workflow: &Workflow, feedback: &str) -> Result<Workflow> {
        let prompt = refine_prompt(workflow, feedback, &self.catalog);
        let refined = self.plan(&prompt).await?;
        info!(steps = refined.steps.len(), "workflow refined");
        Ok(refined)
    }

    async fn plan(&self, prompt: &str) -> Result<Workflow> {
        let reply = self.complete(prompt).await?;
        let workflow = parse_workflow(&reply)?;
        for tool in workflow.tools() {
            if self.catalog.get(tool).is_none() {
                warn!(tool = tool, "planner proposed a module outside the catalog");
            }
        }
        Ok(workflow)
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.2,
        };

        debug!(endpoint = %self.endpoint, model = %self.model, "sending planner request");
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PlannerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let chat: ChatResponse = response.json().await?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                PlannerError::Malformed(WorkflowError::MalformedResponse(
                    "reply has no message content".to_string(),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    /// Serve `reply` as the assistant message from a local fake endpoint.
    async fn fake_endpoint(status: StatusCode, reply: Value) -> String {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let reply = reply.clone();
                async move {
                    assert_eq!(
                        headers.get("authorization").unwrap(),
                        "Bearer test-key"
                    );
                    assert_eq!(body["model"], "test-model");
                    assert_eq!(body["messages"][0]["role"], "user");
                    (status, Json(reply))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1/chat/completions")
    }

    fn chat_reply(content: &str) -> Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    fn planner(endpoint: String) -> Planner {
        Planner::new(endpoint, "test-model", "test-key", ModuleCatalog::builtin()).unwrap()
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let planner = Planner::new(
            "http://127.0.0.1:9/v1/chat/completions",
            "test-model",
            "sk-very-secret",
            ModuleCatalog::builtin(),
        )
        .unwrap();

        let debug = format!("{planner:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("<redacted>"));
        assert!(debug.contains("test-model"));
    }

    #[tokio::test]
    async fn generate_parses_fenced_reply() {
        let content = "Here is a plan:\n```json\n{\"steps\": [{\"tool\": \"FastQC\", \"params\": {\"threads\": 4}}, {\"tool\": \"BWA\"}]}\n```";
        let endpoint = fake_endpoint(StatusCode::OK, chat_reply(content)).await;

        let workflow = planner(endpoint)
            .generate("quality control then alignment")
            .await
            .unwrap();
        assert_eq!(workflow.tools(), vec!["FastQC", "BWA"]);
        assert_eq!(workflow.steps[0].params["threads"], 4);
        assert!(workflow.steps[1].params.is_empty());
    }

    #[tokio::test]
    async fn prose_reply_is_malformed() {
        let endpoint =
            fake_endpoint(StatusCode::OK, chat_reply("I cannot help with that.")).await;
        let err = planner(endpoint).generate("anything").await.unwrap_err();
        assert!(matches!(err, PlannerError::Malformed(_)));
    }

    #[tokio::test]
    async fn missing_choices_is_malformed() {
        let endpoint = fake_endpoint(StatusCode::OK, json!({"choices": []})).await;
        let err = planner(endpoint).generate("anything").await.unwrap_err();
        assert!(matches!(err, PlannerError::Malformed(_)));
    }

    #[tokio::test]
    async fn api_error_status_is_reported() {
        let endpoint = fake_endpoint(
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": {"message": "rate limited"}}),
        )
        .await;
        let err = planner(endpoint).generate("anything").await.unwrap_err();
        match err {
            PlannerError::Api { status, message } => {
                assert_eq!(status, 429);
                assert!(message.contains("rate limited"));
            }
            e => panic!("expected Api error, got {e:?}"),
        }
    }

    #[tokio::test]
    async fn refine_returns_new_workflow() {
        let content = r#"{"steps": [{"tool": "FastQC"}, {"tool": "GATK", "params": {"mode": "HaplotypeCaller"}}]}"#;
        let endpoint = fake_endpoint(StatusCode::OK, chat_reply(content)).await;
        let current = parse_workflow(r#"{"steps": [{"tool": "FastQC"}]}"#).unwrap();

        let refined = planner(endpoint)
            .refine(&current, "add variant calling")
            .await
            .unwrap();
        assert_eq!(refined.tools(), vec!["FastQC", "GATK"]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_request_error() {
        // Port 9 (discard) on localhost is not expected to accept HTTP.
        let err = planner("http://127.0.0.1:9/v1/chat/completions".to_string())
            .generate("anything")
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Request(_)));
    }
}

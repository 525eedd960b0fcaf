//! Workflow schema and parsing of planner replies.
//!
//! The planner model is asked for a JSON object of the form
//! `{"steps": [{"tool": "...", "params": {...}}]}`. Replies often wrap the
//! object in a fenced code block or surround it with prose, so parsing first
//! scrapes out the outermost JSON value and then validates the schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error type for workflow parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("malformed planner response: {0}")]
    MalformedResponse(String),
}

/// One proposed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Tool or module name (e.g. `FastQC`).
    #[serde(alias = "module")]
    pub tool: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// An ordered list of proposed steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Workflow {
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    /// Tool names in step order.
    pub fn tools(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.tool.as_str()).collect()
    }
}

/// Parse a planner reply into a validated workflow.
pub fn parse_workflow(text: &str) -> Result<Workflow, WorkflowError> {
    let json = extract_json(text)
        .ok_or_else(|| WorkflowError::MalformedResponse("no JSON object found".to_string()))?;

    let value: Value = serde_json::from_str(json)
        .map_err(|e| WorkflowError::MalformedResponse(format!("invalid JSON: {e}")))?;

    // A bare array is accepted as the step list.
    let value = match value {
        Value::Array(steps) => serde_json::json!({ "steps": steps }),
        other => other,
    };

    let workflow: Workflow = serde_json::from_value(value)
        .map_err(|e| WorkflowError::MalformedResponse(format!("schema mismatch: {e}")))?;

    validate(&workflow)?;
    Ok(workflow)
}

fn validate(workflow: &Workflow) -> Result<(), WorkflowError> {
    if workflow.steps.is_empty() {
        return Err(WorkflowError::MalformedResponse(
            "workflow has no steps".to_string(),
        ));
    }
    for (idx, step) in workflow.steps.iter().enumerate() {
        if step.tool.trim().is_empty() {
            return Err(WorkflowError::MalformedResponse(format!(
                "step {} has an empty tool name",
                idx + 1
            )));
        }
    }
    Ok(())
}

/// Locate the JSON payload inside a model reply.
///
/// Prefers the body of the first fenced code block; otherwise takes the span
/// from the first `{` or `[` to the matching last `}` or `]`.
fn extract_json(text: &str) -> Option<&str> {
    let body = fenced_body(text).unwrap_or(text);

    let start = body.find(&['{', '['][..])?;
    let close = if body.as_bytes()[start] == b'{' { '}' } else { ']' };
    let end = body.rfind(close)?;
    (end > start).then(|| &body[start..=end])
}

fn fenced_body(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    // Skip the info string (e.g. `json`) on the opening fence line.
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

//! Prompt assembly for the workflow planner.

use crate::catalog::ModuleCatalog;
use crate::workflow::Workflow;

/// Instructions appended to every planner prompt so replies stay parseable.
const REPLY_FORMAT: &str = "Reply with a single JSON object and nothing else, shaped as:\n\
{\"steps\": [{\"tool\": \"<module name>\", \"params\": {\"<name>\": <value>}}]}\n\
Use only module names from the list above. Order steps in execution order.";

/// Render the catalog as one line per module.
fn module_lines(catalog: &ModuleCatalog) -> String {
    catalog
        .modules()
        .iter()
        .map(|m| {
            format!(
                "- {} {} ({}): inputs {} -> outputs {}",
                m.name,
                m.version,
                m.language,
                m.inputs.join(", "),
                m.outputs.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt asking the model to draft a workflow for a free-text request.
pub fn generate_prompt(request: &str, catalog: &ModuleCatalog) -> String {
    format!(
        "You are a bioinformatics workflow planner.\n\n\
         User request:\n{}\n\n\
         Available modules:\n{}\n\n{}",
        request.trim(),
        module_lines(catalog),
        REPLY_FORMAT
    )
}

/// Prompt asking the model to revise an existing workflow.
pub fn refine_prompt(workflow: &Workflow, feedback: &str, catalog: &ModuleCatalog) -> String {
    let current = serde_json::to_string_pretty(workflow).unwrap_or_else(|_| "{}".to_string());
    format!(
        "You are a bioinformatics workflow planner.\n\n\
         Current workflow:\n{}\n\n\
         Requested changes:\n{}\n\n\
         Available modules:\n{}\n\n{}",
        current,
        feedback.trim(),
        module_lines(catalog),
        REPLY_FORMAT
    )
}

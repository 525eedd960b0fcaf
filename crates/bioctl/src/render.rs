//! Output rendering for bioctl.

use std::path::Path;

use bio_core::types::{Run, RunStatus};
use bio_core::{ModuleCatalog, Workflow};

/// Print confirmation after creating a run.
pub fn print_run_created(run: &Run, skipped_inputs: &[String]) {
    println!("Created run: {}", run.id);
    println!("  Tool:   {}", run.tool);
    println!("  Inputs: {}", run.input_files.len());
    println!("  Output: {}", run.output_path);
    println!("  Status: {}", format_status(run.status));
    for path in skipped_inputs {
        println!("  warning: input not found, not copied: {}", path);
    }
}

/// Print a list of runs in tabular format.
pub fn print_run_list(runs: &[Run]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<36}  {:<12}  {:<10}  {:>6}  {:<20}",
        "ID", "TOOL", "STATUS", "INPUTS", "CREATED"
    );
    println!("{}", "-".repeat(92));

    for run in runs {
        println!(
            "{:<36}  {:<12}  {:<10}  {:>6}  {:<20}",
            run.id.0,
            truncate(&run.tool, 12),
            format_status(run.status),
            run.input_files.len(),
            format_time(&run.timestamp),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

/// Print detailed information about a run.
pub fn print_run_details(run: &Run) {
    println!("Run: {}", run.id);
    println!();
    println!("  Status:         {}", format_status(run.status));
    println!("  Tool:           {}", run.tool);
    println!("  Created:        {}", format_time(&run.timestamp));
    println!("  Updated:        {}", format_time(&run.updated_at));

    println!();
    println!("  Inputs:");
    for (idx, input) in run.input_files.iter().enumerate() {
        let marker = if run.failed_step.as_deref() == Some(input.as_str()) {
            "  <- failed"
        } else {
            ""
        };
        println!("    {:>3}. {}{}", idx + 1, input, marker);
    }

    if let Some(ref error) = run.error {
        println!();
        println!("  Error:          {}", error);
    }

    // Run directory sits one level above the output directory.
    if let Some(run_dir) = Path::new(&run.output_path).parent() {
        println!();
        println!("  Artifacts:");
        println!("    Output Dir:   {}", run.output_path);
        println!("    Log:          {}", run_dir.join("logs/execution.log").display());
        println!("    Manifest:     {}", run_dir.join("run.json").display());
    }
}

/// Print the runs of an executed workflow, one line per step.
pub fn print_workflow_execution(runs: &[Run], skipped_inputs: &[String]) {
    for (idx, run) in runs.iter().enumerate() {
        println!(
            "{:>3}. {:<36}  {:<10}  {}",
            idx + 1,
            run.id.0,
            format_status(run.status),
            run.tool
        );
        if let Some(ref error) = run.error {
            println!("     error: {}", error);
        }
    }
    for path in skipped_inputs {
        println!("  warning: input not found, not copied: {}", path);
    }
}

/// Print a planned workflow as numbered steps.
pub fn print_workflow(workflow: &Workflow) {
    for (idx, step) in workflow.steps.iter().enumerate() {
        if step.params.is_empty() {
            println!("{:>3}. {}", idx + 1, step.tool);
        } else {
            let params = step
                .params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{:>3}. {}  {}", idx + 1, step.tool, params);
        }
    }
}

pub fn print_catalog(catalog: &ModuleCatalog) {
    println!(
        "{:<14}  {:<10}  {:<8}  {:<30}",
        "MODULE", "VERSION", "LANG", "INPUTS -> OUTPUTS"
    );
    println!("{}", "-".repeat(70));
    for module in catalog.modules() {
        println!(
            "{:<14}  {:<10}  {:<8}  {} -> {}",
            truncate(&module.name, 14),
            truncate(&module.version, 10),
            truncate(&module.language, 8),
            module.inputs.join(", "),
            module.outputs.join(", "),
        );
    }
}

fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "PENDING",
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("fastqc", 12), "fastqc");
    }

    #[test]
    fn truncate_shortens_long_strings() {
        assert_eq!(truncate("/opt/tools/bin/fastqc", 12), "/opt/tool...");
    }

    #[test]
    fn status_labels_are_uppercase() {
        assert_eq!(format_status(RunStatus::Failed), "FAILED");
        assert_eq!(format_status(RunStatus::Pending), "PENDING");
    }
}

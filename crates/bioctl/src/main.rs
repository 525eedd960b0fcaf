//! bioctl - CLI client for biod
//!
//! Creates, starts and inspects runs, and drafts workflows through the
//! daemon's local HTTP API.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use std::path::{Path, PathBuf};
use std::time::Duration;

use bio_core::types::RunStatus;
use bio_core::{Config, ModuleCatalog, Workflow};
use clap::{Parser, Subcommand};
use client::{Client, ClientError, CreateRunRequest};

/// Interval between status polls for `start-run --wait`.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// CLI client for the biod run orchestrator.
#[derive(Parser)]
#[command(name = "bioctl")]
#[command(about = "Control plane for the biod bioinformatics run orchestrator")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7710)
    #[arg(long, global = true, env = "BIOD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "BIOD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a pending run and copy its inputs into the run directory
    #[command(name = "create-run")]
    CreateRun {
        /// Input files, processed in the given order
        #[arg(long, required = true, num_args = 1..)]
        input_files: Vec<String>,

        /// Tool to invoke per input (defaults to the daemon's configured tool)
        #[arg(long)]
        tool: Option<String>,
    },

    /// Execute a pending run
    #[command(name = "start-run")]
    StartRun {
        /// Run ID
        #[arg(long)]
        run_id: String,

        /// Block until the run completes or fails
        #[arg(long)]
        wait: bool,
    },

    /// List runs (optionally filter by status)
    List {
        /// Filter by status (pending, running, completed, failed)
        #[arg(long, value_parser = parse_run_status)]
        status: Option<RunStatus>,
    },

    /// Show detailed information about a run
    Inspect {
        /// Run ID
        run_id: String,
    },

    /// Create a new run with the same inputs and tool as an existing one
    Rerun {
        /// Run ID
        run_id: String,
    },

    /// Draft a workflow from a natural-language request
    Plan {
        /// Analysis request, e.g. "quality control then align to hg38"
        #[arg(required = true, num_args = 1..)]
        request: Vec<String>,

        /// Write the workflow as JSON to this file
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Revise a saved workflow with feedback
    Refine {
        /// Workflow JSON file (as written by `plan --save`)
        #[arg(long)]
        workflow: PathBuf,

        /// Requested changes
        #[arg(long)]
        feedback: String,

        /// Write the revised workflow to this file (defaults to overwriting --workflow)
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Execute a saved workflow, one run per step, stopping at the first failure
    Execute {
        /// Workflow JSON file (as written by `plan --save`)
        #[arg(long)]
        workflow: PathBuf,

        /// Input files handed to every step
        #[arg(long, required = true, num_args = 1..)]
        input_files: Vec<String>,
    },

    /// List available analysis modules (no daemon required)
    Modules {
        /// Config file path (overrides .bio/config)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn parse_run_status(s: &str) -> Result<RunStatus, String> {
    s.to_lowercase().parse::<RunStatus>().map_err(|_| {
        format!(
            "invalid status '{}', expected: pending, running, completed, failed",
            s
        )
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7710".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    let requires_daemon = !matches!(cli.command, Command::Modules { .. });
    if requires_daemon {
        if let Err(e) = client.wait_for_ready().await {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Command::CreateRun { input_files, tool } => {
            run_create(&client, input_files, tool).await
        }
        Command::StartRun { run_id, wait } => run_start(&client, &run_id, wait).await,
        Command::List { status } => run_list(&client, status).await,
        Command::Inspect { run_id } => run_inspect(&client, &run_id).await,
        Command::Rerun { run_id } => run_rerun(&client, &run_id).await,
        Command::Plan { request, save } => run_plan(&client, &request.join(" "), save).await,
        Command::Refine {
            workflow,
            feedback,
            save,
        } => run_refine(&client, workflow, &feedback, save).await,
        Command::Execute {
            workflow,
            input_files,
        } => run_execute(&client, &workflow, input_files).await,
        Command::Modules { config } => show_modules(config),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Resolve inputs against this process's working directory; biod runs in its own.
fn absolute_inputs(input_files: Vec<String>) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let mut resolved = Vec::with_capacity(input_files.len());
    for path in input_files {
        let absolute = std::path::absolute(&path)
            .map_err(|e| format!("invalid input path '{}': {}", path, e))?;
        let absolute = absolute
            .into_os_string()
            .into_string()
            .map_err(|_| format!("input path is not valid UTF-8: {}", path))?;
        resolved.push(absolute);
    }
    Ok(resolved)
}

async fn run_create(client: &Client, input_files: Vec<String>, tool: Option<String>) -> CliResult {
    let input_files = absolute_inputs(input_files)?;
    let created = client
        .create_run(CreateRunRequest { input_files, tool })
        .await?;
    render::print_run_created(&created.run, &created.skipped_inputs);
    Ok(())
}

async fn run_start(client: &Client, run_id: &str, wait: bool) -> CliResult {
    let run = client.start_run(run_id).await?;
    println!("Started run: {}", run.id);
    if !wait {
        return Ok(());
    }

    loop {
        let run = client.get_run(run_id).await?;
        if run.status.is_terminal() {
            render::print_run_details(&run);
            if run.status == RunStatus::Failed {
                return Err(format!("run {} failed", run.id).into());
            }
            return Ok(());
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

async fn run_list(client: &Client, status: Option<RunStatus>) -> CliResult {
    let runs = client.list_runs(status).await?;
    render::print_run_list(&runs);
    Ok(())
}

async fn run_inspect(client: &Client, run_id: &str) -> CliResult {
    let run = client.get_run(run_id).await?;
    render::print_run_details(&run);
    Ok(())
}

async fn run_rerun(client: &Client, run_id: &str) -> CliResult {
    let created = client.rerun(run_id).await?;
    println!("Rerun of {}:", run_id);
    render::print_run_created(&created.run, &created.skipped_inputs);
    Ok(())
}

async fn run_plan(client: &Client, request: &str, save: Option<PathBuf>) -> CliResult {
    let workflow = client.generate_workflow(request).await?;
    render::print_workflow(&workflow);
    if let Some(path) = save {
        save_workflow(&workflow, &path)?;
        println!();
        println!("Saved workflow to {}", path.display());
    }
    Ok(())
}

async fn run_refine(
    client: &Client,
    workflow_path: PathBuf,
    feedback: &str,
    save: Option<PathBuf>,
) -> CliResult {
    let workflow = load_workflow(&workflow_path)?;

    let refined = match client.refine_workflow(&workflow, feedback).await {
        Ok(refined) => refined,
        Err(ClientError::PlannerUnavailable(msg)) => {
            return Err(format!("{msg}\n  → export OPENAI_API_KEY before starting biod").into())
        }
        Err(e) => return Err(e.into()),
    };
    render::print_workflow(&refined);

    let target = save.unwrap_or(workflow_path);
    save_workflow(&refined, &target)?;
    println!();
    println!("Saved workflow to {}", target.display());
    Ok(())
}

async fn run_execute(client: &Client, workflow_path: &Path, input_files: Vec<String>) -> CliResult {
    let workflow = load_workflow(workflow_path)?;
    let input_files = absolute_inputs(input_files)?;

    let execution = client.execute_workflow(&workflow, input_files).await?;
    render::print_workflow_execution(&execution.runs, &execution.skipped_inputs);
    if !execution.completed {
        return Err(format!(
            "workflow stopped at step {} of {}",
            execution.runs.len(),
            workflow.steps.len()
        )
        .into());
    }
    Ok(())
}

fn load_workflow(path: &Path) -> Result<Workflow, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let workflow = serde_json::from_str(&content)
        .map_err(|e| format!("invalid workflow file {}: {}", path.display(), e))?;
    Ok(workflow)
}

fn save_workflow(workflow: &Workflow, path: &Path) -> CliResult {
    let json = serde_json::to_string_pretty(workflow)?;
    std::fs::write(path, json)
        .map_err(|e| format!("failed to write {}: {}", path.display(), e))?;
    Ok(())
}

fn show_modules(config: Option<PathBuf>) -> CliResult {
    let config = Config::discover(config.as_deref())?;
    let catalog = match &config.module_catalog {
        Some(path) => ModuleCatalog::from_file(path)?,
        None => ModuleCatalog::builtin(),
    };
    render::print_catalog(&catalog);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_status_is_case_insensitive() {
        assert_eq!(parse_run_status("FAILED").unwrap(), RunStatus::Failed);
        assert_eq!(parse_run_status("pending").unwrap(), RunStatus::Pending);
        assert!(parse_run_status("paused").is_err());
    }

    #[test]
    fn create_run_requires_inputs() {
        assert!(Cli::try_parse_from(["bioctl", "create-run"]).is_err());

        let cli = Cli::try_parse_from([
            "bioctl",
            "create-run",
            "--input-files",
            "a.fastq",
            "b.fastq",
            "--tool",
            "fastqc",
        ])
        .unwrap();
        match cli.command {
            Command::CreateRun { input_files, tool } => {
                assert_eq!(input_files, vec!["a.fastq", "b.fastq"]);
                assert_eq!(tool.as_deref(), Some("fastqc"));
            }
            _ => panic!("expected create-run"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn relative_inputs_resolve_against_working_directory() {
        let cwd = std::env::current_dir().unwrap();
        let resolved = absolute_inputs(vec![
            "reads.fastq".to_string(),
            "lane2/reads.fastq".to_string(),
            "/data/ref.fa".to_string(),
        ])
        .unwrap();

        assert_eq!(resolved[0], cwd.join("reads.fastq").display().to_string());
        assert_eq!(
            resolved[1],
            cwd.join("lane2/reads.fastq").display().to_string()
        );
        assert_eq!(resolved[2], "/data/ref.fa");
        assert!(resolved.iter().all(|p| Path::new(p).is_absolute()));
    }

    #[test]
    fn empty_input_path_is_rejected() {
        assert!(absolute_inputs(vec![String::new()]).is_err());
    }

    #[test]
    fn execute_requires_workflow_and_inputs() {
        assert!(Cli::try_parse_from(["bioctl", "execute", "--workflow", "wf.json"]).is_err());

        let cli = Cli::try_parse_from([
            "bioctl",
            "execute",
            "--workflow",
            "wf.json",
            "--input-files",
            "a.fastq",
        ])
        .unwrap();
        match cli.command {
            Command::Execute {
                workflow,
                input_files,
            } => {
                assert_eq!(workflow, PathBuf::from("wf.json"));
                assert_eq!(input_files, vec!["a.fastq"]);
            }
            _ => panic!("expected execute"),
        }
    }

    #[test]
    fn plan_joins_request_words() {
        let cli = Cli::try_parse_from(["bioctl", "plan", "qc", "then", "align"]).unwrap();
        match cli.command {
            Command::Plan { request, save } => {
                assert_eq!(request.join(" "), "qc then align");
                assert!(save.is_none());
            }
            _ => panic!("expected plan"),
        }
    }

    #[test]
    fn save_workflow_writes_loadable_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("wf.json");
        let workflow = bio_core::parse_workflow(r#"{"steps": [{"tool": "FastQC"}]}"#).unwrap();

        save_workflow(&workflow, &path).unwrap();
        assert_eq!(load_workflow(&path).unwrap(), workflow);
    }
}

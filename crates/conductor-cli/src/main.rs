mod file;
mod workers;

use clap::{Parser, Subcommand};
use conductor_orchestrator::{
    CapabilityTag, Orchestrator, OrchestratorConfig, Workflow, WorkflowResult,
};
use file::ConductorFile;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workers::TemplateWorker;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: goal decomposition and agent selection")]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the workflows in a file and print their results as JSON
    Run {
        file: PathBuf,
        /// Only run the workflow with this name
        #[arg(short, long)]
        workflow: Option<String>,
    },
    /// Build the workflows in a file and report problems without running them
    Validate { file: PathBuf },
    /// List capability tags and their keywords
    Capabilities {
        /// Include extra keywords from this file's [orchestrator] table
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct NamedResult {
    workflow: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<WorkflowResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Run { file, workflow } => {
            let file = ConductorFile::load(&file)?;
            let results = run(&file, workflow.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&results)?);

            let failed = results
                .iter()
                .filter(|r| !r.result.as_ref().is_some_and(|res| res.success))
                .count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} workflow(s) failed", results.len());
            }
        }
        Commands::Validate { file } => {
            let file = ConductorFile::load(&file)?;
            let problems = validate(&file);
            for workflow in &file.workflows {
                println!("{}: {} step(s)", workflow.name, workflow.steps.len());
            }
            if !problems.is_empty() {
                for problem in &problems {
                    println!("  error: {problem}");
                }
                anyhow::bail!("{} problem(s) found", problems.len());
            }
            println!("All {} workflow(s) valid.", file.workflows.len());
        }
        Commands::Capabilities { file } => {
            let config = match file {
                Some(path) => ConductorFile::load(&path)?.orchestrator,
                None => OrchestratorConfig::default(),
            };
            for line in describe_capabilities(&config) {
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn build_orchestrator(file: &ConductorFile) -> Orchestrator {
    let orchestrator = Orchestrator::new(file.orchestrator.clone());
    for spec in &file.workers {
        orchestrator.register_worker(Arc::new(TemplateWorker::from_spec(spec)));
    }
    info!(workers = file.workers.len(), "Template workers registered");
    orchestrator
}

/// Run the selected workflows one after another on a shared orchestrator.
async fn run(file: &ConductorFile, only: Option<&str>) -> Vec<NamedResult> {
    let orchestrator = build_orchestrator(file);
    let mut results = Vec::new();

    for spec in file.selected(only) {
        let created = orchestrator.create_workflow(
            &spec.name,
            &spec.description,
            spec.steps.clone(),
            Some(spec.metadata.clone()),
        );
        let named = match created {
            Ok(id) => NamedResult {
                workflow: spec.name.clone(),
                result: Some(orchestrator.execute_workflow(id).await),
                error: None,
            },
            Err(e) => {
                warn!(workflow = %spec.name, error = %e, "Workflow rejected");
                NamedResult {
                    workflow: spec.name.clone(),
                    result: None,
                    error: Some(e.to_string()),
                }
            }
        };
        results.push(named);
    }

    let status = orchestrator.get_status();
    info!(
        completed = status.completed_workflows,
        failed = status.failed_workflows,
        "Run finished"
    );
    orchestrator.shutdown();
    results
}

/// Construction errors, plus steps no declared worker can handle.
fn validate(file: &ConductorFile) -> Vec<String> {
    let orchestrator = build_orchestrator(file);
    let config = &file.orchestrator;
    let mut problems = Vec::new();

    for spec in &file.workflows {
        let built = Workflow::build(
            &spec.name,
            &spec.description,
            spec.steps.clone(),
            spec.metadata.clone(),
            config.dependency_resolution,
            config.default_max_retries,
        );
        match built {
            Ok(workflow) => {
                for step in &workflow.steps {
                    if orchestrator.capable_workers(&step.goal).is_empty() {
                        problems.push(format!(
                            "{}: no worker can handle step {} ('{}')",
                            spec.name,
                            step.position,
                            step.goal.objective
                        ));
                    }
                }
            }
            Err(e) => problems.push(format!("{}: {e}", spec.name)),
        }
    }
    problems
}

fn describe_capabilities(config: &OrchestratorConfig) -> Vec<String> {
    let matcher = config.matcher();
    CapabilityTag::ALL
        .iter()
        .map(|tag| format!("{tag}: {}", matcher.keywords(*tag).join(", ")))
        .collect()
}

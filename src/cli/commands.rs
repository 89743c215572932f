//! CLI command definitions for neuropipe.
//!
//! Thin front-end over [`crate::pipeline::Pipeline`]: configuration comes from
//! an optional YAML file plus `NEUROPIPE_*` environment overrides, the catalog
//! and repository are built from it, and results are printed as text or JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::graph::{TaskGraphBuilder, TaskStatus};
use crate::pipeline::{CatalogConfig, Pipeline, PipelineConfig};
use crate::registration::{LocalCatalog, RegistrationClient, RestCatalog, RestCatalogConfig};
use crate::session::SessionLocator;
use crate::storage::{SqliteRepository, TaskRecord, TaskRepository};

/// Raw session extraction, synchronization and registration pipeline.
#[derive(Parser)]
#[command(name = "neuropipe")]
#[command(about = "Extract, synchronize and register raw neuroscience sessions")]
#[command(version)]
#[command(
    long_about = "neuropipe classifies a raw session directory, runs its task graph and registers every produced file with the dataset catalog.\n\nExample usage:\n  neuropipe run /data/Subjects/KS022/2019-12-10/001\n  neuropipe batch /data/Subjects/*/2019-12-*/00*"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file; environment variables override it.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the task graph of one session.
    Run(RunArgs),

    /// Run several sessions, skipping unrecognized ones.
    Batch(BatchArgs),

    /// Show the recorded task states of a session.
    Status(SessionArgs),

    /// Classify a session and print its task graph without running it.
    Classify(SessionArgs),
}

/// Arguments for `neuropipe run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Session root directory.
    pub root: PathBuf,

    /// Re-run tasks that already completed.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for `neuropipe batch`.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// Session root directories.
    #[arg(required = true)]
    pub roots: Vec<PathBuf>,

    /// Re-run tasks that already completed.
    #[arg(long)]
    pub force: bool,

    /// Sessions processed concurrently.
    #[arg(long)]
    pub sessions: Option<usize>,
}

/// Arguments naming one session.
#[derive(Parser, Debug)]
pub struct SessionArgs {
    /// Session root directory.
    pub root: PathBuf,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => run_session_command(config, args, cli.json).await,
        Commands::Batch(args) => run_batch_command(config, args, cli.json).await,
        Commands::Status(args) => run_status_command(config, args, cli.json).await,
        Commands::Classify(args) => run_classify_command(config, args, cli.json),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_yaml_file(path)?.with_env_overrides()?,
        None => PipelineConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

async fn build_catalog(config: &CatalogConfig) -> anyhow::Result<Arc<dyn RegistrationClient>> {
    match config {
        CatalogConfig::Local { dir } => {
            let catalog = LocalCatalog::open(dir.join(CatalogConfig::LOCAL_CATALOG_FILE)).await?;
            info!(path = %dir.display(), "Using local dataset catalog");
            Ok(Arc::new(catalog))
        }
        CatalogConfig::Rest {
            base_url,
            token,
            timeout_secs,
        } => {
            let mut rest = RestCatalogConfig::new(base_url.clone())
                .with_timeout(Duration::from_secs(*timeout_secs));
            if let Some(token) = token {
                rest = rest.with_token(token.clone());
            }
            info!(url = %base_url, "Using REST dataset catalog");
            Ok(Arc::new(RestCatalog::new(rest)?))
        }
    }
}

async fn build_pipeline(config: PipelineConfig) -> anyhow::Result<Pipeline> {
    let catalog = build_catalog(&config.catalog).await?;
    let repository = SqliteRepository::open(&config.database_url).await?;
    Ok(Pipeline::new(config, catalog, Arc::new(repository)))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_session_command(
    config: PipelineConfig,
    args: RunArgs,
    json: bool,
) -> anyhow::Result<()> {
    let config = if args.force { config.with_force(true) } else { config };
    let pipeline = build_pipeline(config).await?;
    let summary = pipeline.build_and_run(&args.root).await?;

    if json {
        return print_json(&summary);
    }
    println!("{}", summary);
    for outcome in summary.tasks.values() {
        let note = match (&outcome.error, outcome.skipped) {
            (Some(error), _) => format!(" - {}", error),
            (None, true) => " (skipped)".to_string(),
            (None, false) => String::new(),
        };
        println!(
            "  {:<24} {:<17} {} registered{}",
            outcome.task,
            outcome.status,
            outcome.records.len(),
            note
        );
    }
    for unmet in &summary.unmet {
        println!(
            "  {} is waiting: upstream {} ended {}",
            unmet.task, unmet.upstream, unmet.status
        );
    }
    Ok(())
}

async fn run_batch_command(
    config: PipelineConfig,
    args: BatchArgs,
    json: bool,
) -> anyhow::Result<()> {
    let mut config = if args.force { config.with_force(true) } else { config };
    if let Some(sessions) = args.sessions {
        config = config.with_max_concurrent_sessions(sessions);
    }
    config.validate()?;
    let pipeline = build_pipeline(config).await?;
    let report = pipeline.run_batch(&args.roots).await;

    if json {
        return print_json(&report);
    }
    for summary in &report.sessions {
        println!("{}", summary);
    }
    for skipped in &report.skipped {
        println!("skipped {}: {}", skipped.root.display(), skipped.reason);
    }
    for failed in &report.failed {
        println!("failed {}: {}", failed.root.display(), failed.reason);
    }
    println!(
        "{} sessions: {} errored tasks, {} partial, {} waiting",
        report.total(),
        report.count(TaskStatus::Errored),
        report.count(TaskStatus::PartialComplete),
        report.count(TaskStatus::Waiting),
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    session: String,
    session_id: String,
    tasks: Vec<TaskRecord>,
}

async fn run_status_command(
    config: PipelineConfig,
    args: SessionArgs,
    json: bool,
) -> anyhow::Result<()> {
    let classification = SessionLocator::new().classify(&args.root)?;
    let repository = SqliteRepository::open(&config.database_url).await?;
    let tasks = repository.task_records(classification.session.id).await?;

    let output = StatusOutput {
        session: classification.session.key(),
        session_id: classification.session.id.to_string(),
        tasks,
    };
    if json {
        return print_json(&output);
    }
    if output.tasks.is_empty() {
        println!("{}: no recorded task state", output.session);
        return Ok(());
    }
    println!("{} ({})", output.session, output.session_id);
    for record in &output.tasks {
        println!(
            "  {:<24} {:<17} attempts={} updated={}{}",
            record.task_name,
            record.status,
            record.attempts,
            record.updated_at.to_rfc3339(),
            record
                .error
                .as_deref()
                .map(|e| format!(" - {}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ClassifyOutput {
    session: String,
    family: String,
    protocol: String,
    probes: Vec<String>,
    cameras: Vec<String>,
    has_behavior: bool,
    has_passive: bool,
    has_opto: bool,
    tasks: Vec<String>,
    edges: Vec<(String, String)>,
}

fn run_classify_command(config: PipelineConfig, args: SessionArgs, json: bool) -> anyhow::Result<()> {
    let classification = SessionLocator::new().classify(&args.root)?;
    let graph = TaskGraphBuilder::new(config.sync.clone())
        .with_min_match_ratio(config.min_match_ratio)
        .build(&classification)?;

    let output = ClassifyOutput {
        session: classification.session.key(),
        family: classification.family.to_string(),
        protocol: classification.session.protocol.clone(),
        probes: classification.probes.clone(),
        cameras: classification.cameras.clone(),
        has_behavior: classification.has_behavior,
        has_passive: classification.has_passive,
        has_opto: classification.has_opto,
        tasks: graph.topological_order(),
        edges: graph.edges(),
    };
    if json {
        return print_json(&output);
    }
    println!("{} is a {} session ({})", output.session, output.family, output.protocol);
    if !output.probes.is_empty() {
        println!("  probes:  {}", output.probes.join(", "));
    }
    if !output.cameras.is_empty() {
        println!("  cameras: {}", output.cameras.join(", "));
    }
    println!("  tasks:");
    for task in &output.tasks {
        let upstream: Vec<&str> = output
            .edges
            .iter()
            .filter(|(_, down)| down == task)
            .map(|(up, _)| up.as_str())
            .collect();
        if upstream.is_empty() {
            println!("    {}", task);
        } else {
            println!("    {} <- {}", task, upstream.join(", "));
        }
    }
    Ok(())
}

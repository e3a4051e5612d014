//! Command-line front end: `init`, `check-setup`, `submit`, `status`,
//! `merge`, `update-input-data`, `sync-code`. Thin orchestration over
//! `batch-core` plus the `Slurm`/`git` adapters — the adapter and config
//! crates own everything backend-specific; this crate only wires them
//! together and chooses an exit code.

mod error;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use batch_artifacts::GitArtifactStore;
use batch_config::{load_config, resolve, validate_config, ProjectConfig};
use batch_core::adapter::{ArtifactStore, SchedulerAdapter};
use batch_core::finalize;
use batch_core::inclusion::{self, RealDatasetScanner};
use batch_core::ledger::Ledger;
use batch_core::model::Pu;
use batch_core::planner::{self, PlanMode};
use batch_core::reconcile::{self, ReconcileOptions};
use batch_core::{PreconditionError, RealFilesystem};
use batch_scheduler::SlurmAdapter;

use error::CliError;

const PROJECT_CONFIG_FILENAME: &str = "project.yml";
const LEDGER_FILENAME: &str = "ledger.csv";
/// Slurm array submission kicks in once a batch crosses this many PUs;
/// below it, one job is submitted per PU.
const ARRAY_THRESHOLD: usize = 2;

#[derive(Parser)]
#[command(name = "batch")]
#[command(about = "Batch orchestrator for subject/session processing jobs")]
#[command(version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the initial Inclusion List and write a fresh ledger.
    Init { project_root: PathBuf },
    /// Validate configuration and report the resolved Inclusion List
    /// without writing anything.
    CheckSetup { project_root: PathBuf },
    /// Submit unsubmitted (or selected) PUs.
    Submit {
        project_root: PathBuf,
        #[arg(long)]
        count: Option<usize>,
        #[arg(long)]
        all: bool,
        #[arg(long = "select")]
        select: Vec<String>,
    },
    /// Reconcile ledger/queue/artifacts/logs and print a summary.
    Status {
        project_root: PathBuf,
        #[arg(long)]
        container_config: Option<PathBuf>,
    },
    /// Merge all result branches into the mainline.
    Merge {
        project_root: PathBuf,
        #[arg(long, default_value_t = finalize::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Re-resolve the Inclusion List against updated input data.
    UpdateInputData {
        project_root: PathBuf,
        #[arg(long)]
        dataset_name: Option<String>,
        #[arg(long)]
        initial_inclusion: Option<PathBuf>,
    },
    /// Push the project's code branch to the artifact store's remote.
    SyncCode { project_root: PathBuf },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: logging subscriber already set");
    }

    let outcome = run(cli.command).await;
    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

async fn run(command: Commands) -> Result<i32, CliError> {
    match command {
        Commands::Init { project_root } => cmd_init(&project_root).await,
        Commands::CheckSetup { project_root } => cmd_check_setup(&project_root).await,
        Commands::Submit {
            project_root,
            count,
            all,
            select,
        } => cmd_submit(&project_root, count, all, select).await,
        Commands::Status {
            project_root,
            container_config,
        } => cmd_status(&project_root, container_config.as_deref()).await,
        Commands::Merge { project_root, chunk_size } => cmd_merge(&project_root, chunk_size).await,
        Commands::UpdateInputData {
            project_root,
            dataset_name,
            initial_inclusion,
        } => cmd_update_input_data(&project_root, dataset_name.as_deref(), initial_inclusion.as_deref()).await,
        Commands::SyncCode { project_root } => cmd_sync_code(&project_root).await,
    }
}

fn config_path(project_root: &Path) -> PathBuf {
    project_root.join(PROJECT_CONFIG_FILENAME)
}

fn ledger_path(project_root: &Path) -> PathBuf {
    project_root.join(LEDGER_FILENAME)
}

fn load_and_validate_config(project_root: &Path) -> Result<ProjectConfig, CliError> {
    let config = load_config(&config_path(project_root))?;
    validate_config(&config).map_err(CliError::InvalidConfig)?;
    Ok(config)
}

fn read_initial_inclusion(path: &Path) -> Result<Vec<Pu>, CliError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|source| CliError::Io(std::io::Error::other(source.to_string())))?;

    let headers = reader
        .headers()
        .map_err(|source| CliError::Io(std::io::Error::other(source.to_string())))?
        .clone();
    let session_col = headers.iter().position(|h| h == "session");

    let mut pus = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| CliError::Io(std::io::Error::other(source.to_string())))?;
        let subject = record.get(0).unwrap_or_default().to_string();
        match session_col.and_then(|i| record.get(i)) {
            Some(session) if !session.is_empty() => pus.push(Pu::subject_session(subject, session)),
            _ => pus.push(Pu::subject_only(subject)),
        }
    }
    Ok(pus)
}

fn resolve_inclusion(
    config: &ProjectConfig,
    project_root: &Path,
    initial_list: Option<Vec<Pu>>,
) -> Result<inclusion::ResolveReport, CliError> {
    let scanner = RealDatasetScanner;
    let mode = resolve::to_processing_mode(config);
    let datasets: Vec<_> = resolve::to_input_datasets(config)
        .into_iter()
        .map(|mut dataset| {
            dataset.path_in_project = project_root.join(&dataset.path_in_project);
            dataset
        })
        .collect();
    Ok(inclusion::resolve(&scanner, mode, &datasets, initial_list)?)
}

async fn cmd_init(project_root: &Path) -> Result<i32, CliError> {
    let config = load_and_validate_config(project_root)?;
    let report = resolve_inclusion(&config, project_root, None)?;

    let mut ledger = Ledger::load(&ledger_path(project_root))?;
    ledger.apply_inclusion_update(report.list.as_slice());
    ledger.save_atomic(&ledger_path(project_root))?;

    info!("initialized {} PU(s); {} dropped", report.list.len(), report.dropped.len());
    for dropped in &report.dropped {
        warn!("dropped {}: {:?}", dropped.pu, dropped.reason);
    }
    Ok(0)
}

async fn cmd_check_setup(project_root: &Path) -> Result<i32, CliError> {
    let config = load_and_validate_config(project_root)?;
    let report = resolve_inclusion(&config, project_root, None)?;

    println!("Resolved {} PU(s)", report.list.len());
    for pu in report.list.iter() {
        println!("  {pu}");
    }
    if !report.dropped.is_empty() {
        println!("Dropped {} PU(s):", report.dropped.len());
        for dropped in &report.dropped {
            println!("  {}: {:?}", dropped.pu, dropped.reason);
        }
    }
    if !report.unknown_initial_entries.is_empty() {
        println!("Unknown initial-list entries: {}", report.unknown_initial_entries.len());
        return Ok(3);
    }
    Ok(0)
}

fn build_scheduler(config: &ProjectConfig, project_root: &Path) -> SlurmAdapter {
    let _ = &config.queue;
    SlurmAdapter::new(ARRAY_THRESHOLD, project_root.join("scripts"))
}

fn build_store(project_root: &Path) -> Result<GitArtifactStore, CliError> {
    Ok(GitArtifactStore::open(project_root.to_path_buf())?)
}

async fn reconcile_ledger(
    project_root: &Path,
    config: &ProjectConfig,
    scheduler: &dyn SchedulerAdapter,
    store: &dyn ArtifactStore,
) -> Result<(Ledger, reconcile::StatusSummary), CliError> {
    let ledger = Ledger::load(&ledger_path(project_root))?;
    let catalog = resolve::to_alert_catalog(config);
    let fs = RealFilesystem;
    let options = ReconcileOptions::new(reconcile::log_dir_for(project_root), whoami());
    let (ledger, summary) = reconcile::reconcile(ledger, scheduler, store, &fs, &catalog, &options).await?;
    ledger.save_atomic(&ledger_path(project_root))?;
    Ok((ledger, summary))
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

async fn cmd_submit(
    project_root: &Path,
    count: Option<usize>,
    all: bool,
    select: Vec<String>,
) -> Result<i32, CliError> {
    let config = load_and_validate_config(project_root)?;
    let scheduler = build_scheduler(&config, project_root);
    let store = build_store(project_root)?;

    let (mut ledger, _summary) = reconcile_ledger(project_root, &config, &scheduler, &store).await?;

    let mode = if !select.is_empty() {
        PlanMode::Explicit(select.iter().map(|s| parse_pu_selector(s)).collect())
    } else if all {
        PlanMode::All {
            resubmit_policy: HashSet::new(),
        }
    } else if let Some(n) = count {
        PlanMode::CountN(n)
    } else {
        PlanMode::OneJob
    };

    planner::check_contention(&ledger, &mode)?;
    let plan = planner::plan(&ledger, &mode)?;
    for warning in &plan.warnings {
        warn!("{warning:?}");
    }

    let template = resolve::render_submission_template(&config);
    let assignments = planner::submit_plan(&mut ledger, &scheduler, &template, &plan.candidates).await?;
    ledger.save_atomic(&ledger_path(project_root))?;

    info!("submitted {} PU(s)", assignments.len());
    Ok(if plan.warnings.is_empty() { 0 } else { 3 })
}

/// `--select` entries are `subject` or `subject/session`.
fn parse_pu_selector(raw: &str) -> Pu {
    match raw.split_once('/') {
        Some((subject, session)) => Pu::subject_session(subject, session),
        None => Pu::subject_only(raw),
    }
}

async fn cmd_status(project_root: &Path, container_config: Option<&Path>) -> Result<i32, CliError> {
    let mut config = load_and_validate_config(project_root)?;
    if let Some(path) = container_config {
        let override_config = load_config(path)?;
        config.alert_log_messages = override_config.alert_log_messages;
    } else {
        config.alert_log_messages = None;
    }

    let scheduler = build_scheduler(&config, project_root);
    let store = build_store(project_root)?;
    let (_ledger, summary) = reconcile_ledger(project_root, &config, &scheduler, &store).await?;

    println!("To complete: {}", summary.to_complete);
    println!("  unsubmitted: {}", summary.unsubmitted);
    println!("  pending:     {}", summary.pending);
    println!("  running:     {}", summary.running);
    println!("  stalled:     {}", summary.stalled);
    println!("  succeeded:   {}", summary.succeeded);
    println!("  failed:      {}", summary.failed);
    if !summary.failure_histogram.is_empty() {
        println!("Failure histogram:");
        for (reason, count) in &summary.failure_histogram {
            println!("  {count:>4}  {reason}");
        }
    }
    for warning in &summary.warnings {
        warn!("{warning}");
    }

    Ok(if summary.warnings.is_empty() { 0 } else { 3 })
}

async fn cmd_merge(project_root: &Path, chunk_size: usize) -> Result<i32, CliError> {
    let config = load_and_validate_config(project_root)?;
    let scheduler = build_scheduler(&config, project_root);
    let store = build_store(project_root)?;

    let (ledger, _summary) = reconcile_ledger(project_root, &config, &scheduler, &store).await?;
    let report = finalize::finalize(&ledger, &store, chunk_size).await?;

    info!("merged {} chunk(s)", report.merged_chunks.len());
    if !report.is_complete() {
        warn!("{} branch(es) still pending after a failed chunk", report.pending_branches.len());
        return Ok(3);
    }
    Ok(0)
}

async fn cmd_update_input_data(
    project_root: &Path,
    dataset_name: Option<&str>,
    initial_inclusion: Option<&Path>,
) -> Result<i32, CliError> {
    let _ = dataset_name;
    let config = load_and_validate_config(project_root)?;
    let store = build_store(project_root)?;

    let ledger = Ledger::load(&ledger_path(project_root))?;
    let mut unmerged: Vec<Pu> = Vec::new();
    for row in ledger.iter().filter(|r| r.has_results) {
        if store.branch_exists_for(&row.pu).await? {
            unmerged.push(row.pu.clone());
        }
    }
    if !unmerged.is_empty() {
        return Err(PreconditionError::UnmergedBranches(unmerged).into());
    }

    let initial_list = match initial_inclusion {
        Some(path) => Some(read_initial_inclusion(path)?),
        None => None,
    };
    let report = resolve_inclusion(&config, project_root, initial_list)?;

    let mut ledger = ledger;
    ledger.apply_inclusion_update(report.list.as_slice());
    ledger.save_atomic(&ledger_path(project_root))?;

    info!("re-resolved to {} PU(s)", report.list.len());
    Ok(if report.unknown_initial_entries.is_empty() { 0 } else { 3 })
}

async fn cmd_sync_code(project_root: &Path) -> Result<i32, CliError> {
    let store = build_store(project_root)?;
    store.push_code().await?;
    info!("pushed code branch");
    Ok(0)
}

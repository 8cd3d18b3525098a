//! CLI binary for running governance-gated TDD workflows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use warden_pipeline::credentials::{CREDENTIAL_ENV, CREDENTIAL_ID_ENV};
use warden_pipeline::exit_codes::{rows, ExitCodeTable};
use warden_pipeline::{
    admit_context, discover_workspace_root, filtered_env, CheckpointStore, Collaborators,
    CommandAuthor, CommandReviewer, CommandTestGate, ConsolePrompter, Coordinator,
    CoordinatorReport, EngineConfig, FileCheckpointStore, GitWorkspace, HumanGate,
    LocationContext, RunMode, UnitResult, Validator, WardenConfig, WorkUnit, WorkflowEngine,
    WorkflowState,
};
use warden_types::{ExitStatus, WardenError};

#[derive(Parser)]
#[command(name = "warden", version, about = "Governance-gated TDD workflow runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Debug, Clone, Default)]
struct WorkspaceArgs {
    /// Workspace root (default: the enclosing git checkout or worktree)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Checkpoint directory (overrides WARDEN_CHECKPOINT_DIR and warden.toml)
    #[arg(long)]
    checkpoint_dir: Option<String>,

    /// Configuration file (default: <workspace>/warden.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow for one or more work units
    Run {
        /// Work-unit references, e.g. issue ids
        #[arg(required = true)]
        work_units: Vec<String>,

        /// Continue from the last checkpoint
        #[arg(long, conflicts_with = "restart")]
        resume: bool,

        /// Discard any checkpoint and start over
        #[arg(long)]
        restart: bool,

        /// Cap on automated loop-backs before a human must decide
        #[arg(long)]
        max_iterations: Option<u32>,

        /// List what would run without running it
        #[arg(long)]
        dry_run: bool,

        /// Number of work units to run concurrently (at most 10)
        #[arg(long)]
        parallel: Option<usize>,

        /// Seconds to wait for a human at a gate
        #[arg(long)]
        human_timeout: Option<u64>,

        /// Extra files to give authors as context, relative to the workspace
        #[arg(long = "context")]
        context: Vec<PathBuf>,

        /// Never prompt; human gates end the run as escalated
        #[arg(long)]
        non_interactive: bool,

        #[command(flatten)]
        workspace: WorkspaceArgs,
    },

    /// Show the current checkpoint of work units
    Status {
        #[arg(required = true)]
        work_units: Vec<String>,

        #[command(flatten)]
        workspace: WorkspaceArgs,
    },

    /// Check files against the context validator
    CheckContext {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Root the files must stay within (default: the workspace root)
        #[arg(long)]
        root: Option<PathBuf>,

        #[command(flatten)]
        workspace: WorkspaceArgs,
    },

    /// Print the test runner exit-code table
    ExitCodes {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries progress and reports.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let status = match dispatch(cli.command).await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_status_of(&e)
        }
    };
    std::process::exit(status.code());
}

async fn dispatch(command: Commands) -> anyhow::Result<ExitStatus> {
    match command {
        Commands::Run {
            work_units,
            resume,
            restart,
            max_iterations,
            dry_run,
            parallel,
            human_timeout,
            context,
            non_interactive,
            workspace,
        } => {
            let mode = if resume {
                RunMode::Resume
            } else if restart {
                RunMode::Restart
            } else {
                RunMode::Fresh
            };
            let opts = RunOptions {
                mode,
                max_iterations,
                dry_run,
                parallel,
                human_timeout,
                context,
                interactive: !non_interactive,
            };
            cmd_run(&work_units, opts, &workspace).await
        }
        Commands::Status {
            work_units,
            workspace,
        } => cmd_status(&work_units, &workspace).await,
        Commands::CheckContext {
            files,
            root,
            workspace,
        } => cmd_check_context(&files, root, &workspace).await,
        Commands::ExitCodes { json } => cmd_exit_codes(json),
    }
}

/// Map an error to its exit status. Errors that are not `WardenError` are
/// generic failures.
fn exit_status_of(err: &anyhow::Error) -> ExitStatus {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<WardenError>())
        .map(WardenError::exit_status)
        .unwrap_or(ExitStatus::Failure)
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Everything resolved from flags, the environment and `warden.toml`.
struct Setup {
    root: Option<PathBuf>,
    config: WardenConfig,
    env: HashMap<String, String>,
    location: LocationContext,
}

impl Setup {
    fn store(&self) -> Result<FileCheckpointStore, WardenError> {
        FileCheckpointStore::resolve(&self.location)
    }

    fn require_root(&self) -> Result<&Path, WardenError> {
        self.root.as_deref().ok_or_else(|| {
            WardenError::LocationUnresolved(
                "no workspace root found; run inside a git checkout or pass --workspace".into(),
            )
        })
    }
}

async fn load_setup(args: &WorkspaceArgs) -> anyhow::Result<Setup> {
    let cwd = std::env::current_dir().context("cannot determine the working directory")?;
    let root = match &args.workspace {
        Some(dir) => Some(
            std::fs::canonicalize(dir)
                .with_context(|| format!("workspace {} does not exist", dir.display()))?,
        ),
        None => discover_workspace_root(&cwd),
    };
    let env: HashMap<String, String> = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();

    let mut config = match (&args.config, &root) {
        (Some(path), _) => WardenConfig::load(path).await?,
        (None, Some(root)) => WardenConfig::discover(root).await?,
        (None, None) => WardenConfig::default(),
    };
    config.apply_env(&env)?;
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint.dir = Some(dir.clone());
    }

    let mut location = LocationContext::default().with_home(dirs::home_dir());
    location.workspace_root = root.clone();
    location.override_dir = config.checkpoint.dir.clone();

    tracing::debug!(
        root = ?root,
        checkpoint_override = ?location.override_dir,
        "Resolved workspace"
    );
    Ok(Setup {
        root,
        config,
        env,
        location,
    })
}

fn required<'a, T>(value: &'a Option<T>, key: &str) -> Result<&'a T, WardenError> {
    value
        .as_ref()
        .ok_or_else(|| WardenError::Config(format!("{key} is not configured in warden.toml")))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunOptions {
    mode: RunMode,
    max_iterations: Option<u32>,
    dry_run: bool,
    parallel: Option<usize>,
    human_timeout: Option<u64>,
    context: Vec<PathBuf>,
    interactive: bool,
}

async fn cmd_run(
    work_units: &[String],
    opts: RunOptions,
    args: &WorkspaceArgs,
) -> anyhow::Result<ExitStatus> {
    let mut setup = load_setup(args).await?;
    let store = setup.store()?;
    let root = setup.require_root()?.to_path_buf();

    let units = work_units
        .iter()
        .map(WorkUnit::new)
        .collect::<Result<Vec<_>, _>>()?;

    let config = &mut setup.config;
    if let Some(n) = opts.max_iterations {
        config.engine.max_iterations = n;
    }
    if let Some(secs) = opts.human_timeout {
        config.engine.human_timeout_secs = secs;
    }
    config.validate()?;
    let config = &setup.config;
    let workers = opts
        .parallel
        .or(config.coordinator.max_workers)
        .unwrap_or(units.len());

    // Collaborators see a scrubbed environment; credentials arrive only via leases.
    let mut hidden = config.hidden_env();
    hidden.extend([CREDENTIAL_ENV.to_string(), CREDENTIAL_ID_ENV.to_string()]);
    let base_env = filtered_env(setup.env.clone(), &hidden);

    let author = CommandAuthor::new(
        required(&config.author.draft, "author.draft")?.clone(),
        required(&config.author.scaffold, "author.scaffold")?.clone(),
        required(&config.author.implement, "author.implement")?.clone(),
    )
    .with_timeout(config.author_timeout())
    .with_base_env(base_env.clone());
    let reviewer = CommandReviewer::new(required(&config.review.command, "review.command")?.clone())
        .with_timeout(config.review_timeout())
        .with_base_env(base_env.clone());
    let tests = CommandTestGate::new(required(&config.tests.command, "tests.command")?.clone())
        .with_timeout(config.test_timeout())
        .with_base_env(base_env);
    let human = HumanGate::new(Arc::new(ConsolePrompter::new()))
        .with_timeout(config.human_timeout())
        .with_tokens(&config.engine.accept_token, &config.engine.reject_token)?;

    let engine_config = EngineConfig {
        workspace_root: root.clone(),
        policy: config.routing_policy(),
        interactive: opts.interactive,
        context_paths: opts.context,
    };
    let engine = WorkflowEngine::new(
        engine_config,
        Collaborators {
            author: Arc::new(author),
            reviewer: Arc::new(reviewer),
            tests: Arc::new(tests),
            human: Arc::new(human),
            workspace: Arc::new(GitWorkspace::new(&root)),
            store: Arc::new(store),
            validator: Arc::new(Validator::new(config.validator.clone())?),
        },
    );

    let pool = config.credential_pool(&setup.env, warden_pipeline::clamp_workers(workers))?;
    let coordinator = Coordinator::new(Arc::new(engine), Arc::new(pool), workers);

    if opts.dry_run {
        println!(
            "Dry run: {} work unit(s), {} worker(s)",
            units.len(),
            coordinator.workers()
        );
        for planned in coordinator.plan(&units, opts.mode).await? {
            println!(
                "[{}] {} (checkpoint: {})",
                planned.instance,
                planned.action,
                planned.checkpoint.display()
            );
        }
        return Ok(ExitStatus::Completed);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight steps");
            on_interrupt.cancel();
        }
    });

    let report = coordinator.run(units, opts.mode, &cancel).await?;
    print_report(&report);
    Ok(report.exit_status())
}

fn print_report(report: &CoordinatorReport) {
    println!();
    for unit in &report.units {
        match &unit.result {
            UnitResult::Finished(run) => {
                match run.policy_error() {
                    Some(e) => println!("{}: {} ({e})", unit.work_unit, run.outcome),
                    None => println!("{}: {} at {}", unit.work_unit, run.outcome, run.node),
                }
                println!("  checkpoint: {}", run.checkpoint.display());
            }
            UnitResult::Failed { error, .. } => println!("{}: failed ({error})", unit.work_unit),
            UnitResult::Drained => println!("{}: not started (cancelled)", unit.work_unit),
        }
    }
    tracing::debug!(
        leases = report.leases.len(),
        peak = report.peak_leases,
        workers = report.workers,
        "Coordinator finished"
    );
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(work_units: &[String], args: &WorkspaceArgs) -> anyhow::Result<ExitStatus> {
    let setup = load_setup(args).await?;
    let store = setup.store()?;

    for reference in work_units {
        let unit = WorkUnit::new(reference.as_str())?;
        let Some(record) = store.load(&unit.id).await? else {
            println!("{reference}: no checkpoint");
            continue;
        };
        let state = WorkflowState::from_value(record.state)?;
        let instance = &state.instance;
        println!("{reference} ({})", instance.id);
        println!("  status:     {}", instance.status);
        println!("  node:       {}", instance.current_node);
        println!(
            "  retries:    authoring {}, implementation {}",
            instance.authoring_retries, instance.implementation_retries
        );
        println!("  updated:    {}", record.updated_at.to_rfc3339());
        if let Some(t) = state.last_transition() {
            println!("  last:       {} -> {} ({})", t.from, t.to, t.reason);
        }
        if let Some(escalation) = &state.escalation {
            println!("  escalation: {}", escalation.reason);
        }
        println!("  checkpoint: {}", store.record_path(&unit.id).display());
    }
    Ok(ExitStatus::Completed)
}

// ---------------------------------------------------------------------------
// check-context
// ---------------------------------------------------------------------------

async fn cmd_check_context(
    files: &[PathBuf],
    root: Option<PathBuf>,
    args: &WorkspaceArgs,
) -> anyhow::Result<ExitStatus> {
    let setup = load_setup(args).await?;
    let root = match root {
        Some(root) => root,
        None => setup.require_root()?.to_path_buf(),
    };
    let validator = Validator::new(setup.config.validator)?;
    let bundle = admit_context(&validator, &root, files).await?;
    for file in &bundle.files {
        println!("ok  {}", file.path.display());
    }
    println!(
        "Admitted {} file(s), about {} tokens of {}",
        bundle.files.len(),
        bundle.estimated_tokens,
        validator.config().max_context_tokens
    );
    Ok(ExitStatus::Completed)
}

// ---------------------------------------------------------------------------
// exit-codes
// ---------------------------------------------------------------------------

fn cmd_exit_codes(json: bool) -> anyhow::Result<ExitStatus> {
    let table = ExitCodeTable::v1();
    let rows = rows(&table);
    if json {
        let doc = serde_json::json!({ "version": table.version, "rows": rows });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(ExitStatus::Completed);
    }
    println!("Exit-code table v{}", table.version);
    println!("{:<20} {:<16} {:<22} {}", "codes", "category", "red phase", "green phase");
    for row in rows {
        println!(
            "{:<20} {:<16} {:<22} {}",
            row.codes,
            row.category.to_string(),
            row.red_phase.to_string(),
            row.green_phase
        );
    }
    Ok(ExitStatus::Completed)
}

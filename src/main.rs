//! valueloop - autonomous software-delivery loop
//!
//! Command-line entry point: project setup, the loop itself, and the human
//! override surface (status, checkpoints, rollback, resume, dispatch).

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use valueloop::agent::AgentRole;
use valueloop::checkpoint::{create_checkpoint, RollbackManager};
use valueloop::config::{LoopConfig, GITIGNORE_PATTERNS};
use valueloop::dispatch::{Caller, ToolDispatcher};
use valueloop::lock::ProcessLock;
use valueloop::monitor::dashboard;
use valueloop::orchestrator::{resume_paused, Orchestrator, ResumeOutcome, RunOutcome};
use valueloop::runner::ExecutionRunner;
use valueloop::state::{LoopState, StateStore, Tier};
use valueloop::vcs::{ensure_gitignore_file, GitWorkspace};
use valueloop::LoopError;

#[derive(Parser)]
#[command(name = "valueloop")]
#[command(version)]
#[command(about = "Drive a coding agent until a unit of work is delivered and verified", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit log lines as JSON objects (for unattended runs)
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .valueloop/ with a default config and empty state
    Init {
        /// Name of the unit of work
        #[arg(short, long)]
        unit: Option<String>,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Run the loop until completion, a pause, or the iteration cap
    Run {
        /// Maximum iterations for this run (defaults to limits.max_iterations)
        #[arg(short, long)]
        max_iterations: Option<u32>,
    },

    /// Show loop state
    Status {
        /// Print the metrics dashboard as JSON
        #[arg(long)]
        json: bool,
    },

    /// Record a checkpoint at the current revision
    Checkpoint {
        /// Checkpoint label
        label: String,
    },

    /// Roll back to the most recent checkpoint with this label
    Rollback {
        /// Checkpoint label
        label: String,

        /// Why the rollback is happening
        #[arg(short, long)]
        reason: String,
    },

    /// Verify and clear an outstanding pause
    Resume,

    /// Dispatch one operation against the state
    Dispatch {
        /// Operation name (e.g. add_work_item)
        op: String,

        /// JSON payload
        payload: String,

        /// Dispatch as a human (may override agent-only restrictions)
        #[arg(long, conflicts_with = "role", required_unless_present = "role")]
        human: bool,

        /// Dispatch as an agent in this role
        #[arg(long, value_enum)]
        role: Option<AgentRole>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "valueloop=debug,info"
    } else {
        "valueloop=info,warn"
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    match execute(cli.command, &project_path).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            let loop_error = e.downcast_ref::<LoopError>();
            if loop_error.is_some_and(LoopError::requires_human) {
                eprintln!(
                    "   {} inspect .valueloop/ before running again",
                    "Needs attention:".yellow()
                );
            }
            std::process::exit(loop_error.map_or(1, LoopError::exit_code));
        }
    }
}

/// Exit code reported when a command ran but did not get its way
/// (rejected dispatch, failed pause verification).
const EXIT_REFUSED: i32 = 2;

fn load_state(store: &StateStore) -> anyhow::Result<LoopState> {
    store.load()?.ok_or_else(|| {
        anyhow::anyhow!(
            "No state at {}; run `valueloop init` first",
            store.path().display()
        )
    })
}

async fn execute(command: Commands, project: &Path) -> anyhow::Result<i32> {
    match command {
        Commands::Init { unit, force } => init(project, unit, force),
        Commands::Run { max_iterations } => run(project, max_iterations).await,
        Commands::Status { json } => status(project, json),
        Commands::Checkpoint { label } => {
            let _lock = ProcessLock::acquire(&LoopConfig::state_dir(project))?;
            let store = StateStore::for_project(project);
            let mut state = load_state(&store)?;
            let vcs = GitWorkspace::new(project);
            let checkpoint = create_checkpoint(&mut state, &vcs, &label)?;
            store.save(&state)?;
            println!("{} {}", "Checkpoint:".cyan().bold(), checkpoint.summary());
            Ok(0)
        }
        Commands::Rollback { label, reason } => {
            let _lock = ProcessLock::acquire(&LoopConfig::state_dir(project))?;
            let store = StateStore::for_project(project);
            let mut state = load_state(&store)?;
            let vcs = GitWorkspace::new(project);
            let record = RollbackManager::new(&store, &vcs).rollback(&mut state, &label, &reason)?;
            println!(
                "{} rolled back to '{}' ({} item(s) reverted, {} check(s) reset)",
                "✓".green(),
                record.label,
                record.reverted_items.len(),
                record.reset_checks.len()
            );
            Ok(0)
        }
        Commands::Resume => resume(project).await,
        Commands::Dispatch {
            op,
            payload,
            human,
            role,
        } => dispatch(project, &op, &payload, human, role),
    }
}

fn init(project: &Path, unit: Option<String>, force: bool) -> anyhow::Result<i32> {
    let state_dir = LoopConfig::state_dir(project);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;

    let config_path = LoopConfig::config_path(project);
    let config = if config_path.exists() && !force {
        println!(
            "{} {} already exists (use --force to overwrite)",
            "Note:".yellow(),
            config_path.display()
        );
        LoopConfig::load(project)?
    } else {
        let mut config = LoopConfig::default();
        if let Some(unit) = &unit {
            config.unit = unit.clone();
        }
        config.validate()?;
        std::fs::write(&config_path, config.to_toml()?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("{} Wrote {}", "✓".green(), config_path.display());
        config
    };

    if ensure_gitignore_file(project, GITIGNORE_PATTERNS)? {
        println!("{} Updated .gitignore", "✓".green());
    }

    let store = StateStore::for_project(project);
    if store.path().exists() {
        println!("{} State already present at {}", "Note:".yellow(), store.path().display());
    } else {
        let mut state = LoopState::new(&config.unit);
        state.monitor.strategy = config.strategy.clone();
        store.save(&state)?;
        println!("{} Initialized state for unit '{}'", "✓".green(), config.unit);
    }
    Ok(0)
}

async fn run(project: &Path, max_iterations: Option<u32>) -> anyhow::Result<i32> {
    let config = LoopConfig::load(project)?;
    let mut orchestrator = Orchestrator::new(project, config)?;
    if let Some(max) = max_iterations {
        orchestrator = orchestrator.with_max_iterations(max);
    }

    match orchestrator.run().await? {
        RunOutcome::Completed => {
            println!("{} Unit delivered", "✓".green().bold());
        }
        RunOutcome::Paused(reason) => {
            println!("\n{} {}", "Paused:".yellow().bold(), reason);
            if let Ok(Some(state)) = orchestrator.store().load() {
                if let Some(pause) = state.pause {
                    println!("   {}", pause.instructions);
                    if let Some(verify) = pause.verify_command {
                        println!("   Verified on resume with: {}", verify.cyan());
                    }
                }
            }
            println!("   Then run {}", "valueloop resume".bold());
        }
        RunOutcome::MaxIterations(n) => {
            println!(
                "{} Stopped after {} iterations; run again to continue",
                "Note:".yellow(),
                n
            );
        }
    }
    Ok(0)
}

fn status(project: &Path, json: bool) -> anyhow::Result<i32> {
    let store = StateStore::for_project(project);
    let Some(state) = store.load()? else {
        println!("No state yet; run {} first", "valueloop init".bold());
        return Ok(0);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&dashboard(&state))?);
        return Ok(0);
    }

    let tier = match state.monitor.status {
        Tier::Green => "GREEN".green(),
        Tier::Yellow => "YELLOW".yellow(),
        Tier::Red => "RED".red(),
    };
    println!("\n{} {}", "Unit:".cyan().bold(), state.unit);
    println!("{}", "─".repeat(60));
    println!("   Iteration: {}   Tier: {}", state.iteration, tier);
    if let Some(phase) = &state.active_phase {
        println!("   Phase: {phase}");
    }
    if state.completed {
        println!("   {}", "Completed".green().bold());
    }
    if let Some(pause) = &state.pause {
        println!("   {} {}", "Paused:".yellow().bold(), pause.reason);
        println!("      {}", pause.instructions);
    }

    let mut items: BTreeMap<String, usize> = BTreeMap::new();
    for item in state.work_items.values() {
        *items.entry(item.status.to_string()).or_default() += 1;
    }
    println!("\n   Work items ({}):", state.work_items.len());
    for (status, count) in &items {
        println!("     {status}: {count}");
    }

    let mut checks: BTreeMap<String, usize> = BTreeMap::new();
    for check in state.checks.values() {
        *checks.entry(check.status.to_string()).or_default() += 1;
    }
    println!("\n   Checks ({}):", state.checks.len());
    for (status, count) in &checks {
        println!("     {status}: {count}");
    }

    if let Some(snapshot) = state.latest_snapshot() {
        println!(
            "\n   Value: {:.2} ({} of {} verified, {} gap(s))",
            snapshot.score,
            snapshot.verified,
            snapshot.total,
            snapshot.gaps.len()
        );
    }
    println!(
        "   Tokens: {}{}",
        state.budget.tokens_used,
        state
            .budget
            .token_budget
            .map(|b| format!(" / {b}"))
            .unwrap_or_default()
    );

    if !state.checkpoints.is_empty() {
        println!("\n   Checkpoints:");
        for checkpoint in state.checkpoints.iter().rev().take(5) {
            println!("     {}", checkpoint.summary());
        }
    }
    Ok(0)
}

async fn resume(project: &Path) -> anyhow::Result<i32> {
    let config = LoopConfig::load(project)?;
    let _lock = ProcessLock::acquire(&LoopConfig::state_dir(project))?;
    let store = StateStore::for_project(project);
    let mut state = load_state(&store)?;
    let runner = ExecutionRunner::new(project, config.runner);

    match resume_paused(&runner, &mut state).await? {
        ResumeOutcome::NotPaused => {
            println!("{} Loop is not paused", "Note:".yellow());
            Ok(0)
        }
        ResumeOutcome::Resumed => {
            store.save(&state)?;
            println!("{} Pause cleared; run {}", "✓".green(), "valueloop run".bold());
            Ok(0)
        }
        ResumeOutcome::VerificationFailed(output) => {
            eprintln!("{} Verification failed:", "✗".red());
            eprintln!("{}", output.trim());
            Ok(EXIT_REFUSED)
        }
    }
}

fn dispatch(
    project: &Path,
    op: &str,
    payload: &str,
    human: bool,
    role: Option<AgentRole>,
) -> anyhow::Result<i32> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let caller = match role {
        Some(role) if !human => Caller::Agent(role),
        _ => Caller::Human,
    };

    let config = LoopConfig::load(project)?;
    let _lock = ProcessLock::acquire(&LoopConfig::state_dir(project))?;
    let store = StateStore::for_project(project);
    let mut state = store.load_or_new(&config.unit)?;
    let dispatcher = ToolDispatcher::new(&config);

    let outcome = dispatcher.dispatch(&mut state, caller, op, payload);
    println!("{}", serde_json::to_string_pretty(&outcome.to_envelope())?);
    if outcome.is_applied() {
        store.save(&state)?;
        Ok(0)
    } else {
        Ok(EXIT_REFUSED)
    }
}

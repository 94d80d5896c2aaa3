//! The outer loop.
//!
//! Exactly one decision, one handler, one metrics pass and one persist per
//! iteration. The state lives on the stack of [`Orchestrator::run`] and is
//! lent to each component for the duration of a single call.
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(project_dir, LoopConfig::load(&project_dir)?)?;
//! match orchestrator.run().await? {
//!     RunOutcome::Completed => println!("shipped"),
//!     RunOutcome::Paused(reason) => println!("needs a human: {reason}"),
//!     RunOutcome::MaxIterations(n) => println!("stopped after {n} iterations"),
//! }
//! ```

mod handlers;

use chrono::Utc;
use globset::GlobSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agent::{invoke_with_timeout, AgentCapability, AgentRole, ClaudeCli};
use crate::checkpoint::RollbackManager;
use crate::config::{LoopConfig, GITIGNORE_PATTERNS};
use crate::decision::{next_action, Action};
use crate::dispatch::{Caller, DispatchOutcome, StateScope, ToolDispatcher};
use crate::error::Result;
use crate::lock::ProcessLock;
use crate::monitor::{self, StrategyReasoner};
use crate::runner::{ExecutionRunner, UnitResult, TIMEOUT_SENTINEL};
use crate::state::{
    CheckStatus, FailureRecord, ItemStatus, IterationRecord, LoopState, ServiceHealth,
    StateStore, Tier,
};
use crate::vcs::{sensitive_set, GitWorkspace, VersionControl};

/// External collaborators, injectable for tests.
#[derive(Clone)]
pub struct LoopDependencies {
    pub agent: Arc<dyn AgentCapability>,
    pub vcs: Arc<dyn VersionControl>,
}

impl LoopDependencies {
    /// Claude CLI and git in `project_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::MissingTool`](crate::error::LoopError::MissingTool) if the agent binary is not on `PATH`.
    pub fn real(project_dir: &Path, config: &LoopConfig) -> Result<Self> {
        Ok(Self {
            agent: Arc::new(ClaudeCli::new(project_dir, config.agent.clone())?),
            vcs: Arc::new(GitWorkspace::new(project_dir)),
        })
    }
}

/// Why [`Orchestrator::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Paused(String),
    MaxIterations(u32),
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub iteration: u32,
    pub action: Action,
    pub progressed: bool,
    pub tokens: u64,
    pub note: Option<String>,
    pub tier: Tier,
}

/// What a handler reports back to the step.
#[derive(Debug, Clone, Default)]
pub(crate) struct HandlerReport {
    pub tokens: u64,
    pub note: Option<String>,
}

impl HandlerReport {
    fn note(note: impl Into<String>) -> Self {
        Self {
            tokens: 0,
            note: Some(note.into()),
        }
    }
}

/// Result of one agent consultation.
pub(crate) struct Consultation {
    pub tokens: u64,
    pub applied: usize,
    pub rejected: Vec<String>,
}

/// Outcome of [`Orchestrator::resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    NotPaused,
    Resumed,
    VerificationFailed(String),
}

/// Drives the delivery loop for one project.
pub struct Orchestrator {
    project_dir: PathBuf,
    config: LoopConfig,
    store: StateStore,
    dispatcher: ToolDispatcher,
    deps: LoopDependencies,
    runner: ExecutionRunner,
    sensitive: GlobSet,
    max_iterations: u32,
}

impl Orchestrator {
    /// Orchestrator with the real agent and git.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the agent binary
    /// cannot be found.
    pub fn new(project_dir: impl Into<PathBuf>, config: LoopConfig) -> Result<Self> {
        let project_dir = project_dir.into();
        let deps = LoopDependencies::real(&project_dir, &config)?;
        Self::with_deps(project_dir, config, deps)
    }

    /// Orchestrator with injected collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_deps(
        project_dir: impl Into<PathBuf>,
        config: LoopConfig,
        deps: LoopDependencies,
    ) -> Result<Self> {
        config.validate()?;
        let project_dir = project_dir.into();
        let sensitive = sensitive_set(&config.sensitive_patterns)?;
        let runner = ExecutionRunner::new(&project_dir, config.runner.clone());
        info!(
            "Orchestrator for unit '{}': {} worker(s), {} service(s), {} phase(s)",
            config.unit,
            runner.workers(),
            config.services.len(),
            config.phases.len()
        );
        Ok(Self {
            store: StateStore::for_project(&project_dir),
            dispatcher: ToolDispatcher::new(&config),
            max_iterations: config.limits.max_iterations,
            project_dir,
            config,
            deps,
            runner,
            sensitive,
        })
    }

    /// Override the per-run iteration cap.
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn runner(&self) -> &ExecutionRunner {
        &self.runner
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    pub fn rollback_manager(&self) -> RollbackManager<'_> {
        RollbackManager::new(&self.store, &*self.deps.vcs)
    }

    /// Run until completion, a pause, or the iteration cap.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::LockHeld`](crate::error::LoopError::LockHeld) when another process owns the unit,
    /// and propagates unrecoverable errors (corrupt state, failed rollback,
    /// persistence failures).
    pub async fn run(&self) -> Result<RunOutcome> {
        let _lock = ProcessLock::acquire(&LoopConfig::state_dir(&self.project_dir))?;
        let mut state = self.store.load_or_new(&self.config.unit)?;
        self.prepare(&mut state).await?;
        self.store.save(&state)?;

        if let Some(pause) = &state.pause {
            return Ok(RunOutcome::Paused(pause.reason.clone()));
        }

        for _ in 0..self.max_iterations {
            if state.completed {
                return Ok(RunOutcome::Completed);
            }
            let report = self.step(&mut state).await?;
            self.store.save(&state)?;
            debug!(
                "Iteration {} finished: {} progressed={} tier={}",
                report.iteration, report.action, report.progressed, report.tier
            );
            if let Some(pause) = &state.pause {
                warn!("Paused: {}", pause.reason);
                return Ok(RunOutcome::Paused(pause.reason.clone()));
            }
        }

        if state.completed {
            Ok(RunOutcome::Completed)
        } else {
            warn!("Stopped after {} iterations", self.max_iterations);
            Ok(RunOutcome::MaxIterations(self.max_iterations))
        }
    }

    /// Startup: interrupted rollback first, then budget, phase, initial
    /// strategy, version control and service probes.
    ///
    /// # Errors
    ///
    /// Propagates rollback recovery and version-control failures.
    pub async fn prepare(&self, state: &mut LoopState) -> Result<()> {
        if let Some(record) = self.rollback_manager().recover(state)? {
            info!("Completed interrupted rollback to '{}'", record.label);
        }

        let phases = &self.config.phases;
        let token_budget = self.config.agent.token_budget;
        let strategy = &self.config.strategy;
        bookkeeping(state, "prepare", |s| {
            s.budget.token_budget = token_budget;
            let known = s
                .active_phase
                .as_ref()
                .is_some_and(|p| phases.iter().any(|q| q == p));
            if !known {
                s.active_phase = phases.first().cloned();
            }
            // Configured knobs seed a fresh run; later changes belong to the monitor.
            if s.iteration == 0 && s.monitor.strategy_history.is_empty() {
                s.monitor.strategy = strategy.clone();
            }
            Ok(())
        })?;

        self.start_vcs(state)?;
        self.probe_services(state).await
    }

    fn start_vcs(&self, state: &mut LoopState) -> Result<()> {
        let vcs = &*self.deps.vcs;
        if state.vcs.base_revision.is_none() {
            let stashed = vcs.stash_local_changes()?;
            if stashed {
                info!("Stashed pre-existing local changes");
            }
            let base = vcs.current_revision()?;
            bookkeeping(state, "vcs_start", |s| {
                s.vcs.stashed = stashed;
                s.vcs.base_revision = Some(base);
                Ok(())
            })?;
        }

        let branch = format!("valueloop/{}", self.config.unit);
        if vcs.current_branch()? != branch {
            vcs.create_branch(&branch)?;
            info!("Working on branch {}", branch);
        }
        bookkeeping(state, "vcs_branch", |s| {
            s.vcs.branch = Some(branch);
            Ok(())
        })?;

        if vcs.ensure_gitignore(GITIGNORE_PATTERNS)? {
            debug!("Updated .gitignore");
        }
        Ok(())
    }

    /// Probe every declared service and record its health.
    pub(crate) async fn probe_services(&self, state: &mut LoopState) -> Result<()> {
        for service in &self.config.services {
            let result = self
                .runner
                .probe(&service.name, &service.health_command)
                .await;
            record_service(state, &service.name, &result)?;
        }
        Ok(())
    }

    /// Run one iteration.
    ///
    /// Recoverable handler errors (agent failures, timeouts, rolled-back
    /// handlers) count as an iteration without progress.
    ///
    /// # Errors
    ///
    /// Propagates unrecoverable errors.
    pub async fn step(&self, state: &mut LoopState) -> Result<StepReport> {
        let before = state.progress_marker();
        bookkeeping(state, "begin_iteration", |s| {
            s.iteration += 1;
            Ok(())
        })?;

        let action = next_action(&self.config, state);
        info!("Iteration {}: {}", state.iteration, action);

        let mut report = match self.handle(action, state).await {
            Ok(report) => report,
            Err(e) if e.is_recoverable() => {
                warn!("{} failed: {}", action, e);
                HandlerReport::note(e.to_string())
            }
            Err(e) => return Err(e),
        };

        if let Some(request) = state.pending_rollback.clone() {
            let record = self
                .rollback_manager()
                .rollback(state, &request.label, &request.reason)?;
            let note = format!("rolled back to '{}'", record.label);
            report.note = Some(match report.note.take() {
                Some(n) => format!("{n}; {note}"),
                None => note,
            });
        }

        let progressed = before.advanced_by(&state.progress_marker());
        let iteration = state.iteration;
        let tokens = report.tokens;
        let note = report.note.clone();
        bookkeeping(state, "end_iteration", move |s| {
            s.budget.tokens_used += tokens;
            if progressed {
                s.no_progress_count = 0;
                s.course_corrections = 0;
                s.last_progress_iteration = iteration;
            } else {
                s.no_progress_count += 1;
            }
            s.push_history(IterationRecord {
                iteration,
                action: action.to_string(),
                progressed,
                tokens,
                note,
                at: Utc::now(),
            });
            Ok(())
        })?;

        let tier = self.monitor_pass(state).await?;

        Ok(StepReport {
            iteration,
            action,
            progressed,
            tokens: report.tokens,
            note: report.note,
            tier,
        })
    }

    async fn monitor_pass(&self, state: &mut LoopState) -> Result<Tier> {
        let config = &self.config;
        let tier = ToolDispatcher::transact(state, &[StateScope::Monitor], "monitor", |s| {
            Ok(monitor::run_pass(config, s))
        })?;
        if tier != Tier::Red {
            return Ok(tier);
        }

        let reasoner = StrategyReasoner::new(&*self.deps.agent, &self.dispatcher);
        match reasoner.reason(state).await {
            Ok((_, tokens)) => {
                bookkeeping(state, "strategy_tokens", |s| {
                    s.budget.tokens_used += tokens;
                    Ok(())
                })?;
            }
            Err(e) if e.is_recoverable() => warn!("Strategy reasoning failed: {}", e),
            Err(e) => return Err(e),
        }
        Ok(tier)
    }

    /// Invoke the agent in `role` and dispatch every call it reports.
    pub(crate) async fn consult(
        &self,
        state: &mut LoopState,
        role: AgentRole,
        prompt: &str,
    ) -> Result<Consultation> {
        let profile = self.config.agent.profile(role);
        let response =
            invoke_with_timeout(&*self.deps.agent, role, profile.timeout_secs, prompt).await?;

        let mut consultation = Consultation {
            tokens: response.tokens_used,
            applied: 0,
            rejected: Vec::new(),
        };
        for call in &response.tool_calls {
            match self.dispatcher.dispatch_call(state, Caller::Agent(role), call) {
                DispatchOutcome::Applied { .. } => consultation.applied += 1,
                DispatchOutcome::Rejected(reason) => consultation.rejected.push(reason),
                DispatchOutcome::Failed { error } => consultation.rejected.push(error),
            }
        }
        debug!(
            "{}: {} call(s) applied, {} refused",
            role,
            consultation.applied,
            consultation.rejected.len()
        );
        Ok(consultation)
    }

    /// Clear the pause if its verification command (if any) succeeds.
    ///
    /// # Errors
    ///
    /// Propagates transaction failures.
    pub async fn resume(&self, state: &mut LoopState) -> Result<ResumeOutcome> {
        resume_paused(&self.runner, state).await
    }
}

/// Clear the pause if its verification command (if any) succeeds.
///
/// Resuming also resets the stall counters and returns items blocked on a
/// human action to pending. Needs no agent, so the CLI can resume without
/// one installed.
///
/// # Errors
///
/// Propagates transaction failures.
pub async fn resume_paused(runner: &ExecutionRunner, state: &mut LoopState) -> Result<ResumeOutcome> {
    let Some(pause) = state.pause.clone() else {
        return Ok(ResumeOutcome::NotPaused);
    };

    if let Some(command) = pause.verify_command.as_deref() {
        let result = runner.probe("resume", command).await;
        if !result.passed {
            warn!("Pause verification failed: {}", result.output.trim());
            return Ok(ResumeOutcome::VerificationFailed(result.output));
        }
    }

    ToolDispatcher::transact(
        state,
        &[StateScope::Pause, StateScope::WorkItems, StateScope::Bookkeeping],
        "resume",
        |s| {
            s.pause = None;
            s.no_progress_count = 0;
            s.course_corrections = 0;
            for item in s.work_items.values_mut() {
                if item.is_blocked_on_human() {
                    item.status = ItemStatus::Pending;
                    item.block_reason = None;
                }
            }
            Ok(())
        },
    )?;
    info!("Resumed after: {}", pause.reason);
    Ok(ResumeOutcome::Resumed)
}

/// Mutate loop bookkeeping inside a transaction.
pub(crate) fn bookkeeping<T, F>(state: &mut LoopState, label: &str, f: F) -> Result<T>
where
    F: FnOnce(&mut LoopState) -> anyhow::Result<T>,
{
    ToolDispatcher::transact(state, &[StateScope::Bookkeeping], label, f)
}

pub(crate) fn record_service(state: &mut LoopState, name: &str, result: &UnitResult) -> Result<()> {
    let health = ServiceHealth {
        name: name.to_string(),
        healthy: result.passed,
        detail: result.output.trim().to_string(),
        checked_at: Utc::now(),
    };
    if !health.healthy {
        warn!("Service '{}' unhealthy: {}", name, health.detail);
    }
    ToolDispatcher::transact(state, &[StateScope::Services], "record_service", move |s| {
        s.services.insert(health.name.clone(), health);
        Ok(())
    })
}

/// Record verification results, then unblock checks whose prerequisite
/// categories now pass.
pub(crate) fn record_results(
    state: &mut LoopState,
    results: &[UnitResult],
    regression_of: Option<&str>,
) -> Result<()> {
    ToolDispatcher::transact(state, &[StateScope::Checks], "record_results", |s| {
        for result in results {
            let Some(check) = s.checks.get_mut(&result.id) else {
                continue;
            };
            if result.passed {
                check.status = CheckStatus::Passed;
            } else {
                check.status = CheckStatus::Failed;
                check.failures.push(FailureRecord {
                    timestamp: Utc::now(),
                    exit_code: result.exit_code,
                    output: if result.timed_out {
                        TIMEOUT_SENTINEL.to_string()
                    } else {
                        result.output.clone()
                    },
                    fix: None,
                    regression_of: regression_of.map(str::to_string),
                });
            }
        }

        let unblocked: Vec<String> = s
            .checks
            .values()
            .filter(|c| c.status == CheckStatus::Blocked && s.categories_passed(&c.depends_on))
            .map(|c| c.id.clone())
            .collect();
        for id in unblocked {
            if let Some(check) = s.checks.get_mut(&id) {
                debug!("Check '{}' unblocked", id);
                check.status = CheckStatus::Pending;
            }
        }
        Ok(())
    })
}

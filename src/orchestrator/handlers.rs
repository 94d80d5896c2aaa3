//! One handler per [`Action`].

use chrono::Utc;
use std::fmt::Write as _;
use tracing::{debug, info, warn};

use super::{bookkeeping, record_results, record_service, HandlerReport, Orchestrator};
use crate::agent::AgentRole;
use crate::checkpoint::create_checkpoint;
use crate::decision::{is_open, stall_exhausted, Action};
use crate::dispatch::{StateScope, ToolDispatcher};
use crate::error::Result;
use crate::state::{
    BlockReason, CheckRecord, CheckStatus, ExecutionOrder, Gap, GapSeverity,
    ItemStatus, LoopState, PauseState, Recommendation, TriageGranularity, ValueSnapshot, WorkItem,
};

/// Maximum failure output quoted back to an agent per check.
const PROMPT_OUTPUT_CHARS: usize = 2000;

impl Orchestrator {
    pub(super) async fn handle(&self, action: Action, state: &mut LoopState) -> Result<HandlerReport> {
        match action {
            Action::InteractivePause => self.interactive_pause(state),
            Action::ServiceFix => self.service_fix(state).await,
            Action::CourseCorrect => self.course_correct(state).await,
            Action::GenerateChecks => self.generate_checks(state).await,
            Action::Fix => self.fix(state).await,
            Action::Research => self.research(state).await,
            Action::Execute => self.execute(state).await,
            Action::RunChecks => self.run_pending_checks(state).await,
            Action::CriticalEval => self.critical_eval(state).await,
            Action::CoherenceEval => self.coherence_eval(state).await,
            Action::ExitGate => self.exit_gate(state).await,
        }
    }

    // ========================================================================
    // Pause
    // ========================================================================

    fn interactive_pause(&self, state: &mut LoopState) -> Result<HandlerReport> {
        if let Some(pause) = &state.pause {
            return Ok(HandlerReport::note(format!("waiting on a human: {}", pause.reason)));
        }

        let pause = if stall_exhausted(&self.config, state) {
            PauseState {
                reason: format!(
                    "stalled: {} iterations without progress after {} course corrections",
                    state.no_progress_count, state.course_corrections
                ),
                instructions: "Review the work items and failing checks (`valueloop status`), \
                               adjust them with `valueloop dispatch --human`, then run `valueloop resume`."
                    .to_string(),
                verify_command: None,
                requested_at: Utc::now(),
            }
        } else if let Some((id, instructions, verify)) = state.items_in_scope().find_map(|i| {
            match &i.block_reason {
                Some(BlockReason::HumanAction {
                    instructions,
                    verify_command,
                }) if i.status == ItemStatus::Blocked => {
                    Some((i.id.clone(), instructions.clone(), verify_command.clone()))
                }
                _ => None,
            }
        }) {
            PauseState {
                reason: format!("work item '{id}' needs a human action"),
                instructions,
                verify_command: verify,
                requested_at: Utc::now(),
            }
        } else {
            PauseState {
                reason: "paused".to_string(),
                instructions: "Run `valueloop resume` to continue.".to_string(),
                verify_command: None,
                requested_at: Utc::now(),
            }
        };

        let reason = pause.reason.clone();
        ToolDispatcher::transact(state, &[StateScope::Pause], "pause", |s| {
            s.pause = Some(pause);
            Ok(())
        })?;
        warn!("Pausing for a human: {}", reason);
        Ok(HandlerReport::note(reason))
    }

    // ========================================================================
    // Services
    // ========================================================================

    async fn service_fix(&self, state: &mut LoopState) -> Result<HandlerReport> {
        let mut report = HandlerReport::default();
        let unhealthy: Vec<_> = self
            .config
            .services
            .iter()
            .filter(|svc| state.services.get(&svc.name).is_some_and(|h| !h.healthy))
            .collect();

        for service in unhealthy {
            let probe = self.runner.probe(&service.name, &service.health_command).await;
            record_service(state, &service.name, &probe)?;
            if probe.passed {
                info!("Service '{}' recovered on re-probe", service.name);
                continue;
            }

            let prompt = format!(
                "The declared service '{}' is unhealthy.\n\
                 Health command: `{}`\nOutput:\n```\n{}\n```\n\n\
                 Bring it back up. Report its health with report_service_health, \
                 or escalate if a human must act.",
                service.name,
                service.health_command,
                clip(&probe.output, PROMPT_OUTPUT_CHARS)
            );
            let consultation = self.consult(state, AgentRole::ServiceFixer, &prompt).await?;
            report.tokens += consultation.tokens;
            if state.pause.is_some() {
                return Ok(report);
            }

            let probe = self.runner.probe(&service.name, &service.health_command).await;
            record_service(state, &service.name, &probe)?;
            if !probe.passed && state.no_progress_count >= self.config.limits.stall_threshold {
                let reason = format!("service '{}' stays unhealthy", service.name);
                let pause = PauseState {
                    reason: reason.clone(),
                    instructions: format!(
                        "Start '{}' so that `{}` succeeds.",
                        service.name, service.health_command
                    ),
                    verify_command: Some(service.health_command.clone()),
                    requested_at: Utc::now(),
                };
                ToolDispatcher::transact(state, &[StateScope::Pause], "service_pause", |s| {
                    s.pause = Some(pause);
                    Ok(())
                })?;
                report.note = Some(reason);
                return Ok(report);
            }
        }
        Ok(report)
    }

    // ========================================================================
    // Planning
    // ========================================================================

    async fn course_correct(&self, state: &mut LoopState) -> Result<HandlerReport> {
        let stalled = state.no_progress_count > self.config.limits.stall_threshold;
        let situation = if stalled {
            format!(
                "No progress for {} iterations. Change the plan: split, reorder, descope \
                 or add the missing prerequisite work.",
                state.no_progress_count
            )
        } else if state.items_in_scope().next().is_none() {
            "There is no plan yet. Break the goal into small work items with clear value and \
             acceptance criteria and explicit dependencies."
                .to_string()
        } else if state.failed_checks().next().is_some() {
            "Checks keep failing after every fix attempt and research. Decide whether to \
             restructure the work, add prerequisite items, or descope."
                .to_string()
        } else if state
            .items_in_scope()
            .any(|i| is_open(i) && !state.dependencies_satisfied(i))
        {
            "Pending work is waiting on dependencies that cannot complete. Repair the \
             dependency graph."
                .to_string()
        } else {
            "Review the plan against the goal and add whatever is still missing.".to_string()
        };

        let prompt = format!(
            "# Course correction\n\n{situation}\n\n{}",
            self.state_summary(state)
        );
        let consultation = self.consult(state, AgentRole::Planner, &prompt).await?;

        if stalled {
            bookkeeping(state, "course_correct", |s| {
                s.course_corrections += 1;
                s.no_progress_count = 0;
                Ok(())
            })?;
        }
        Ok(HandlerReport {
            tokens: consultation.tokens,
            note: Some(format!("{} plan change(s)", consultation.applied)),
        })
    }

    async fn coherence_eval(&self, state: &mut LoopState) -> Result<HandlerReport> {
        let prompt = format!(
            "# Coherence review\n\nThe structure of the plan was flagged for review. Check that \
             work items, dependencies and checks still describe one coherent delivery; fix \
             what does not fit.\n\n{}",
            self.state_summary(state)
        );
        let consultation = self.consult(state, AgentRole::Evaluator, &prompt).await?;
        bookkeeping(state, "coherence_done", |s| {
            s.coherence_pending = false;
            Ok(())
        })?;
        Ok(HandlerReport {
            tokens: consultation.tokens,
            note: None,
        })
    }

    // ========================================================================
    // Checks
    // ========================================================================

    async fn generate_checks(&self, state: &mut LoopState) -> Result<HandlerReport> {
        let mut done = String::new();
        for item in state
            .items_in_scope()
            .filter(|i| i.status == ItemStatus::Done)
        {
            let _ = writeln!(done, "- {}: {} (acceptance: {})", item.id, item.description, item.acceptance);
        }
        let prompt = format!(
            "# Write checks\n\nWrite automated checks (shell commands run from the project \
             root) that verify the completed work below. Group them into categories and use \
             depends_on when one category only makes sense after another passes.\n\n\
             ## Completed work\n{done}"
        );
        let consultation = self.consult(state, AgentRole::CheckWriter, &prompt).await?;
        bookkeeping(state, "checks_generated", |s| {
            s.checks_generated = true;
            Ok(())
        })?;
        Ok(HandlerReport {
            tokens: consultation.tokens,
            note: Some(format!("{} check(s) added", consultation.applied)),
        })
    }

    async fn run_pending_checks(&self, state: &mut LoopState) -> Result<HandlerReport> {
        let pending: Vec<&CheckRecord> = state
            .checks
            .values()
            .filter(|c| c.status == CheckStatus::Pending)
            .collect();
        let runnable: Vec<String> = pending
            .iter()
            .filter(|c| state.categories_passed(&c.depends_on))
            .map(|c| c.id.clone())
            .collect();
        let to_block: Vec<String> = if runnable.is_empty() {
            pending.iter().map(|c| c.id.clone()).collect()
        } else {
            pending
                .iter()
                .filter(|c| state.categories_broken(&c.depends_on))
                .map(|c| c.id.clone())
                .collect()
        };

        if !to_block.is_empty() {
            ToolDispatcher::transact(state, &[StateScope::Checks], "block_checks", |s| {
                for id in &to_block {
                    if let Some(check) = s.checks.get_mut(id) {
                        check.status = CheckStatus::Blocked;
                    }
                }
                Ok(())
            })?;
            debug!("Blocked {} check(s) on unmet prerequisites", to_block.len());
        }
        if runnable.is_empty() {
            return Ok(HandlerReport::note("no runnable checks"));
        }

        let batch: Vec<&CheckRecord> = runnable.iter().filter_map(|id| state.checks.get(id)).collect();
        let results = self.runner.run_checks(&batch).await;
        let failed = results.iter().filter(|r| !r.passed).count();
        record_results(state, &results, None)?;
        info!("Ran {} check(s): {} failed", results.len(), failed);

        if state
            .checks
            .values()
            .all(|c| c.status == CheckStatus::Passed)
        {
            let label = format!("green-{}", state.iteration);
            if let Err(e) = create_checkpoint(state, &*self.deps.vcs, &label) {
                warn!("Could not checkpoint '{}': {}", label, e);
            }
        }
        Ok(HandlerReport::note(format!(
            "{} run, {} failed",
            results.len(),
            failed
        )))
    }

    async fn fix(&self, state: &mut LoopState) -> Result<HandlerReport> {
        let cap = state.monitor.strategy.max_fix_attempts;
        let eligible: Vec<&CheckRecord> = state
            .failed_checks()
            .filter(|c| c.attempts < cap)
            .collect();
        let selected: Vec<String> = match state.monitor.strategy.triage_granularity {
            TriageGranularity::Single => eligible.iter().take(1).map(|c| c.id.clone()).collect(),
            TriageGranularity::Category => {
                let category = eligible.first().map(|c| c.category.clone());
                eligible
                    .iter()
                    .filter(|c| Some(&c.category) == category.as_ref())
                    .map(|c| c.id.clone())
                    .collect()
            }
            TriageGranularity::All => eligible.iter().map(|c| c.id.clone()).collect(),
        };
        if selected.is_empty() {
            return Ok(HandlerReport::note("nothing to fix"));
        }

        ToolDispatcher::transact(state, &[StateScope::Checks], "fix_attempt", |s| {
            for id in &selected {
                if let Some(check) = s.checks.get_mut(id) {
                    check.attempts += 1;
                }
            }
            Ok(())
        })?;

        let mut failures = String::new();
        for id in &selected {
            let Some(check) = state.checks.get(id) else {
                continue;
            };
            let _ = writeln!(
                failures,
                "## {} ({}) attempt {}/{}\nCommand: `{}`",
                check.id, check.category, check.attempts, cap, check.command
            );
            if let Some(last) = check.last_failure() {
                if let Some(item) = &last.regression_of {
                    let _ = writeln!(failures, "Regressed after work item '{item}'.");
                }
                let _ = writeln!(failures, "```\n{}\n```", clip(&last.output, PROMPT_OUTPUT_CHARS));
            }
            for earlier in check.failures.iter().filter_map(|f| f.fix.as_deref()) {
                let _ = writeln!(failures, "Already tried: {earlier}");
            }
        }
        let prompt = format!(
            "# Fix failing checks\n\nMake these checks pass without weakening them. Record what \
             you changed with record_fix.\n\n{failures}"
        );
        let consultation = self.consult(state, AgentRole::Fixer, &prompt).await?;

        let batch: Vec<&CheckRecord> = selected.iter().filter_map(|id| state.checks.get(id)).collect();
        let results = self.runner.run_checks(&batch).await;
        let fixed = results.iter().filter(|r| r.passed).count();
        record_results(state, &results, None)?;
        if fixed > 0 {
            self.commit(state, &format!("fix: {} check(s) passing", fixed))?;
        }

        Ok(HandlerReport {
            tokens: consultation.tokens,
            note: Some(format!("{fixed}/{} fixed", selected.len())),
        })
    }

    async fn research(&self, state: &mut LoopState) -> Result<HandlerReport> {
        let fingerprint = state.failure_fingerprint();
        let mut failures = String::new();
        for check in state.failed_checks() {
            let _ = writeln!(
                failures,
                "## {} after {} fix attempts\n```\n{}\n```",
                check.id,
                check.attempts,
                check
                    .last_failure()
                    .map(|f| clip(&f.output, PROMPT_OUTPUT_CHARS))
                    .unwrap_or_default()
            );
        }
        let prompt = format!(
            "# Research\n\nThese checks still fail after the fix budget was spent. Investigate \
             the root cause and report findings with report_research_finding; add work items \
             for any prerequisite work.\n\n{failures}"
        );
        let consultation = self.consult(state, AgentRole::Researcher, &prompt).await?;
        bookkeeping(state, "research_attempted", |s| {
            s.research_attempted_for = Some(fingerprint);
            Ok(())
        })?;
        Ok(HandlerReport {
            tokens: consultation.tokens,
            note: None,
        })
    }

    // ========================================================================
    // Execute
    // ========================================================================

    async fn execute(&self, state: &mut LoopState) -> Result<HandlerReport> {
        let Some(id) = select_ready(state, state.monitor.strategy.execution_order) else {
            return Ok(HandlerReport::note("no ready item"));
        };

        ToolDispatcher::transact(state, &[StateScope::WorkItems], "start_item", |s| {
            if let Some(item) = s.work_items.get_mut(&id) {
                item.status = ItemStatus::InProgress;
            }
            Ok(())
        })?;

        let prompt = match state.work_items.get(&id) {
            Some(item) => execute_prompt(item, state),
            None => return Ok(HandlerReport::note("selected item vanished")),
        };
        let consultation = self.consult(state, AgentRole::Executor, &prompt).await;
        let tokens = consultation.as_ref().map_or(0, |c| c.tokens);

        let status = state.work_items.get(&id).map(|i| i.status);
        match status {
            Some(ItemStatus::Done) => {
                self.finish_item(state, &id).await?;
                Ok(HandlerReport {
                    tokens,
                    note: Some(format!("completed {id}")),
                })
            }
            Some(ItemStatus::InProgress | ItemStatus::Pending) => {
                let max = state.monitor.strategy.max_item_retries;
                ToolDispatcher::transact(state, &[StateScope::WorkItems], "item_retry", |s| {
                    if let Some(item) = s.work_items.get_mut(&id) {
                        item.retry_count += 1;
                        if item.retry_count >= max {
                            item.status = ItemStatus::Blocked;
                            item.block_reason = Some(BlockReason::MaxAttempts {
                                attempts: item.retry_count,
                                max,
                            });
                            warn!("Item '{}' blocked after {} attempts", item.id, item.retry_count);
                        } else {
                            item.status = ItemStatus::Pending;
                        }
                    }
                    Ok(())
                })?;
                consultation?;
                Ok(HandlerReport {
                    tokens,
                    note: Some(format!("{id} not completed")),
                })
            }
            _ => {
                consultation?;
                Ok(HandlerReport {
                    tokens,
                    note: Some(format!("{id} left {}", status.map(|s| s.to_string()).unwrap_or_default())),
                })
            }
        }
    }

    /// Record touched files, commit, and sweep for regressions.
    async fn finish_item(&self, state: &mut LoopState, id: &str) -> Result<()> {
        let files = match self.deps.vcs.modified_files() {
            Ok(files) => files,
            Err(e) => {
                warn!("Could not list modified files: {}", e);
                Vec::new()
            }
        };
        ToolDispatcher::transact(state, &[StateScope::WorkItems], "files_touched", |s| {
            if let Some(item) = s.work_items.get_mut(id) {
                item.files_touched.extend(files);
            }
            Ok(())
        })?;

        let description = state
            .work_items
            .get(id)
            .map(|i| i.description.lines().next().unwrap_or_default().to_string())
            .unwrap_or_default();
        self.commit(state, &format!("{id}: {description}"))?;

        let regressions = self.runner.regression_sweep(state).await;
        if !regressions.is_empty() {
            let results: Vec<_> = regressions.into_iter().map(|r| r.result).collect();
            warn!("{} regression(s) after '{}'", results.len(), id);
            record_results(state, &results, Some(id))?;
        }
        Ok(())
    }

    fn commit(&self, state: &mut LoopState, message: &str) -> Result<()> {
        match self
            .deps
            .vcs
            .commit_safe(message, &self.config.safe_dirs, &self.sensitive)
        {
            Ok(Some(rev)) => bookkeeping(state, "commit", |s| {
                s.vcs.last_commit = Some(rev);
                s.vcs.commits += 1;
                Ok(())
            }),
            Ok(None) => {
                debug!("Nothing to commit for '{}'", message);
                Ok(())
            }
            Err(e) => {
                warn!("Commit failed: {}", e);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Evaluation and exit
    // ========================================================================

    async fn critical_eval(&self, state: &mut LoopState) -> Result<HandlerReport> {
        let before = state.snapshots.len();
        let prompt = format!(
            "# Critical evaluation\n\nAssess how much of the target outcome is verifiably \
             delivered. Report exactly one report_value_snapshot with a score in [0, 1], the \
             remaining gaps and a recommendation. Add or descope work items where the plan no \
             longer matches the goal.\n\n{}",
            self.state_summary(state)
        );
        let consultation = self.consult(state, AgentRole::Evaluator, &prompt).await;

        if state.snapshots.len() == before {
            let snapshot = derived_snapshot(state);
            debug!("Evaluator reported no snapshot; derived score {:.2}", snapshot.score);
            ToolDispatcher::transact(state, &[StateScope::Snapshots], "derived_snapshot", |s| {
                s.snapshots.push(snapshot);
                Ok(())
            })?;
        }
        let iteration = state.iteration;
        bookkeeping(state, "critical_eval_done", |s| {
            s.last_critical_eval = Some(iteration);
            Ok(())
        })?;

        let consultation = consultation?;
        Ok(HandlerReport {
            tokens: consultation.tokens,
            note: state.latest_snapshot().map(|s| format!("value {:.2}", s.score)),
        })
    }

    async fn exit_gate(&self, state: &mut LoopState) -> Result<HandlerReport> {
        let all: Vec<&CheckRecord> = state
            .checks
            .values()
            .filter(|c| !c.command.trim().is_empty())
            .collect();
        let results = self.runner.run_checks(&all).await;
        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.id.clone())
            .collect();
        record_results(state, &results, None)?;
        if !failed.is_empty() {
            warn!("Exit gate sweep failed: {}", failed.join(", "));
            return Ok(HandlerReport::note(format!("exit gate failed: {}", failed.join(", "))));
        }

        let phases = &self.config.phases;
        let next_phase = state.active_phase.as_ref().and_then(|current| {
            phases
                .iter()
                .position(|p| p == current)
                .and_then(|i| phases.get(i + 1))
                .cloned()
        });

        if let Some(next) = next_phase {
            let finished = state.active_phase.clone().unwrap_or_default();
            create_checkpoint(state, &*self.deps.vcs, &format!("phase-{finished}"))?;
            bookkeeping(state, "advance_phase", |s| {
                s.active_phase = Some(next.clone());
                Ok(())
            })?;
            info!("Phase '{}' complete, advancing to '{}'", finished, next);
            return Ok(HandlerReport::note(format!("phase {finished} complete")));
        }

        self.commit(state, &format!("valueloop: ship {}", self.config.unit))?;
        create_checkpoint(state, &*self.deps.vcs, "ship")?;
        bookkeeping(state, "complete", |s| {
            s.completed = true;
            Ok(())
        })?;
        info!("Exit gate passed; unit '{}' complete", self.config.unit);
        Ok(HandlerReport::note("shipped"))
    }

    // ========================================================================
    // Prompts
    // ========================================================================

    fn state_summary(&self, state: &LoopState) -> String {
        let mut out = String::new();
        if let Some(phase) = &state.active_phase {
            let _ = writeln!(out, "Active phase: {phase}");
        }
        let _ = writeln!(out, "## Work items");
        for item in state.items_in_scope() {
            let deps = if item.dependencies.is_empty() {
                String::new()
            } else {
                format!(" after [{}]", item.dependencies.join(", "))
            };
            let _ = writeln!(out, "- {} [{}] {}{}", item.id, item.status, item.description, deps);
            if let Some(reason) = &item.block_reason {
                let _ = writeln!(out, "  blocked: {reason}");
            }
        }
        if !state.checks.is_empty() {
            let _ = writeln!(out, "## Checks");
            for check in state.checks.values() {
                let _ = writeln!(
                    out,
                    "- {} ({}) {} attempts={}",
                    check.id, check.category, check.status, check.attempts
                );
            }
        }
        if let Some(snapshot) = state.latest_snapshot() {
            let _ = writeln!(out, "## Latest value snapshot\nscore {:.2}", snapshot.score);
            for gap in &snapshot.gaps {
                let _ = writeln!(out, "- gap: {}", gap.description);
            }
        }
        if !state.research.is_empty() {
            let _ = writeln!(out, "## Research findings");
            for finding in state.research.iter().rev().take(5) {
                let _ = writeln!(out, "- {}: {}", finding.topic, finding.finding);
            }
        }
        out
    }
}

fn execute_prompt(item: &WorkItem, state: &LoopState) -> String {
    let mut out = format!(
        "# Work item {}\n\n{}\n\nValue: {}\nAcceptance: {}\n",
        item.id, item.description, item.value, item.acceptance
    );
    if !item.declared_files.is_empty() {
        let files: Vec<&str> = item.declared_files.iter().map(String::as_str).collect();
        let _ = writeln!(out, "Files: {}", files.join(", "));
    }
    if item.retry_count > 0 {
        let _ = writeln!(out, "Previous attempts: {}", item.retry_count);
    }
    let findings: Vec<_> = state
        .research
        .iter()
        .filter(|f| f.applies_to.iter().any(|a| a == &item.id))
        .collect();
    for finding in findings {
        let _ = writeln!(out, "Research: {}", finding.finding);
    }
    let _ = write!(
        out,
        "\nImplement it, then mark it done with modify_work_item once the acceptance \
         criteria hold. Escalate if a human must act."
    );
    out
}

/// Pick the next ready item according to `order`.
pub(crate) fn select_ready(state: &LoopState, order: ExecutionOrder) -> Option<String> {
    let ready: Vec<&WorkItem> = state
        .items_in_scope()
        .filter(|i| is_open(i) && state.dependencies_satisfied(i))
        .collect();
    let chosen = match order {
        ExecutionOrder::DependencyFirst => ready.into_iter().min_by(|a, b| {
            state
                .dependents_of(&b.id)
                .cmp(&state.dependents_of(&a.id))
                .then_with(|| a.id.cmp(&b.id))
        }),
        ExecutionOrder::Fifo => ready.into_iter().min_by_key(|i| (i.seq, i.id.clone())),
        ExecutionOrder::SmallestFirst => ready
            .into_iter()
            .min_by_key(|i| (i.description.chars().count(), i.id.clone())),
    };
    chosen.map(|i| i.id.clone())
}

/// Snapshot computed from state when the evaluator does not report one.
fn derived_snapshot(state: &LoopState) -> ValueSnapshot {
    let items: Vec<&WorkItem> = state
        .items_in_scope()
        .filter(|i| i.status != ItemStatus::Descoped)
        .collect();
    let total = items.len() as u32;
    let verified = items.iter().filter(|i| i.status == ItemStatus::Done).count() as u32;
    let blocked = items
        .iter()
        .filter(|i| i.status == ItemStatus::Blocked)
        .count() as u32;

    let check_ratio = if state.checks.is_empty() {
        1.0
    } else {
        state.passed_checks().len() as f64 / state.checks.len() as f64
    };
    let score = if total == 0 {
        0.0
    } else {
        f64::from(verified) / f64::from(total) * check_ratio
    };

    let mut gaps: Vec<Gap> = state
        .failed_checks()
        .map(|c| Gap {
            description: format!("check '{}' failing", c.id),
            severity: GapSeverity::High,
            remediation: None,
        })
        .collect();
    gaps.extend(items.iter().filter(|i| i.status == ItemStatus::Blocked).map(|i| Gap {
        description: format!("item '{}' blocked", i.id),
        severity: GapSeverity::Medium,
        remediation: None,
    }));

    ValueSnapshot {
        iteration: state.iteration,
        timestamp: Utc::now(),
        total,
        verified,
        blocked,
        score,
        gaps,
        recommendation: Recommendation::Continue,
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let tail: String = text.chars().rev().take(max).collect::<Vec<_>>().into_iter().rev().collect();
    format!("...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentResponse;
    use crate::config::LoopConfig;
    use crate::orchestrator::LoopDependencies;
    use crate::state::ResearchFinding;
    use crate::testing::{MockAgent, MockVcs};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn orchestrator(dir: &TempDir, agent: MockAgent, vcs: MockVcs) -> Orchestrator {
        let deps = LoopDependencies {
            agent: Arc::new(agent),
            vcs: Arc::new(vcs),
        };
        Orchestrator::with_deps(dir.path(), LoopConfig::default(), deps).unwrap()
    }

    fn ordering_state() -> LoopState {
        let mut state = LoopState::new("unit");
        state.insert_item(WorkItem::new("C", "a long description of the schema"));
        state.insert_item(WorkItem::new("B", "short"));
        state.insert_item(WorkItem::new("A", "medium sized one"));
        state.insert_item(WorkItem::new("D", "needs C").with_dependencies(["C"]));
        state.insert_item(WorkItem::new("E", "also needs C").with_dependencies(["C"]));
        state
    }

    #[test]
    fn test_select_ready_dependency_first() {
        let state = ordering_state();
        assert_eq!(
            select_ready(&state, ExecutionOrder::DependencyFirst).as_deref(),
            Some("C")
        );
    }

    #[test]
    fn test_select_ready_fifo_and_smallest() {
        let state = ordering_state();
        assert_eq!(select_ready(&state, ExecutionOrder::Fifo).as_deref(), Some("C"));
        assert_eq!(
            select_ready(&state, ExecutionOrder::SmallestFirst).as_deref(),
            Some("B")
        );
    }

    #[test]
    fn test_select_ready_skips_unready() {
        let mut state = LoopState::new("unit");
        state.insert_item(WorkItem::new("A", "first").with_status(ItemStatus::InProgress));
        state.insert_item(WorkItem::new("B", "second").with_dependencies(["A"]));
        assert_eq!(select_ready(&state, ExecutionOrder::Fifo), None);
    }

    #[test]
    fn test_derived_snapshot_weights_checks() {
        let mut state = LoopState::new("unit");
        state.insert_item(WorkItem::new("A", "a").with_status(ItemStatus::Done));
        state.insert_item(WorkItem::new("B", "b").with_status(ItemStatus::Blocked));
        state.insert_check(CheckRecord::new("c1", "unit").with_status(CheckStatus::Passed));
        state.insert_check(CheckRecord::new("c2", "unit").with_status(CheckStatus::Failed));

        let snapshot = derived_snapshot(&state);
        assert_eq!((snapshot.total, snapshot.verified, snapshot.blocked), (2, 1, 1));
        assert!((snapshot.score - 0.25).abs() < 1e-9);
        assert_eq!(snapshot.gaps.len(), 2);
        assert_eq!(snapshot.gaps[0].severity, GapSeverity::High);
    }

    #[test]
    fn test_clip_keeps_tail() {
        assert_eq!(clip("short", 10), "short");
        assert_eq!(clip("0123456789", 4), "...6789");
    }

    #[test]
    fn test_execute_prompt_includes_findings() {
        let mut state = LoopState::new("unit");
        let mut item = WorkItem::new("A", "Cache sessions");
        item.retry_count = 2;
        state.insert_item(item.clone());
        state.research.push(ResearchFinding {
            topic: "redis".to_string(),
            finding: "use SETEX for expiry".to_string(),
            applies_to: vec!["A".to_string()],
            iteration: 1,
        });

        let prompt = execute_prompt(&item, &state);
        assert!(prompt.contains("# Work item A"));
        assert!(prompt.contains("Previous attempts: 2"));
        assert!(prompt.contains("use SETEX for expiry"));
    }

    #[tokio::test]
    async fn test_fix_counts_attempt_and_reruns() {
        let dir = TempDir::new().unwrap();
        let agent = MockAgent::new().with_role_response(
            AgentRole::Fixer,
            AgentResponse::text("fixed").with_call(
                "record_fix",
                json!({"check_id": "c1", "description": "created the marker"}),
            ),
        );
        let orch = orchestrator(&dir, agent, MockVcs::new().with_modified_files(&["src/fix.rs"]));
        let mut state = LoopState::new("default");
        state.insert_check(
            CheckRecord::new("c1", "unit")
                .with_command("test -f fixed")
                .with_status(CheckStatus::Failed),
        );
        std::fs::write(dir.path().join("fixed"), "").unwrap();

        let report = orch.handle(Action::Fix, &mut state).await.unwrap();
        assert_eq!(report.note.as_deref(), Some("1/1 fixed"));
        let check = &state.checks["c1"];
        assert_eq!(check.status, CheckStatus::Passed);
        assert_eq!(check.attempts, 1);
        assert_eq!(state.vcs.commits, 1);
    }

    #[tokio::test]
    async fn test_run_checks_blocks_on_broken_category() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, MockAgent::new(), MockVcs::new());
        let mut state = LoopState::new("default");
        state.insert_check(
            CheckRecord::new("u1", "unit")
                .with_command("false")
                .with_status(CheckStatus::Failed),
        );
        state.insert_check(CheckRecord::new("u2", "unit").with_command("true"));
        state.insert_check(
            CheckRecord::new("e1", "e2e")
                .with_command("true")
                .with_depends_on(["unit"]),
        );
        state.insert_check(CheckRecord::new("l1", "lint").with_command("true"));

        orch.handle(Action::RunChecks, &mut state).await.unwrap();
        assert_eq!(state.checks["e1"].status, CheckStatus::Blocked);
        assert_eq!(state.checks["u2"].status, CheckStatus::Passed);
        assert_eq!(state.checks["l1"].status, CheckStatus::Passed);
        assert!(state.checkpoints.is_empty());
    }

    #[tokio::test]
    async fn test_critical_eval_falls_back_to_derived_snapshot() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, MockAgent::new(), MockVcs::new());
        let mut state = LoopState::new("default");
        state.iteration = 12;
        state.insert_item(WorkItem::new("A", "a").with_status(ItemStatus::Done));

        orch.handle(Action::CriticalEval, &mut state).await.unwrap();
        assert_eq!(state.snapshots.len(), 1);
        assert!((state.snapshots[0].score - 1.0).abs() < 1e-9);
        assert_eq!(state.last_critical_eval, Some(12));
    }

    #[tokio::test]
    async fn test_execute_blocks_after_retry_cap() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, MockAgent::new(), MockVcs::new());
        let mut state = LoopState::new("default");
        let mut item = WorkItem::new("A", "Stubborn");
        item.retry_count = state.monitor.strategy.max_item_retries - 1;
        state.insert_item(item);

        orch.handle(Action::Execute, &mut state).await.unwrap();
        let item = &state.work_items["A"];
        assert_eq!(item.status, ItemStatus::Blocked);
        assert!(matches!(item.block_reason, Some(BlockReason::MaxAttempts { .. })));
    }
}

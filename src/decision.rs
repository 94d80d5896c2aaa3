//! Decision engine.
//!
//! [`next_action`] is a pure function from configuration and state to
//! exactly one [`Action`]. Rules are evaluated in strict priority order and
//! the first match wins. When the loop is partitioned into phases, work
//! items are filtered to the active phase first.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::LoopConfig;
use crate::state::{CheckStatus, ItemStatus, LoopState, WorkItem};

/// The fixed action space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    InteractivePause,
    ServiceFix,
    CourseCorrect,
    GenerateChecks,
    Fix,
    Research,
    Execute,
    RunChecks,
    CriticalEval,
    CoherenceEval,
    ExitGate,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InteractivePause => "INTERACTIVE_PAUSE",
            Self::ServiceFix => "SERVICE_FIX",
            Self::CourseCorrect => "COURSE_CORRECT",
            Self::GenerateChecks => "GENERATE_CHECKS",
            Self::Fix => "FIX",
            Self::Research => "RESEARCH",
            Self::Execute => "EXECUTE",
            Self::RunChecks => "RUN_CHECKS",
            Self::CriticalEval => "CRITICAL_EVAL",
            Self::CoherenceEval => "COHERENCE_EVAL",
            Self::ExitGate => "EXIT_GATE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an item is waiting to be worked on.
pub fn is_open(item: &WorkItem) -> bool {
    matches!(item.status, ItemStatus::Pending | ItemStatus::InProgress)
}

/// Whether the stall counter has run past course correction.
pub fn stall_exhausted(config: &LoopConfig, state: &LoopState) -> bool {
    state.no_progress_count > config.limits.stall_threshold
        && state.course_corrections > config.limits.max_course_corrections
}

/// Choose the next action.
pub fn next_action(config: &LoopConfig, state: &LoopState) -> Action {
    let limits = &config.limits;
    let knobs = &state.monitor.strategy;

    // 1. Outstanding pause.
    if state.pause.is_some() {
        return Action::InteractivePause;
    }

    // 2. Unhealthy declared dependency.
    if state.services.values().any(|s| !s.healthy) {
        return Action::ServiceFix;
    }

    // 3. Stall.
    if state.no_progress_count > limits.stall_threshold {
        if state.course_corrections > limits.max_course_corrections {
            return Action::InteractivePause;
        }
        return Action::CourseCorrect;
    }

    let items: Vec<&WorkItem> = state.items_in_scope().collect();
    let done = items
        .iter()
        .filter(|i| i.status == ItemStatus::Done)
        .count();

    // 4. Enough work to verify.
    if done >= limits.min_done_for_checks && !state.checks_generated {
        return Action::GenerateChecks;
    }

    // 5. Failing checks.
    let mut failed = state.failed_checks().peekable();
    if failed.peek().is_some() {
        if failed.any(|c| c.attempts < knobs.max_fix_attempts) {
            return Action::Fix;
        }
        let fingerprint = state.failure_fingerprint();
        if state.research_attempted_for.as_deref() != Some(fingerprint.as_str()) {
            return Action::Research;
        }
        return Action::CourseCorrect;
    }

    // 6. Waiting on a human.
    if items.iter().any(|i| i.is_blocked_on_human()) {
        return Action::InteractivePause;
    }

    // 7. Ready work.
    let open: Vec<&&WorkItem> = items.iter().filter(|i| is_open(i)).collect();
    if open.iter().any(|i| state.dependencies_satisfied(i)) {
        return Action::Execute;
    }
    if !open.is_empty() {
        return Action::CourseCorrect;
    }

    // 8. Unrun checks.
    if state.checks.values().any(|c| c.status == CheckStatus::Pending) {
        return Action::RunChecks;
    }

    // 9. Critical evaluation.
    if critical_eval_due(config, state) {
        return Action::CriticalEval;
    }

    // 10. Coherence review.
    if state.coherence_pending {
        return Action::CoherenceEval;
    }

    // 11. Nothing left to do in scope.
    if !items.is_empty() {
        if !state.checks.is_empty() {
            if all_checks_pass(state) {
                return Action::ExitGate;
            }
        } else if !state.checks_generated {
            return Action::GenerateChecks;
        } else if completion_fraction(&items) >= limits.min_completion_fraction {
            return Action::ExitGate;
        }
    }

    // 12. Default.
    Action::CourseCorrect
}

fn all_checks_pass(state: &LoopState) -> bool {
    state
        .checks
        .values()
        .all(|c| c.status == CheckStatus::Passed)
}

fn completion_fraction(items: &[&WorkItem]) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    let finished = items.iter().filter(|i| i.status.is_terminal()).count();
    finished as f64 / items.len() as f64
}

/// Periodic interval elapsed, or every check passes without a near-maximal
/// snapshot and something has moved since the last evaluation.
fn critical_eval_due(config: &LoopConfig, state: &LoopState) -> bool {
    let limits = &config.limits;
    let since = state
        .iteration
        .saturating_sub(state.last_critical_eval.unwrap_or(0));
    if limits.critical_eval_interval > 0 && state.iteration > 0 && since >= limits.critical_eval_interval {
        return true;
    }

    if state.checks.is_empty() || !all_checks_pass(state) {
        return false;
    }
    let near_max = state
        .snapshots
        .iter()
        .any(|s| s.score >= limits.near_max_value);
    let progressed_since_eval = match state.last_critical_eval {
        None => true,
        Some(at) => state.last_progress_iteration > at,
    };
    !near_max && progressed_since_eval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        BlockReason, CheckRecord, FailureRecord, PauseState, Recommendation, ServiceHealth,
        ValueSnapshot,
    };
    use chrono::Utc;

    fn config() -> LoopConfig {
        LoopConfig::default()
    }

    fn pause() -> PauseState {
        PauseState {
            reason: "need credentials".into(),
            instructions: "add the token".into(),
            verify_command: None,
            requested_at: Utc::now(),
        }
    }

    fn snapshot(score: f64) -> ValueSnapshot {
        ValueSnapshot {
            iteration: 1,
            timestamp: Utc::now(),
            total: 1,
            verified: 1,
            blocked: 0,
            score,
            gaps: Vec::new(),
            recommendation: Recommendation::Continue,
        }
    }

    fn failed_check(id: &str, attempts: u32) -> CheckRecord {
        let mut check = CheckRecord::new(id, "unit")
            .with_command("false")
            .with_status(CheckStatus::Failed);
        check.attempts = attempts;
        check.failures.push(FailureRecord {
            timestamp: Utc::now(),
            exit_code: Some(1),
            output: "boom".into(),
            fix: None,
            regression_of: None,
        });
        check
    }

    fn with_items(n_done: usize, n_pending: usize) -> LoopState {
        let mut state = LoopState::new("unit");
        for i in 0..n_done {
            state.insert_item(WorkItem::new(format!("D{i}"), "done").with_status(ItemStatus::Done));
        }
        for i in 0..n_pending {
            state.insert_item(WorkItem::new(format!("P{i}"), "todo"));
        }
        state
    }

    /// A state where every rule wants to fire.
    fn chaotic() -> LoopState {
        let mut state = with_items(5, 2);
        state.services.insert(
            "db".into(),
            ServiceHealth {
                name: "db".into(),
                healthy: false,
                detail: String::new(),
                checked_at: Utc::now(),
            },
        );
        state.no_progress_count = 50;
        state.course_corrections = 50;
        state.insert_check(failed_check("c1", 0));
        state.coherence_pending = true;
        state.iteration = 100;
        state
    }

    #[test]
    fn test_pause_always_wins() {
        let states = vec![
            LoopState::new("unit"),
            with_items(5, 0),
            with_items(0, 3),
            chaotic(),
        ];
        for mut state in states {
            state.pause = Some(pause());
            assert_eq!(next_action(&config(), &state), Action::InteractivePause);
        }
    }

    #[test]
    fn test_unhealthy_service_before_everything_else() {
        assert_eq!(next_action(&config(), &chaotic()), Action::ServiceFix);
    }

    #[test]
    fn test_stall_routes_to_course_correct_then_pause() {
        let mut state = with_items(0, 2);
        state.no_progress_count = config().limits.stall_threshold + 1;
        assert_eq!(next_action(&config(), &state), Action::CourseCorrect);

        state.course_corrections = config().limits.max_course_corrections + 1;
        assert_eq!(next_action(&config(), &state), Action::InteractivePause);
        assert!(stall_exhausted(&config(), &state));
    }

    #[test]
    fn test_generate_checks_after_enough_done() {
        let state = with_items(3, 1);
        assert_eq!(next_action(&config(), &state), Action::GenerateChecks);

        let state = with_items(2, 1);
        assert_eq!(next_action(&config(), &state), Action::Execute);
    }

    #[test]
    fn test_fix_research_course_correct_ladder() {
        let mut state = with_items(3, 0);
        state.checks_generated = true;
        state.insert_check(failed_check("c1", 0));
        assert_eq!(next_action(&config(), &state), Action::Fix);

        state.checks.get_mut("c1").unwrap().attempts = 3;
        assert_eq!(next_action(&config(), &state), Action::Research);

        state.research_attempted_for = Some(state.failure_fingerprint());
        assert_eq!(next_action(&config(), &state), Action::CourseCorrect);

        // New failure set reopens research.
        state.insert_check(failed_check("c2", 3));
        assert_eq!(next_action(&config(), &state), Action::Research);
    }

    #[test]
    fn test_strategy_knob_raises_fix_cap() {
        let mut state = with_items(3, 0);
        state.checks_generated = true;
        state.insert_check(failed_check("c1", 3));
        state.monitor.strategy.max_fix_attempts = 5;
        assert_eq!(next_action(&config(), &state), Action::Fix);
    }

    #[test]
    fn test_human_block_pauses() {
        let mut state = with_items(0, 0);
        let mut item = WorkItem::new("H", "set up billing account").with_status(ItemStatus::Blocked);
        item.block_reason = Some(BlockReason::HumanAction {
            instructions: "create account".into(),
            verify_command: None,
        });
        state.insert_item(item);
        state.insert_item(WorkItem::new("P", "todo"));
        assert_eq!(next_action(&config(), &state), Action::InteractivePause);
    }

    #[test]
    fn test_pending_without_ready_is_course_correct() {
        let mut state = LoopState::new("unit");
        state.insert_item(
            WorkItem::new("A", "needs B").with_dependencies(["B"]),
        );
        state.insert_item(
            WorkItem::new("B", "blocked").with_status(ItemStatus::Blocked),
        );
        assert_eq!(next_action(&config(), &state), Action::CourseCorrect);
    }

    #[test]
    fn test_descoped_dependency_is_satisfied() {
        let mut state = LoopState::new("unit");
        state.insert_item(WorkItem::new("A", "x").with_status(ItemStatus::Descoped));
        state.insert_item(WorkItem::new("B", "y").with_dependencies(["A"]));
        assert_eq!(next_action(&config(), &state), Action::Execute);
    }

    #[test]
    fn test_run_checks_then_critical_eval_then_exit() {
        let mut state = with_items(3, 0);
        state.checks_generated = true;
        state.insert_check(CheckRecord::new("c1", "unit").with_command("true"));
        assert_eq!(next_action(&config(), &state), Action::RunChecks);

        state.checks.get_mut("c1").unwrap().status = CheckStatus::Passed;
        state.iteration = 4;
        state.last_progress_iteration = 4;
        assert_eq!(next_action(&config(), &state), Action::CriticalEval);

        state.last_critical_eval = Some(4);
        state.snapshots.push(snapshot(0.6));
        assert_eq!(next_action(&config(), &state), Action::ExitGate);

        state.last_progress_iteration = 5;
        assert_eq!(next_action(&config(), &state), Action::CriticalEval);

        state.snapshots.push(snapshot(0.97));
        assert_eq!(next_action(&config(), &state), Action::ExitGate);
    }

    #[test]
    fn test_periodic_critical_eval() {
        let mut state = with_items(0, 1);
        state.iteration = 10;
        // Ready work outranks the interval.
        assert_eq!(next_action(&config(), &state), Action::Execute);

        let mut state = with_items(2, 0);
        state.checks_generated = true;
        state.iteration = 10;
        assert_eq!(next_action(&config(), &state), Action::CriticalEval);
        state.last_critical_eval = Some(10);
        state.iteration = 15;
        assert_ne!(next_action(&config(), &state), Action::CriticalEval);
    }

    #[test]
    fn test_coherence_eval() {
        let mut state = with_items(2, 0);
        state.checks_generated = true;
        state.iteration = 1;
        state.coherence_pending = true;
        assert_eq!(next_action(&config(), &state), Action::CoherenceEval);
    }

    #[test]
    fn test_no_checks_exit_needs_completion_fraction() {
        let mut state = with_items(2, 0);
        state.insert_item(WorkItem::new("X", "stuck").with_status(ItemStatus::Blocked));
        assert_eq!(next_action(&config(), &state), Action::GenerateChecks);

        state.checks_generated = true;
        // 2 of 3 finished is below 0.8.
        assert_eq!(next_action(&config(), &state), Action::CourseCorrect);

        state.work_items.get_mut("X").unwrap().status = ItemStatus::Descoped;
        assert_eq!(next_action(&config(), &state), Action::ExitGate);
    }

    #[test]
    fn test_empty_state_course_corrects() {
        assert_eq!(
            next_action(&config(), &LoopState::new("unit")),
            Action::CourseCorrect
        );
    }

    #[test]
    fn test_phase_filter_applies() {
        let mut state = LoopState::new("unit");
        state.insert_item(WorkItem::new("A", "mvp work").with_phase("mvp").with_status(ItemStatus::Done));
        state.insert_item(WorkItem::new("B", "later work").with_phase("polish"));
        state.checks_generated = true;
        state.active_phase = Some("mvp".into());
        assert_eq!(next_action(&config(), &state), Action::ExitGate);

        state.active_phase = Some("polish".into());
        assert_eq!(next_action(&config(), &state), Action::Execute);
    }

    #[test]
    fn test_action_display() {
        assert_eq!(Action::InteractivePause.to_string(), "INTERACTIVE_PAUSE");
        assert_eq!(
            serde_json::to_string(&Action::ExitGate).unwrap(),
            "\"EXIT_GATE\""
        );
    }
}

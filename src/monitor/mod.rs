//! Process monitor.
//!
//! Runs after every iteration:
//!
//! - **Layer 0** ([`update_metrics`]): value velocity and token efficiency
//!   EMAs, an efficiency CUSUM, per-item churn, error signatures and file
//!   touch counts.
//! - **Layer 1** ([`evaluate_triggers`]): independent trigger conditions
//!   reduced to the worst [`Tier`].
//! - **Layer 2** ([`strategy`]): strategy reasoning, only on `RED`.
//!
//! Churn, signatures and file touches are rebuilt from state on every pass
//! rather than incremented, so they stay correct across rollbacks. Churn
//! ignores finished items and signatures ignore checks that pass again.

pub mod signature;
pub mod strategy;

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::config::{LoopConfig, MonitorConfig};
use crate::runner::TIMEOUT_SENTINEL;
use crate::state::{CheckStatus, LoopState, Tier};

pub use strategy::{dashboard, StrategyReasoner};

/// Layer 0: fold the latest snapshot and token usage into the metrics.
pub fn update_metrics(config: &MonitorConfig, state: &mut LoopState) {
    fold_snapshot(config, state);

    let monitor = &mut state.monitor;
    monitor.churn = state
        .work_items
        .values()
        .filter(|i| i.retry_count >= 2 && !i.status.is_terminal())
        .map(|i| (i.id.clone(), i.retry_count))
        .collect();

    // Only checks still failing count; a fix retires its history.
    let mut signatures: BTreeMap<String, u32> = BTreeMap::new();
    for check in state.checks.values().filter(|c| c.status == CheckStatus::Failed) {
        for failure in &check.failures {
            let sig = if failure.output == TIMEOUT_SENTINEL {
                signature::signature(&format!("{TIMEOUT_SENTINEL} {}", check.id))
            } else {
                signature::signature(&failure.output)
            };
            *signatures.entry(sig).or_default() += 1;
        }
    }
    monitor.error_signatures = signatures;

    let mut touches: BTreeMap<String, u32> = BTreeMap::new();
    for item in state
        .work_items
        .values()
        .filter(|i| i.status == crate::state::ItemStatus::Done)
    {
        for file in &item.files_touched {
            *touches.entry(file.clone()).or_default() += 1;
        }
    }
    monitor.file_touches = touches;
}

fn fold_snapshot(config: &MonitorConfig, state: &mut LoopState) {
    let Some(latest) = state.snapshots.last() else {
        return;
    };
    if state.monitor.last_snapshot_iteration == Some(latest.iteration) {
        return;
    }

    let previous = state
        .snapshots
        .len()
        .checked_sub(2)
        .map_or(0.0, |i| state.snapshots[i].score);
    let delta = latest.score - previous;
    let alpha = config.alpha;
    let monitor = &mut state.monitor;

    monitor.velocity_ema = alpha * delta + (1.0 - alpha) * monitor.velocity_ema;

    let tokens = state
        .budget
        .tokens_used
        .saturating_sub(monitor.last_tokens_used);
    if tokens > 0 {
        let efficiency = delta / (tokens as f64 / 1000.0);
        if !monitor.efficiency_window.is_empty() {
            let baseline = monitor.efficiency_window.iter().sum::<f64>()
                / monitor.efficiency_window.len() as f64;
            if baseline.abs() > f64::EPSILON {
                let shortfall = (baseline - efficiency) / baseline.abs();
                monitor.cusum = (monitor.cusum + shortfall - config.cusum_slack).max(0.0);
            }
        }
        monitor.efficiency_window.push_back(efficiency);
        while monitor.efficiency_window.len() > config.baseline_window.max(1) {
            monitor.efficiency_window.pop_front();
        }
        monitor.efficiency_ema = alpha * efficiency + (1.0 - alpha) * monitor.efficiency_ema;
    }

    monitor.last_tokens_used = state.budget.tokens_used;
    monitor.last_snapshot_iteration = Some(latest.iteration);
    debug!(
        "Metrics: velocity_ema={:.4} efficiency_ema={:.4} cusum={:.3}",
        monitor.velocity_ema, monitor.efficiency_ema, monitor.cusum
    );
}

/// Layer 1: evaluate trigger conditions and record the resulting tier.
pub fn evaluate_triggers(config: &MonitorConfig, state: &mut LoopState) -> Tier {
    let previous = state.monitor.status;
    let (tier, triggers) = if in_quiet_period(config, state) {
        (Tier::Green, Vec::new())
    } else {
        collect_triggers(config, state)
    };

    if tier != previous {
        match tier {
            Tier::Red => warn!("Monitor tier {} -> {}: {}", previous, tier, triggers.join("; ")),
            Tier::Yellow => info!("Monitor tier {} -> {}: {}", previous, tier, triggers.join("; ")),
            Tier::Green => info!("Monitor tier {} -> {}", previous, tier),
        }
    }
    state.monitor.status = tier;
    state.monitor.triggers = triggers;
    tier
}

fn in_quiet_period(config: &MonitorConfig, state: &LoopState) -> bool {
    if state.iteration < config.warmup_iterations {
        return true;
    }
    state
        .monitor
        .last_strategy_change
        .is_some_and(|at| state.iteration.saturating_sub(at) < config.cooldown_iterations)
}

fn collect_triggers(config: &MonitorConfig, state: &LoopState) -> (Tier, Vec<String>) {
    let monitor = &state.monitor;
    let mut fired: Vec<(Tier, String)> = Vec::new();

    if state.snapshots.len() >= 2 && monitor.velocity_ema.abs() < config.plateau_epsilon {
        fired.push((
            Tier::Yellow,
            format!("value plateau (velocity {:.4})", monitor.velocity_ema),
        ));
    }

    for (id, count) in &monitor.churn {
        if *count >= config.churn_critical {
            fired.push((Tier::Red, format!("item {id} churned {count} times")));
        } else if *count >= config.churn_warn {
            fired.push((Tier::Yellow, format!("item {id} retried {count} times")));
        }
    }

    for (sig, count) in &monitor.error_signatures {
        if *count >= config.error_recurrence {
            fired.push((Tier::Red, format!("error {sig} recurred {count} times")));
        }
    }

    if let Some(used) = state.budget.fraction_used() {
        let score = state.latest_snapshot().map_or(0.0, |s| s.score);
        let ratio = used / score.max(0.05);
        if used > 0.0 && ratio >= config.budget_ratio {
            fired.push((
                Tier::Yellow,
                format!(
                    "budget {:.0}% used for value {:.2} (ratio {:.2})",
                    used * 100.0,
                    score,
                    ratio
                ),
            ));
        }
    }

    let total: u32 = monitor.file_touches.values().sum();
    if total >= config.min_file_touches {
        if let Some((file, count)) = monitor.file_touches.iter().max_by_key(|(_, c)| **c) {
            let share = f64::from(*count) / f64::from(total);
            if share >= config.file_concentration {
                fired.push((
                    Tier::Yellow,
                    format!("{file} absorbs {:.0}% of touches", share * 100.0),
                ));
            }
        }
    }

    if monitor.cusum >= config.cusum_threshold {
        fired.push((
            Tier::Yellow,
            format!("efficiency drifting below baseline (cusum {:.2})", monitor.cusum),
        ));
    }

    let tier = fired.iter().map(|(t, _)| *t).max().unwrap_or(Tier::Green);
    (tier, fired.into_iter().map(|(_, r)| r).collect())
}

/// Layers 0 and 1 in order.
pub fn run_pass(config: &LoopConfig, state: &mut LoopState) -> Tier {
    update_metrics(&config.monitor, state);
    evaluate_triggers(&config.monitor, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        CheckRecord, FailureRecord, ItemStatus, Recommendation, ValueSnapshot, WorkItem,
    };
    use chrono::Utc;

    fn snapshot(iteration: u32, score: f64) -> ValueSnapshot {
        ValueSnapshot {
            iteration,
            timestamp: Utc::now(),
            total: 10,
            verified: 0,
            blocked: 0,
            score,
            gaps: Vec::new(),
            recommendation: Recommendation::Continue,
        }
    }

    fn warmed() -> LoopState {
        let mut state = LoopState::new("unit");
        state.iteration = 10;
        state
    }

    #[test]
    fn test_churn_at_critical_flips_red() {
        let config = LoopConfig::default();
        let mut state = warmed();
        let mut item = WorkItem::new("A", "flaky work");
        item.retry_count = config.monitor.churn_critical;
        state.insert_item(item);

        assert_eq!(run_pass(&config, &mut state), Tier::Red);
        assert_eq!(state.monitor.status, Tier::Red);
        assert!(state.monitor.triggers[0].contains("churned"));
    }

    #[test]
    fn test_churn_warn_is_yellow() {
        let config = LoopConfig::default();
        let mut state = warmed();
        let mut item = WorkItem::new("A", "flaky work");
        item.retry_count = 2;
        state.insert_item(item);
        assert_eq!(run_pass(&config, &mut state), Tier::Yellow);
    }

    #[test]
    fn test_warmup_and_cooldown_suppress() {
        let config = LoopConfig::default();
        let mut state = LoopState::new("unit");
        let mut item = WorkItem::new("A", "flaky work");
        item.retry_count = 9;
        state.insert_item(item);

        state.iteration = 1;
        assert_eq!(run_pass(&config, &mut state), Tier::Green);
        // Metrics still update during warm-up.
        assert_eq!(state.monitor.churn.get("A"), Some(&9));

        state.iteration = 20;
        state.monitor.last_strategy_change = Some(18);
        assert_eq!(run_pass(&config, &mut state), Tier::Green);

        state.iteration = 23;
        assert_eq!(run_pass(&config, &mut state), Tier::Red);
    }

    #[test]
    fn test_recurring_error_signature_is_red() {
        let config = LoopConfig::default();
        let mut state = warmed();
        let mut check = CheckRecord::new("c1", "unit").with_status(CheckStatus::Failed);
        for line in [10, 20, 30] {
            check.failures.push(FailureRecord {
                timestamp: Utc::now(),
                exit_code: Some(1),
                output: format!("panic at /work/src/lib.rs:{line}:5 index out of bounds"),
                fix: None,
                regression_of: None,
            });
        }
        state.insert_check(check);

        assert_eq!(run_pass(&config, &mut state), Tier::Red);
        assert_eq!(state.monitor.error_signatures.len(), 1);
    }

    fn failure(output: &str) -> FailureRecord {
        FailureRecord {
            timestamp: Utc::now(),
            exit_code: Some(1),
            output: output.to_string(),
            fix: None,
            regression_of: None,
        }
    }

    #[test]
    fn test_fixed_check_no_longer_counts_its_failures() {
        let config = LoopConfig::default();
        let mut state = warmed();
        let mut check = CheckRecord::new("c1", "unit").with_status(CheckStatus::Passed);
        for _ in 0..3 {
            check
                .failures
                .push(failure("panic at /work/src/lib.rs:10:5 index out of bounds"));
        }
        state.insert_check(check);

        assert_eq!(run_pass(&config, &mut state), Tier::Green);
        assert!(state.monitor.error_signatures.is_empty());

        // Failing again brings the history back into play.
        state.checks.get_mut("c1").unwrap().status = CheckStatus::Failed;
        assert_eq!(run_pass(&config, &mut state), Tier::Red);
    }

    #[test]
    fn test_timeouts_of_different_checks_are_distinct() {
        let config = LoopConfig::default();
        let mut state = warmed();
        for id in ["c1", "c2", "c3"] {
            let mut check = CheckRecord::new(id, "unit").with_status(CheckStatus::Failed);
            check.failures.push(failure(TIMEOUT_SENTINEL));
            state.insert_check(check);
        }

        assert_eq!(run_pass(&config, &mut state), Tier::Green);
        assert_eq!(state.monitor.error_signatures.len(), 3);

        let c1 = state.checks.get_mut("c1").unwrap();
        c1.failures.push(failure(TIMEOUT_SENTINEL));
        c1.failures.push(failure(TIMEOUT_SENTINEL));
        assert_eq!(run_pass(&config, &mut state), Tier::Red);
    }

    #[test]
    fn test_finished_item_churn_is_dropped() {
        let config = LoopConfig::default();
        let mut state = warmed();
        let mut item = WorkItem::new("A", "flaky work").with_status(ItemStatus::Done);
        item.retry_count = config.monitor.churn_critical;
        state.insert_item(item);

        assert_eq!(run_pass(&config, &mut state), Tier::Green);
        assert!(state.monitor.churn.is_empty());
    }

    #[test]
    fn test_file_touches_rebuilt_not_incremented() {
        let config = LoopConfig::default();
        let mut state = warmed();
        let mut item = WorkItem::new("A", "x").with_status(ItemStatus::Done);
        item.files_touched.insert("src/lib.rs".into());
        state.insert_item(item);

        run_pass(&config, &mut state);
        run_pass(&config, &mut state);
        assert_eq!(state.monitor.file_touches.get("src/lib.rs"), Some(&1));

        state.work_items.get_mut("A").unwrap().revert_to_pending();
        run_pass(&config, &mut state);
        assert!(state.monitor.file_touches.is_empty());
    }

    #[test]
    fn test_file_concentration_yellow() {
        let config = LoopConfig::default();
        let mut state = warmed();
        for i in 0..6 {
            let mut item = WorkItem::new(format!("I{i}"), "x").with_status(ItemStatus::Done);
            item.files_touched.insert("src/hot.rs".into());
            state.insert_item(item);
        }
        assert_eq!(run_pass(&config, &mut state), Tier::Yellow);
        assert!(state.monitor.triggers.iter().any(|t| t.contains("hot.rs")));
    }

    #[test]
    fn test_velocity_ema_and_plateau() {
        let config = LoopConfig::default();
        let mut state = warmed();
        state.snapshots.push(snapshot(1, 0.5));
        update_metrics(&config.monitor, &mut state);
        assert!((state.monitor.velocity_ema - 0.15).abs() < 1e-9);

        // Same snapshot is folded once.
        update_metrics(&config.monitor, &mut state);
        assert!((state.monitor.velocity_ema - 0.15).abs() < 1e-9);

        let mut plateau = warmed();
        plateau.snapshots.push(snapshot(1, 0.5));
        plateau.snapshots.push(snapshot(2, 0.5));
        plateau.monitor.last_snapshot_iteration = Some(1);
        assert_eq!(run_pass(&config, &mut plateau), Tier::Yellow);
        assert!(plateau.monitor.triggers[0].contains("plateau"));
    }

    #[test]
    fn test_cusum_grows_when_efficiency_lags() {
        let config = LoopConfig::default();
        let mut state = warmed();
        let mut score = 0.0;
        // Healthy baseline: 0.1 value per 1000 tokens.
        for i in 1..=3 {
            score += 0.1;
            state.budget.tokens_used += 1000;
            state.snapshots.push(snapshot(i, score));
            update_metrics(&config.monitor, &mut state);
        }
        assert!(state.monitor.cusum.abs() < 1e-9);

        // Efficiency collapses.
        for i in 4..=6 {
            score += 0.001;
            state.budget.tokens_used += 1000;
            state.snapshots.push(snapshot(i, score));
            update_metrics(&config.monitor, &mut state);
        }
        assert!(state.monitor.cusum >= config.monitor.cusum_threshold);
        assert!(state.monitor.cusum >= 0.0);
    }

    #[test]
    fn test_budget_outpacing_value() {
        let config = LoopConfig::default();
        let mut state = warmed();
        state.budget.token_budget = Some(1000);
        state.budget.tokens_used = 600;
        state.snapshots.push(snapshot(1, 0.2));
        state.monitor.last_snapshot_iteration = Some(1);
        assert_eq!(run_pass(&config, &mut state), Tier::Yellow);
        assert!(state.monitor.triggers.iter().any(|t| t.contains("budget")));
    }

    #[test]
    fn test_healthy_state_is_green() {
        let config = LoopConfig::default();
        let mut state = warmed();
        state.insert_item(WorkItem::new("A", "x"));
        assert_eq!(run_pass(&config, &mut state), Tier::Green);
        assert!(state.monitor.triggers.is_empty());
    }
}

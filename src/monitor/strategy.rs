//! Layer 2: strategy reasoning.
//!
//! Only invoked on a `RED` tier. The strategist sees the metrics dashboard
//! and the recent iteration history and may report a strategy change, ask
//! for a rollback, or escalate to a human. Its calls go through the
//! dispatcher like any other agent's.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::agent::{invoke_with_timeout, AgentCapability, AgentRole};
use crate::dispatch::{Caller, DispatchOutcome, ToolDispatcher};
use crate::error::Result;
use crate::state::LoopState;

/// Metrics dashboard shown to the strategist and printed by `status`.
pub fn dashboard(state: &LoopState) -> Value {
    let monitor = &state.monitor;
    let hottest_file = monitor
        .file_touches
        .iter()
        .max_by_key(|(_, c)| **c)
        .map(|(f, c)| json!({ "file": f, "touches": c }));

    json!({
        "iteration": state.iteration,
        "tier": monitor.status,
        "triggers": monitor.triggers,
        "velocity_ema": monitor.velocity_ema,
        "efficiency_ema": monitor.efficiency_ema,
        "cusum": monitor.cusum,
        "churn": monitor.churn,
        "recurring_errors": monitor
            .error_signatures
            .iter()
            .filter(|(_, n)| **n > 1)
            .collect::<std::collections::BTreeMap<_, _>>(),
        "hottest_file": hottest_file,
        "value_score": state.latest_snapshot().map(|s| s.score),
        "budget": {
            "tokens_used": state.budget.tokens_used,
            "token_budget": state.budget.token_budget,
            "fraction_used": state.budget.fraction_used(),
        },
        "no_progress_count": state.no_progress_count,
        "course_corrections": state.course_corrections,
        "strategy": monitor.strategy,
        "checkpoints": state.checkpoints.iter().map(|c| c.label.as_str()).collect::<Vec<_>>(),
    })
}

/// Runs the strategist against the current state.
pub struct StrategyReasoner<'a> {
    agent: &'a dyn AgentCapability,
    dispatcher: &'a ToolDispatcher,
}

impl<'a> StrategyReasoner<'a> {
    pub fn new(agent: &'a dyn AgentCapability, dispatcher: &'a ToolDispatcher) -> Self {
        Self { agent, dispatcher }
    }

    /// Prompt with the dashboard and the last few history records.
    pub fn prompt(&self, state: &LoopState) -> String {
        let depth = self.dispatcher.config().monitor.strategy_history;
        let skip = state.history.len().saturating_sub(depth);
        let history: Vec<String> = state
            .history
            .iter()
            .skip(skip)
            .map(|h| {
                format!(
                    "- #{} {} progressed={} tokens={}{}",
                    h.iteration,
                    h.action,
                    h.progressed,
                    h.tokens,
                    h.note.as_deref().map(|n| format!(" ({n})")).unwrap_or_default()
                )
            })
            .collect();
        let dashboard =
            serde_json::to_string_pretty(&dashboard(state)).unwrap_or_else(|_| "{}".to_string());

        format!(
            "The delivery loop is in the RED tier.\n\n\
             ## Metrics\n```json\n{dashboard}\n```\n\n\
             ## Recent iterations\n{}\n\n\
             Decide whether to change strategy. Strategy knobs: max_fix_attempts, \
             max_item_retries, execution_order (dependency_first | fifo | smallest_first), \
             triage_granularity (single | category | all). Report a change with \
             report_strategy_change including a rationale and reevaluate_after, request a \
             rollback to a checkpoint, or escalate to a human.",
            if history.is_empty() {
                "(none)".to_string()
            } else {
                history.join("\n")
            }
        )
    }

    /// Invoke the strategist and apply its calls.
    ///
    /// Returns the outcome of every call plus the tokens the agent used.
    ///
    /// # Errors
    ///
    /// Propagates agent failures and timeouts.
    pub async fn reason(&self, state: &mut LoopState) -> Result<(Vec<DispatchOutcome>, u64)> {
        let role = AgentRole::Strategist;
        let profile = self.dispatcher.config().agent.profile(role);
        let prompt = self.prompt(state);
        let response = invoke_with_timeout(self.agent, role, profile.timeout_secs, &prompt).await?;

        let outcomes: Vec<DispatchOutcome> = response
            .tool_calls
            .iter()
            .map(|call| self.dispatcher.dispatch_call(state, Caller::Agent(role), call))
            .collect();

        if outcomes.iter().any(DispatchOutcome::is_applied) {
            info!("Strategist applied {} call(s)", outcomes.iter().filter(|o| o.is_applied()).count());
        } else {
            warn!("Strategist made no applicable change");
        }
        Ok((outcomes, response.tokens_used))
    }
}

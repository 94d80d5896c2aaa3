//! Typed operations accepted by the tool dispatcher.
//!
//! Each operation is a unit struct implementing [`ToolOperation`] with its
//! own request type. Payloads are decoded strictly (`deny_unknown_fields`),
//! so structural problems are rejected before any business rule runs.

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::Deserialize;

use super::validation::{self, NewItem};
use super::{OpContext, StateScope, ToolOperation};
use crate::state::{
    BlockReason, CheckRecord, CheckStatus, FailureRecord, Gap, ItemStatus, LoopState, Origin,
    PauseState, Recommendation, ResearchFinding, RollbackRequest, ServiceHealth, StrategyChange,
    StrategyPatch, ValueSnapshot, WorkItem,
};

/// Operation names as they appear in tool calls.
pub mod names {
    pub const ADD_WORK_ITEM: &str = "add_work_item";
    pub const MODIFY_WORK_ITEM: &str = "modify_work_item";
    pub const REMOVE_WORK_ITEM: &str = "remove_work_item";
    pub const ADD_CHECK: &str = "add_check";
    pub const RECORD_CHECK_RESULT: &str = "record_check_result";
    pub const RECORD_FIX: &str = "record_fix";
    pub const REPORT_VALUE_SNAPSHOT: &str = "report_value_snapshot";
    pub const REPORT_RESEARCH_FINDING: &str = "report_research_finding";
    pub const REPORT_STRATEGY_CHANGE: &str = "report_strategy_change";
    pub const ESCALATE: &str = "escalate";
    pub const REPORT_SERVICE_HEALTH: &str = "report_service_health";
    pub const FLAG_COHERENCE: &str = "flag_coherence";
    pub const REQUEST_ROLLBACK: &str = "request_rollback";
}

/// Failure output kept per record.
const MAX_FAILURE_OUTPUT: usize = 4000;

fn require(field: &str, text: &str) -> Result<(), String> {
    if text.trim().is_empty() {
        Err(format!("Rejected: '{field}' must not be empty"))
    } else {
        Ok(())
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

// ============================================================================
// Work items
// ============================================================================

pub struct AddWorkItem;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddWorkItemRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    pub value: String,
    pub acceptance: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub origin: Option<Origin>,
    #[serde(default)]
    pub phase: Option<String>,
}

impl AddWorkItemRequest {
    fn resolved_id(&self, state: &LoopState) -> String {
        match &self.id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                let mut n = state.next_item_seq + 1;
                while state.work_items.contains_key(&format!("W{n}")) {
                    n += 1;
                }
                format!("W{n}")
            }
        }
    }

    fn resolved_phase(&self, state: &LoopState) -> Option<String> {
        self.phase.clone().or_else(|| state.active_phase.clone())
    }
}

impl ToolOperation for AddWorkItem {
    const NAME: &'static str = names::ADD_WORK_ITEM;
    type Request = AddWorkItemRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::WorkItems]
    }

    fn validate(req: &Self::Request, state: &LoopState, ctx: &OpContext<'_>) -> Result<(), String> {
        let origin = validation::resolve_origin(ctx.caller, req.origin)?;
        if let Some(phase) = req.resolved_phase(state) {
            if !ctx.config.phases.is_empty() && !ctx.config.phases.contains(&phase) {
                return Err(format!("Rejected: unknown phase '{phase}'"));
            }
        }
        let id = req.resolved_id(state);
        validation::validate_add(
            state,
            &ctx.config.dispatch,
            &NewItem {
                id: &id,
                description: &req.description,
                value: &req.value,
                acceptance: &req.acceptance,
                dependencies: &req.dependencies,
                declared_files: req.files.len(),
                origin,
            },
        )
    }

    fn apply(req: Self::Request, state: &mut LoopState, ctx: &OpContext<'_>) -> anyhow::Result<String> {
        let id = req.resolved_id(state);
        let origin = validation::resolve_origin(ctx.caller, req.origin).map_err(|e| anyhow!(e))?;
        let mut item = WorkItem::new(&id, req.description.trim())
            .with_dependencies(req.dependencies.clone())
            .with_origin(origin);
        item.value = req.value.trim().to_string();
        item.acceptance = req.acceptance.trim().to_string();
        item.declared_files = req.files.iter().cloned().collect();
        item.phase = req.resolved_phase(state);
        state.insert_item(item);
        Ok(format!("Added work item '{id}'"))
    }
}

pub struct ModifyWorkItem;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModifyWorkItemRequest {
    pub id: String,
    #[serde(default)]
    pub status: Option<ItemStatus>,
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub acceptance: Option<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub block_reason: Option<BlockReason>,
}

impl ToolOperation for ModifyWorkItem {
    const NAME: &'static str = names::MODIFY_WORK_ITEM;
    type Request = ModifyWorkItemRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::WorkItems]
    }

    fn validate(req: &Self::Request, state: &LoopState, ctx: &OpContext<'_>) -> Result<(), String> {
        let item = state
            .work_items
            .get(&req.id)
            .ok_or_else(|| format!("Rejected: work item '{}' does not exist", req.id))?;

        if let Some(status) = req.status {
            validation::validate_status_change(ctx.caller, item.status, status)?;
            let deps = req.dependencies.as_deref().unwrap_or(&item.dependencies);
            if status == ItemStatus::Done && !state.all_satisfied(deps) {
                return Err(format!(
                    "Rejected: '{}' cannot be done before its dependencies",
                    req.id
                ));
            }
        }
        if let Some(deps) = &req.dependencies {
            validation::validate_dependencies(state, &req.id, deps)?;
        }
        if let Some(description) = &req.description {
            require("description", description)?;
            validation::check_granularity(
                &ctx.config.dispatch,
                description,
                item.declared_files.len(),
            )?;
        }
        Ok(())
    }

    fn apply(req: Self::Request, state: &mut LoopState, ctx: &OpContext<'_>) -> anyhow::Result<String> {
        let item = state
            .work_items
            .get_mut(&req.id)
            .with_context(|| format!("work item '{}' vanished", req.id))?;
        let before = item.status;

        if let Some(mut deps) = req.dependencies {
            let mut seen = std::collections::HashSet::new();
            deps.retain(|d| seen.insert(d.clone()));
            item.dependencies = deps;
        }
        if let Some(description) = req.description {
            item.description = description.trim().to_string();
        }
        if let Some(value) = req.value {
            item.value = value;
        }
        if let Some(acceptance) = req.acceptance {
            item.acceptance = acceptance;
        }
        item.files_touched.extend(req.files_touched);

        if let Some(status) = req.status {
            match status {
                ItemStatus::Done => {
                    item.status = ItemStatus::Done;
                    item.block_reason = None;
                    item.completed_at = Some(Utc::now());
                    item.completed_iteration = Some(ctx.iteration);
                }
                ItemStatus::Pending if before == ItemStatus::Done => item.revert_to_pending(),
                ItemStatus::Pending => {
                    item.status = ItemStatus::Pending;
                    item.block_reason = None;
                }
                ItemStatus::Blocked => {
                    item.status = ItemStatus::Blocked;
                    item.block_reason = Some(req.block_reason.unwrap_or(BlockReason::Other {
                        reason: "blocked without a stated reason".to_string(),
                    }));
                }
                other => item.status = other,
            }
        }

        Ok(format!(
            "Updated work item '{}' ({} -> {})",
            req.id, before, item.status
        ))
    }
}

pub struct RemoveWorkItem;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoveWorkItemRequest {
    pub id: String,
}

impl ToolOperation for RemoveWorkItem {
    const NAME: &'static str = names::REMOVE_WORK_ITEM;
    type Request = RemoveWorkItemRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::WorkItems]
    }

    fn validate(req: &Self::Request, state: &LoopState, _ctx: &OpContext<'_>) -> Result<(), String> {
        validation::validate_remove(state, &req.id)
    }

    fn apply(req: Self::Request, state: &mut LoopState, _ctx: &OpContext<'_>) -> anyhow::Result<String> {
        state
            .work_items
            .remove(&req.id)
            .with_context(|| format!("work item '{}' vanished", req.id))?;
        Ok(format!("Removed work item '{}'", req.id))
    }
}

// ============================================================================
// Checks
// ============================================================================

pub struct AddCheck;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddCheckRequest {
    pub id: String,
    pub category: String,
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ToolOperation for AddCheck {
    const NAME: &'static str = names::ADD_CHECK;
    type Request = AddCheckRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::Checks, StateScope::Bookkeeping]
    }

    fn validate(req: &Self::Request, state: &LoopState, _ctx: &OpContext<'_>) -> Result<(), String> {
        require("id", &req.id)?;
        require("category", &req.category)?;
        require("command", &req.command)?;
        if state.checks.contains_key(&req.id) {
            return Err(format!("Rejected: check '{}' already exists", req.id));
        }
        if req.depends_on.contains(&req.category) {
            return Err(format!(
                "Rejected: check '{}' cannot depend on its own category",
                req.id
            ));
        }
        if req.timeout_secs == Some(0) {
            return Err("Rejected: timeout_secs must be positive".to_string());
        }
        Ok(())
    }

    fn apply(req: Self::Request, state: &mut LoopState, _ctx: &OpContext<'_>) -> anyhow::Result<String> {
        let mut check = CheckRecord::new(&req.id, &req.category)
            .with_command(req.command)
            .with_depends_on(req.depends_on);
        check.description = req.description;
        check.timeout_secs = req.timeout_secs;
        state.insert_check(check);
        state.checks_generated = true;
        Ok(format!("Added check '{}' in '{}'", req.id, req.category))
    }
}

pub struct RecordCheckResult;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordCheckResultRequest {
    pub id: String,
    pub passed: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: String,
}

impl ToolOperation for RecordCheckResult {
    const NAME: &'static str = names::RECORD_CHECK_RESULT;
    type Request = RecordCheckResultRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::Checks]
    }

    fn validate(req: &Self::Request, state: &LoopState, _ctx: &OpContext<'_>) -> Result<(), String> {
        if state.checks.contains_key(&req.id) {
            Ok(())
        } else {
            Err(format!("Rejected: check '{}' does not exist", req.id))
        }
    }

    fn apply(req: Self::Request, state: &mut LoopState, _ctx: &OpContext<'_>) -> anyhow::Result<String> {
        let check = state
            .checks
            .get_mut(&req.id)
            .with_context(|| format!("check '{}' vanished", req.id))?;
        if req.passed {
            check.status = CheckStatus::Passed;
        } else {
            check.status = CheckStatus::Failed;
            check.failures.push(FailureRecord {
                timestamp: Utc::now(),
                exit_code: req.exit_code,
                output: clip(&req.output, MAX_FAILURE_OUTPUT),
                fix: None,
                regression_of: None,
            });
        }
        Ok(format!("Check '{}' is now {}", req.id, check.status))
    }
}

pub struct RecordFix;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordFixRequest {
    pub check_id: String,
    pub description: String,
}

impl ToolOperation for RecordFix {
    const NAME: &'static str = names::RECORD_FIX;
    type Request = RecordFixRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::Checks]
    }

    fn validate(req: &Self::Request, state: &LoopState, _ctx: &OpContext<'_>) -> Result<(), String> {
        require("description", &req.description)?;
        let check = state
            .checks
            .get(&req.check_id)
            .ok_or_else(|| format!("Rejected: check '{}' does not exist", req.check_id))?;
        if check.failures.is_empty() {
            return Err(format!(
                "Rejected: check '{}' has no recorded failure",
                req.check_id
            ));
        }
        Ok(())
    }

    fn apply(req: Self::Request, state: &mut LoopState, _ctx: &OpContext<'_>) -> anyhow::Result<String> {
        let failure = state
            .checks
            .get_mut(&req.check_id)
            .and_then(|c| c.failures.last_mut())
            .with_context(|| format!("failure record for '{}' vanished", req.check_id))?;
        failure.fix = Some(req.description);
        Ok(format!("Recorded fix for '{}'", req.check_id))
    }
}

// ============================================================================
// Reports
// ============================================================================

pub struct ReportValueSnapshot;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportValueSnapshotRequest {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub verified: u32,
    #[serde(default)]
    pub blocked: u32,
    pub score: f64,
    #[serde(default, deserialize_with = "crate::state::persistence::normalize_gaps")]
    pub gaps: Vec<Gap>,
    #[serde(default)]
    pub recommendation: Recommendation,
}

impl ToolOperation for ReportValueSnapshot {
    const NAME: &'static str = names::REPORT_VALUE_SNAPSHOT;
    type Request = ReportValueSnapshotRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::Snapshots]
    }

    fn validate(req: &Self::Request, _state: &LoopState, _ctx: &OpContext<'_>) -> Result<(), String> {
        if !req.score.is_finite() || !(0.0..=1.0).contains(&req.score) {
            return Err(format!("Rejected: score {} is outside [0, 1]", req.score));
        }
        if req.verified > req.total || req.blocked > req.total {
            return Err("Rejected: verified and blocked counts cannot exceed total".to_string());
        }
        Ok(())
    }

    fn apply(req: Self::Request, state: &mut LoopState, ctx: &OpContext<'_>) -> anyhow::Result<String> {
        state.snapshots.push(ValueSnapshot {
            iteration: ctx.iteration,
            timestamp: Utc::now(),
            total: req.total,
            verified: req.verified,
            blocked: req.blocked,
            score: req.score,
            gaps: req.gaps,
            recommendation: req.recommendation,
        });
        Ok(format!("Recorded value snapshot (score {:.2})", req.score))
    }
}

pub struct ReportResearchFinding;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportResearchFindingRequest {
    pub topic: String,
    pub finding: String,
    #[serde(default)]
    pub applies_to: Vec<String>,
}

impl ToolOperation for ReportResearchFinding {
    const NAME: &'static str = names::REPORT_RESEARCH_FINDING;
    type Request = ReportResearchFindingRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::Research]
    }

    fn validate(req: &Self::Request, _state: &LoopState, _ctx: &OpContext<'_>) -> Result<(), String> {
        require("topic", &req.topic)?;
        require("finding", &req.finding)
    }

    fn apply(req: Self::Request, state: &mut LoopState, ctx: &OpContext<'_>) -> anyhow::Result<String> {
        state.research.push(ResearchFinding {
            iteration: ctx.iteration,
            topic: req.topic.clone(),
            finding: req.finding,
            applies_to: req.applies_to,
        });
        Ok(format!("Recorded research finding on '{}'", req.topic))
    }
}

pub struct ReportStrategyChange;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportStrategyChangeRequest {
    pub patch: StrategyPatch,
    pub rationale: String,
    #[serde(default)]
    pub reevaluate_after: Option<u32>,
}

impl ToolOperation for ReportStrategyChange {
    const NAME: &'static str = names::REPORT_STRATEGY_CHANGE;
    type Request = ReportStrategyChangeRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::Monitor]
    }

    fn validate(req: &Self::Request, _state: &LoopState, _ctx: &OpContext<'_>) -> Result<(), String> {
        require("rationale", &req.rationale)?;
        if req.patch.is_empty() {
            return Err("Rejected: strategy change does not change any knob".to_string());
        }
        if req.patch.max_fix_attempts == Some(0) || req.patch.max_item_retries == Some(0) {
            return Err("Rejected: retry caps must be at least 1".to_string());
        }
        Ok(())
    }

    fn apply(req: Self::Request, state: &mut LoopState, ctx: &OpContext<'_>) -> anyhow::Result<String> {
        state.monitor.strategy.apply(&req.patch);
        state.monitor.last_strategy_change = Some(ctx.iteration);
        state.monitor.strategy_history.push(StrategyChange {
            iteration: ctx.iteration,
            patch: req.patch,
            rationale: req.rationale,
            reevaluate_after: req.reevaluate_after,
        });
        Ok(format!(
            "Strategy updated: {}",
            serde_json::to_string(&state.monitor.strategy)?
        ))
    }
}

pub struct Escalate;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalateRequest {
    pub reason: String,
    pub instructions: String,
    #[serde(default)]
    pub verify_command: Option<String>,
    #[serde(default)]
    pub item_id: Option<String>,
}

impl ToolOperation for Escalate {
    const NAME: &'static str = names::ESCALATE;
    type Request = EscalateRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::Pause, StateScope::WorkItems]
    }

    fn validate(req: &Self::Request, state: &LoopState, _ctx: &OpContext<'_>) -> Result<(), String> {
        require("reason", &req.reason)?;
        require("instructions", &req.instructions)?;
        if state.pause.is_some() {
            return Err("Rejected: a human action is already pending".to_string());
        }
        if let Some(id) = &req.item_id {
            if !state.work_items.contains_key(id) {
                return Err(format!("Rejected: work item '{id}' does not exist"));
            }
        }
        Ok(())
    }

    fn apply(req: Self::Request, state: &mut LoopState, _ctx: &OpContext<'_>) -> anyhow::Result<String> {
        if let Some(id) = &req.item_id {
            let item = state
                .work_items
                .get_mut(id)
                .with_context(|| format!("work item '{id}' vanished"))?;
            item.status = ItemStatus::Blocked;
            item.block_reason = Some(BlockReason::HumanAction {
                instructions: req.instructions.clone(),
                verify_command: req.verify_command.clone(),
            });
        }
        state.pause = Some(PauseState {
            reason: req.reason.clone(),
            instructions: req.instructions,
            verify_command: req.verify_command,
            requested_at: Utc::now(),
        });
        Ok(format!("Escalated to a human: {}", req.reason))
    }
}

pub struct ReportServiceHealth;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportServiceHealthRequest {
    pub name: String,
    pub healthy: bool,
    #[serde(default)]
    pub detail: String,
}

impl ToolOperation for ReportServiceHealth {
    const NAME: &'static str = names::REPORT_SERVICE_HEALTH;
    type Request = ReportServiceHealthRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::Services]
    }

    fn validate(req: &Self::Request, _state: &LoopState, ctx: &OpContext<'_>) -> Result<(), String> {
        if ctx.config.services.iter().any(|s| s.name == req.name) {
            Ok(())
        } else {
            Err(format!("Rejected: '{}' is not a declared service", req.name))
        }
    }

    fn apply(req: Self::Request, state: &mut LoopState, _ctx: &OpContext<'_>) -> anyhow::Result<String> {
        let healthy = req.healthy;
        state.services.insert(
            req.name.clone(),
            ServiceHealth {
                name: req.name.clone(),
                healthy,
                detail: req.detail,
                checked_at: Utc::now(),
            },
        );
        Ok(format!(
            "Service '{}' is {}",
            req.name,
            if healthy { "healthy" } else { "unhealthy" }
        ))
    }
}

pub struct FlagCoherence;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlagCoherenceRequest {
    pub reason: String,
}

impl ToolOperation for FlagCoherence {
    const NAME: &'static str = names::FLAG_COHERENCE;
    type Request = FlagCoherenceRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::Bookkeeping]
    }

    fn validate(req: &Self::Request, _state: &LoopState, _ctx: &OpContext<'_>) -> Result<(), String> {
        require("reason", &req.reason)
    }

    fn apply(req: Self::Request, state: &mut LoopState, _ctx: &OpContext<'_>) -> anyhow::Result<String> {
        state.coherence_pending = true;
        Ok(format!("Coherence review flagged: {}", req.reason))
    }
}

pub struct RequestRollback;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestRollbackRequest {
    pub label: String,
    pub reason: String,
}

impl ToolOperation for RequestRollback {
    const NAME: &'static str = names::REQUEST_ROLLBACK;
    type Request = RequestRollbackRequest;

    fn scopes() -> &'static [StateScope] {
        &[StateScope::Bookkeeping]
    }

    fn validate(req: &Self::Request, state: &LoopState, _ctx: &OpContext<'_>) -> Result<(), String> {
        require("reason", &req.reason)?;
        if state.checkpoints.iter().any(|c| c.label == req.label) {
            Ok(())
        } else {
            Err(format!("Rejected: no checkpoint labelled '{}'", req.label))
        }
    }

    fn apply(req: Self::Request, state: &mut LoopState, _ctx: &OpContext<'_>) -> anyhow::Result<String> {
        let message = format!("Rollback to '{}' scheduled", req.label);
        state.pending_rollback = Some(RollbackRequest {
            label: req.label,
            reason: req.reason,
        });
        Ok(message)
    }
}

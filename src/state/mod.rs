//! Persisted state model for a delivery loop.
//!
//! [`LoopState`] is the single durable record of everything the loop knows.
//! It is owned by the state store; components receive it by reference for
//! the duration of one call and never keep it.
//!
//! # Layout
//!
//! ```text
//! LoopState
//!   ├── work_items: BTreeMap<id, WorkItem>     (serialized as sorted list)
//!   ├── checks: BTreeMap<id, CheckRecord>      (serialized as sorted list)
//!   ├── checkpoints: Vec<Checkpoint>           (append-only)
//!   ├── snapshots: Vec<ValueSnapshot>
//!   ├── monitor: ProcessMonitorState
//!   ├── pause: Option<PauseState>
//!   └── counters, flags, vcs bookkeeping, history
//! ```

pub mod persistence;

pub use persistence::StateStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Current schema version of the persisted state.
pub const STATE_VERSION: u32 = 1;

/// Maximum number of iteration records kept in history.
pub const MAX_HISTORY: usize = 200;

// ============================================================================
// Work Items
// ============================================================================

/// Status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Blocked,
    Descoped,
}

impl ItemStatus {
    /// Whether the item no longer needs work.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Descoped)
    }

    /// Whether a dependent item may start once this one is in this state.
    #[must_use]
    pub fn satisfies_dependency(&self) -> bool {
        self.is_terminal()
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Descoped => "descoped",
        };
        f.write_str(s)
    }
}

/// Who or what created a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Part of the initial delivery plan.
    Plan,
    /// Added by an agent while executing.
    #[default]
    Agent,
    /// Added during course correction.
    CourseCorrect,
    /// Added from a research finding.
    Research,
    /// Added by a human operator.
    Human,
}

/// Why a work item is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// Only a human can unblock this item.
    HumanAction {
        instructions: String,
        #[serde(default)]
        verify_command: Option<String>,
    },
    /// Exceeded the retry budget.
    MaxAttempts { attempts: u32, max: u32 },
    /// Anything else.
    Other { reason: String },
}

impl BlockReason {
    /// Whether this block waits on a human.
    #[must_use]
    pub fn is_human(&self) -> bool {
        matches!(self, Self::HumanAction { .. })
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HumanAction { instructions, .. } => {
                write!(f, "Human action required: {}", instructions)
            }
            Self::MaxAttempts { attempts, max } => {
                write!(f, "Exceeded max attempts ({}/{})", attempts, max)
            }
            Self::Other { reason } => write!(f, "{}", reason),
        }
    }
}

/// One unit of delivery work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub origin: Origin,
    pub description: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub acceptance: String,
    /// Identifiers of items that must be done (or descoped) first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Files declared when the item was added.
    #[serde(default)]
    pub declared_files: BTreeSet<String>,
    /// Files actually touched while completing the item.
    #[serde(default)]
    pub files_touched: BTreeSet<String>,
    #[serde(default)]
    pub block_reason: Option<BlockReason>,
    /// Phase tag when the loop is partitioned into phases.
    #[serde(default)]
    pub phase: Option<String>,
    /// Creation order, used by the `fifo` execution order.
    #[serde(default)]
    pub seq: u32,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_iteration: Option<u32>,
}

impl WorkItem {
    /// Create a pending item.
    #[must_use]
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ItemStatus::Pending,
            origin: Origin::default(),
            description: description.into(),
            value: String::new(),
            acceptance: String::new(),
            dependencies: Vec::new(),
            retry_count: 0,
            declared_files: BTreeSet::new(),
            files_touched: BTreeSet::new(),
            block_reason: None,
            phase: None,
            seq: 0,
            completed_at: None,
            completed_iteration: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    /// Whether the item is blocked on a human action.
    #[must_use]
    pub fn is_blocked_on_human(&self) -> bool {
        self.status == ItemStatus::Blocked
            && self.block_reason.as_ref().is_some_and(BlockReason::is_human)
    }

    /// Revert a completed item to pending, clearing completion metadata.
    pub fn revert_to_pending(&mut self) {
        self.status = ItemStatus::Pending;
        self.files_touched.clear();
        self.completed_at = None;
        self.completed_iteration = None;
        self.block_reason = None;
    }
}

// ============================================================================
// Checks
// ============================================================================

/// Status of a verification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    #[default]
    Pending,
    Passed,
    Failed,
    Blocked,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// One recorded failure of a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: String,
    /// What the fixer tried after this failure.
    #[serde(default)]
    pub fix: Option<String>,
    /// Set when the failure is a regression of a previously passing check.
    #[serde(default)]
    pub regression_of: Option<String>,
}

/// One automated verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub id: String,
    pub category: String,
    /// Shell command that runs the check.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: CheckStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    /// Categories whose checks must all pass before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CheckRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            command: String::new(),
            description: String::new(),
            status: CheckStatus::Pending,
            attempts: 0,
            failures: Vec::new(),
            depends_on: Vec::new(),
            timeout_secs: None,
        }
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: CheckStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_depends_on<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = categories.into_iter().map(Into::into).collect();
        self
    }

    /// The most recent failure, if any.
    #[must_use]
    pub fn last_failure(&self) -> Option<&FailureRecord> {
        self.failures.last()
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// A known-good point: workspace revision plus the good subset of state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub label: String,
    /// Workspace revision marker (a git commit hash).
    pub revision: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub done_items: BTreeSet<String>,
    #[serde(default)]
    pub passed_checks: BTreeSet<String>,
    #[serde(default)]
    pub value_score: f64,
}

impl Checkpoint {
    /// Short one-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "[{}] {} @ {} ({} done, {} passed, value {:.2})",
            self.iteration,
            self.label,
            self.revision.chars().take(8).collect::<String>(),
            self.done_items.len(),
            self.passed_checks.len(),
            self.value_score
        )
    }
}

// ============================================================================
// Process Monitor State
// ============================================================================

/// Health tier computed by the process monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    #[default]
    Green,
    Yellow,
    Red,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red => "RED",
        };
        f.write_str(s)
    }
}

/// How the execute handler chooses among ready items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOrder {
    /// Ready item with the most dependents first.
    #[default]
    DependencyFirst,
    /// Creation order.
    Fifo,
    /// Shortest description first.
    SmallestFirst,
}

/// How many failed checks the fix handler takes on per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageGranularity {
    #[default]
    Single,
    Category,
    All,
}

/// Named operating parameters the process monitor may rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyKnobs {
    pub max_fix_attempts: u32,
    pub max_item_retries: u32,
    pub execution_order: ExecutionOrder,
    pub triage_granularity: TriageGranularity,
}

impl Default for StrategyKnobs {
    fn default() -> Self {
        Self {
            max_fix_attempts: 3,
            max_item_retries: 5,
            execution_order: ExecutionOrder::default(),
            triage_granularity: TriageGranularity::default(),
        }
    }
}

/// A partial update to [`StrategyKnobs`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyPatch {
    #[serde(default)]
    pub max_fix_attempts: Option<u32>,
    #[serde(default)]
    pub max_item_retries: Option<u32>,
    #[serde(default)]
    pub execution_order: Option<ExecutionOrder>,
    #[serde(default)]
    pub triage_granularity: Option<TriageGranularity>,
}

impl StrategyPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.max_fix_attempts.is_none()
            && self.max_item_retries.is_none()
            && self.execution_order.is_none()
            && self.triage_granularity.is_none()
    }
}

impl StrategyKnobs {
    /// Apply a partial update.
    pub fn apply(&mut self, patch: &StrategyPatch) {
        if let Some(v) = patch.max_fix_attempts {
            self.max_fix_attempts = v;
        }
        if let Some(v) = patch.max_item_retries {
            self.max_item_retries = v;
        }
        if let Some(v) = patch.execution_order {
            self.execution_order = v;
        }
        if let Some(v) = patch.triage_granularity {
            self.triage_granularity = v;
        }
    }
}

/// A recorded strategy change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyChange {
    pub iteration: u32,
    pub patch: StrategyPatch,
    pub rationale: String,
    #[serde(default)]
    pub reevaluate_after: Option<u32>,
}

/// Rolling metrics and operating strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessMonitorState {
    pub velocity_ema: f64,
    pub efficiency_ema: f64,
    /// Cumulative-sum drift of efficiency below its rolling baseline.
    pub cusum: f64,
    pub efficiency_window: VecDeque<f64>,
    /// Item id -> retry count, for items at 2+ retries.
    pub churn: BTreeMap<String, u32>,
    /// Normalized error signature -> occurrence count.
    pub error_signatures: BTreeMap<String, u32>,
    /// File path -> number of completed items that touched it.
    #[serde(deserialize_with = "persistence::map_or_pairs")]
    pub file_touches: BTreeMap<String, u32>,
    pub strategy: StrategyKnobs,
    pub status: Tier,
    /// Human-readable reasons behind the current tier.
    pub triggers: Vec<String>,
    pub last_strategy_change: Option<u32>,
    pub strategy_history: Vec<StrategyChange>,
    /// Iteration of the snapshot last folded into the EMAs.
    pub last_snapshot_iteration: Option<u32>,
    /// Tokens consumed as of the last metrics pass.
    pub last_tokens_used: u64,
}

impl Default for ProcessMonitorState {
    fn default() -> Self {
        Self {
            velocity_ema: 0.0,
            efficiency_ema: 0.0,
            cusum: 0.0,
            efficiency_window: VecDeque::new(),
            churn: BTreeMap::new(),
            error_signatures: BTreeMap::new(),
            file_touches: BTreeMap::new(),
            strategy: StrategyKnobs::default(),
            status: Tier::Green,
            triggers: Vec::new(),
            last_strategy_change: None,
            strategy_history: Vec::new(),
            last_snapshot_iteration: None,
            last_tokens_used: 0,
        }
    }
}

// ============================================================================
// Value Snapshots
// ============================================================================

/// Severity of a value gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Something standing between the current state and delivered value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub description: String,
    #[serde(default)]
    pub severity: GapSeverity,
    #[serde(default)]
    pub remediation: Option<String>,
}

impl Gap {
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            severity: GapSeverity::default(),
            remediation: None,
        }
    }
}

/// What a value snapshot recommends doing next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    #[default]
    #[serde(alias = "continue")]
    Continue,
    #[serde(alias = "course_correct")]
    CourseCorrect,
    #[serde(alias = "descope")]
    Descope,
    #[serde(alias = "ship_ready")]
    ShipReady,
}

/// Point-in-time assessment of verifiably delivered value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSnapshot {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub verified: u32,
    #[serde(default)]
    pub blocked: u32,
    /// Value score in `[0, 1]`.
    #[serde(default)]
    pub score: f64,
    #[serde(default, deserialize_with = "persistence::normalize_gaps")]
    pub gaps: Vec<Gap>,
    #[serde(default)]
    pub recommendation: Recommendation,
}

// ============================================================================
// Pause, services, bookkeeping
// ============================================================================

/// Outstanding request for a human action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseState {
    pub reason: String,
    pub instructions: String,
    #[serde(default)]
    pub verify_command: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// Last known health of a declared external dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(default)]
    pub detail: String,
    pub checked_at: DateTime<Utc>,
}

/// Version-control bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VcsState {
    pub branch: Option<String>,
    pub base_revision: Option<String>,
    pub last_commit: Option<String>,
    /// Whether pre-existing local changes were stashed at startup.
    pub stashed: bool,
    pub commits: u32,
}

/// A research finding reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchFinding {
    pub iteration: u32,
    pub topic: String,
    pub finding: String,
    #[serde(default)]
    pub applies_to: Vec<String>,
}

/// A completed rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    /// Identifier of the write-ahead log record that drove this rollback.
    pub log_id: String,
    pub label: String,
    pub revision: String,
    pub reason: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub reverted_items: Vec<String>,
    #[serde(default)]
    pub reset_checks: Vec<String>,
}

/// A rollback requested by an agent, performed after the current handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub label: String,
    pub reason: String,
}

/// One line of loop history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub action: String,
    pub progressed: bool,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Token budget accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    pub tokens_used: u64,
    pub token_budget: Option<u64>,
}

impl Budget {
    /// Fraction of the budget consumed, if a budget is set.
    #[must_use]
    pub fn fraction_used(&self) -> Option<f64> {
        match self.token_budget {
            Some(budget) if budget > 0 => Some(self.tokens_used as f64 / budget as f64),
            _ => None,
        }
    }
}

// ============================================================================
// Loop State
// ============================================================================

/// Everything the loop knows about one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub unit: String,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default, with = "persistence::keyed_list")]
    pub work_items: BTreeMap<String, WorkItem>,
    #[serde(default, with = "persistence::keyed_list")]
    pub checks: BTreeMap<String, CheckRecord>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub snapshots: Vec<ValueSnapshot>,
    #[serde(default)]
    pub monitor: ProcessMonitorState,
    #[serde(default)]
    pub pause: Option<PauseState>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceHealth>,
    #[serde(default)]
    pub vcs: VcsState,
    #[serde(default)]
    pub research: Vec<ResearchFinding>,
    #[serde(default)]
    pub rollbacks: Vec<RollbackRecord>,
    #[serde(default)]
    pub history: VecDeque<IterationRecord>,
    #[serde(default)]
    pub budget: Budget,
    #[serde(default)]
    pub no_progress_count: u32,
    #[serde(default)]
    pub course_corrections: u32,
    #[serde(default)]
    pub checks_generated: bool,
    /// Fingerprint of the failing-check set research was last attempted for.
    #[serde(default)]
    pub research_attempted_for: Option<String>,
    #[serde(default)]
    pub coherence_pending: bool,
    #[serde(default)]
    pub last_critical_eval: Option<u32>,
    #[serde(default)]
    pub last_progress_iteration: u32,
    #[serde(default)]
    pub active_phase: Option<String>,
    #[serde(default)]
    pub pending_rollback: Option<RollbackRequest>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub next_item_seq: u32,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl LoopState {
    /// Fresh state for a unit of work.
    #[must_use]
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            unit: unit.into(),
            iteration: 0,
            work_items: BTreeMap::new(),
            checks: BTreeMap::new(),
            checkpoints: Vec::new(),
            snapshots: Vec::new(),
            monitor: ProcessMonitorState::default(),
            pause: None,
            services: BTreeMap::new(),
            vcs: VcsState::default(),
            research: Vec::new(),
            rollbacks: Vec::new(),
            history: VecDeque::new(),
            budget: Budget::default(),
            no_progress_count: 0,
            course_corrections: 0,
            checks_generated: false,
            research_attempted_for: None,
            coherence_pending: false,
            last_critical_eval: None,
            last_progress_iteration: 0,
            active_phase: None,
            pending_rollback: None,
            completed: false,
            next_item_seq: 0,
        }
    }

    /// Insert an item, assigning its creation sequence number.
    pub fn insert_item(&mut self, mut item: WorkItem) {
        self.next_item_seq += 1;
        item.seq = self.next_item_seq;
        self.work_items.insert(item.id.clone(), item);
    }

    /// Insert or replace a check.
    pub fn insert_check(&mut self, check: CheckRecord) {
        self.checks.insert(check.id.clone(), check);
    }

    /// Items in the active phase (all items when no phase is active).
    pub fn items_in_scope(&self) -> impl Iterator<Item = &WorkItem> {
        let phase = self.active_phase.as_deref();
        self.work_items
            .values()
            .filter(move |item| phase.is_none() || item.phase.as_deref() == phase)
    }

    /// Ids of items currently `done`.
    #[must_use]
    pub fn done_items(&self) -> BTreeSet<String> {
        self.work_items
            .values()
            .filter(|i| i.status == ItemStatus::Done)
            .map(|i| i.id.clone())
            .collect()
    }

    /// Ids of checks currently `passed`.
    #[must_use]
    pub fn passed_checks(&self) -> BTreeSet<String> {
        self.checks
            .values()
            .filter(|c| c.status == CheckStatus::Passed)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Checks currently `failed`.
    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckRecord> {
        self.checks
            .values()
            .filter(|c| c.status == CheckStatus::Failed)
    }

    /// Whether every dependency of `item` is done or descoped.
    #[must_use]
    pub fn dependencies_satisfied(&self, item: &WorkItem) -> bool {
        self.all_satisfied(&item.dependencies)
    }

    /// Whether every id in `deps` names a finished item.
    #[must_use]
    pub fn all_satisfied(&self, deps: &[String]) -> bool {
        deps.iter().all(|dep| {
            self.work_items
                .get(dep)
                .is_some_and(|d| d.status.satisfies_dependency())
        })
    }

    /// Number of items that declare `id` as a dependency.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> usize {
        self.work_items
            .values()
            .filter(|i| i.dependencies.iter().any(|d| d == id))
            .count()
    }

    /// Whether every check in the given categories has passed.
    #[must_use]
    pub fn categories_passed(&self, categories: &[String]) -> bool {
        categories.iter().all(|cat| {
            self.checks
                .values()
                .filter(|c| &c.category == cat)
                .all(|c| c.status == CheckStatus::Passed)
        })
    }

    /// Whether any check in the given categories has failed or is blocked.
    #[must_use]
    pub fn categories_broken(&self, categories: &[String]) -> bool {
        categories.iter().any(|cat| {
            self.checks.values().any(|c| {
                &c.category == cat
                    && matches!(c.status, CheckStatus::Failed | CheckStatus::Blocked)
            })
        })
    }

    /// Most recent value snapshot.
    #[must_use]
    pub fn latest_snapshot(&self) -> Option<&ValueSnapshot> {
        self.snapshots.last()
    }

    /// Stable fingerprint of the current set of failing checks.
    #[must_use]
    pub fn failure_fingerprint(&self) -> String {
        let ids: Vec<&str> = self.failed_checks().map(|c| c.id.as_str()).collect();
        ids.join(",")
    }

    /// Append to the bounded iteration history.
    pub fn push_history(&mut self, record: IterationRecord) {
        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    /// Coarse progress marker compared before and after each iteration.
    #[must_use]
    pub fn progress_marker(&self) -> ProgressMarker {
        ProgressMarker {
            done: self
                .work_items
                .values()
                .filter(|i| i.status.is_terminal())
                .count(),
            passed: self
                .checks
                .values()
                .filter(|c| c.status == CheckStatus::Passed)
                .count(),
            items: self.work_items.len(),
            checks: self.checks.len(),
            best_score_milli: self
                .snapshots
                .iter()
                .map(|s| (s.score * 1000.0).round() as i64)
                .max()
                .unwrap_or(0),
        }
    }
}

/// Counts used to decide whether an iteration moved the work forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMarker {
    pub done: usize,
    pub passed: usize,
    pub items: usize,
    pub checks: usize,
    pub best_score_milli: i64,
}

impl ProgressMarker {
    /// Whether `after` represents forward progress over `self`.
    #[must_use]
    pub fn advanced_by(&self, after: &ProgressMarker) -> bool {
        after.done > self.done
            || after.passed > self.passed
            || after.best_score_milli > self.best_score_milli
            || (after.checks > self.checks)
    }
}

//! Tool dispatcher: the only mutation gateway into [`LoopState`].
//!
//! Every structured operation goes through the same discipline:
//!
//! 1. Snapshot the sub-trees of state the operation declares it may touch.
//! 2. Decode the payload into the operation's typed request.
//! 3. Run deterministic validation. A failure is a [`DispatchOutcome::Rejected`]
//!    and nothing has been mutated.
//! 4. Apply. If the handler errors or panics, the snapshot is swapped back
//!    and a [`DispatchOutcome::Failed`] is returned.
//!
//! The loop's own bookkeeping uses the same snapshot machinery through
//! [`ToolDispatcher::transact`].
//!
//! # Example
//!
//! ```rust,ignore
//! let dispatcher = ToolDispatcher::new(&config);
//! let outcome = dispatcher.dispatch(
//!     &mut state,
//!     Caller::Agent(AgentRole::Planner),
//!     "add_work_item",
//!     json!({"description": "CSV export", "value": "...", "acceptance": "..."}),
//! );
//! println!("{}", outcome.to_envelope());
//! ```

pub mod ops;
pub mod validation;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, info, warn};

use crate::agent::{AgentRole, ToolCall};
use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::state::{
    Budget, CheckRecord, Checkpoint, IterationRecord, LoopState, PauseState,
    ProcessMonitorState, ResearchFinding, RollbackRecord, RollbackRequest, ServiceHealth,
    ValueSnapshot, VcsState, WorkItem,
};

// ============================================================================
// Callers and scopes
// ============================================================================

/// Who is asking for a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Agent(AgentRole),
    Human,
}

impl Caller {
    pub fn is_human(&self) -> bool {
        matches!(self, Self::Human)
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(role) => write!(f, "agent:{role}"),
            Self::Human => f.write_str("human"),
        }
    }
}

/// Sub-trees of [`LoopState`] an operation may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateScope {
    WorkItems,
    Checks,
    Checkpoints,
    Snapshots,
    Monitor,
    Pause,
    Services,
    Research,
    /// Counters, flags, history, budget and version-control bookkeeping.
    Bookkeeping,
}

impl StateScope {
    pub const ALL: &'static [StateScope] = &[
        Self::WorkItems,
        Self::Checks,
        Self::Checkpoints,
        Self::Snapshots,
        Self::Monitor,
        Self::Pause,
        Self::Services,
        Self::Research,
        Self::Bookkeeping,
    ];
}

#[derive(Debug, Clone)]
struct Bookkeeping {
    iteration: u32,
    history: VecDeque<IterationRecord>,
    budget: Budget,
    no_progress_count: u32,
    course_corrections: u32,
    checks_generated: bool,
    research_attempted_for: Option<String>,
    coherence_pending: bool,
    last_critical_eval: Option<u32>,
    last_progress_iteration: u32,
    active_phase: Option<String>,
    pending_rollback: Option<RollbackRequest>,
    completed: bool,
    vcs: VcsState,
    rollbacks: Vec<RollbackRecord>,
}

/// Deep copy of the declared sub-trees, taken on entry.
#[derive(Debug, Default)]
struct ScopedSnapshot {
    work_items: Option<(BTreeMap<String, WorkItem>, u32)>,
    checks: Option<BTreeMap<String, CheckRecord>>,
    checkpoints: Option<Vec<Checkpoint>>,
    snapshots: Option<Vec<ValueSnapshot>>,
    monitor: Option<ProcessMonitorState>,
    pause: Option<Option<PauseState>>,
    services: Option<BTreeMap<String, ServiceHealth>>,
    research: Option<Vec<ResearchFinding>>,
    bookkeeping: Option<Bookkeeping>,
}

impl ScopedSnapshot {
    fn capture(state: &LoopState, scopes: &[StateScope]) -> Self {
        let mut snap = Self::default();
        for scope in scopes {
            match scope {
                StateScope::WorkItems => {
                    snap.work_items = Some((state.work_items.clone(), state.next_item_seq));
                }
                StateScope::Checks => snap.checks = Some(state.checks.clone()),
                StateScope::Checkpoints => snap.checkpoints = Some(state.checkpoints.clone()),
                StateScope::Snapshots => snap.snapshots = Some(state.snapshots.clone()),
                StateScope::Monitor => snap.monitor = Some(state.monitor.clone()),
                StateScope::Pause => snap.pause = Some(state.pause.clone()),
                StateScope::Services => snap.services = Some(state.services.clone()),
                StateScope::Research => snap.research = Some(state.research.clone()),
                StateScope::Bookkeeping => {
                    snap.bookkeeping = Some(Bookkeeping {
                        iteration: state.iteration,
                        history: state.history.clone(),
                        budget: state.budget,
                        no_progress_count: state.no_progress_count,
                        course_corrections: state.course_corrections,
                        checks_generated: state.checks_generated,
                        research_attempted_for: state.research_attempted_for.clone(),
                        coherence_pending: state.coherence_pending,
                        last_critical_eval: state.last_critical_eval,
                        last_progress_iteration: state.last_progress_iteration,
                        active_phase: state.active_phase.clone(),
                        pending_rollback: state.pending_rollback.clone(),
                        completed: state.completed,
                        vcs: state.vcs.clone(),
                        rollbacks: state.rollbacks.clone(),
                    });
                }
            }
        }
        snap
    }

    fn restore(self, state: &mut LoopState) {
        if let Some((items, seq)) = self.work_items {
            state.work_items = items;
            state.next_item_seq = seq;
        }
        if let Some(checks) = self.checks {
            state.checks = checks;
        }
        if let Some(checkpoints) = self.checkpoints {
            state.checkpoints = checkpoints;
        }
        if let Some(snapshots) = self.snapshots {
            state.snapshots = snapshots;
        }
        if let Some(monitor) = self.monitor {
            state.monitor = monitor;
        }
        if let Some(pause) = self.pause {
            state.pause = pause;
        }
        if let Some(services) = self.services {
            state.services = services;
        }
        if let Some(research) = self.research {
            state.research = research;
        }
        if let Some(b) = self.bookkeeping {
            state.iteration = b.iteration;
            state.history = b.history;
            state.budget = b.budget;
            state.no_progress_count = b.no_progress_count;
            state.course_corrections = b.course_corrections;
            state.checks_generated = b.checks_generated;
            state.research_attempted_for = b.research_attempted_for;
            state.coherence_pending = b.coherence_pending;
            state.last_critical_eval = b.last_critical_eval;
            state.last_progress_iteration = b.last_progress_iteration;
            state.active_phase = b.active_phase;
            state.pending_rollback = b.pending_rollback;
            state.completed = b.completed;
            state.vcs = b.vcs;
            state.rollbacks = b.rollbacks;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Read-only context handed to every operation.
#[derive(Debug, Clone, Copy)]
pub struct OpContext<'a> {
    pub config: &'a LoopConfig,
    pub caller: Caller,
    pub iteration: u32,
}

/// One typed operation.
pub trait ToolOperation: Send + Sync + 'static {
    const NAME: &'static str;
    type Request: DeserializeOwned;

    /// Sub-trees `apply` may touch.
    fn scopes() -> &'static [StateScope];

    /// Business-rule validation. Must not mutate.
    fn validate(_req: &Self::Request, _state: &LoopState, _ctx: &OpContext<'_>) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Apply the mutation and return a short message for the caller.
    fn apply(req: Self::Request, state: &mut LoopState, ctx: &OpContext<'_>) -> anyhow::Result<String>;
}

enum Step {
    Rejected(String),
    Applied(anyhow::Result<String>),
}

trait ErasedOperation: Send + Sync {
    fn scopes(&self) -> &'static [StateScope];
    fn execute(&self, payload: Value, state: &mut LoopState, ctx: &OpContext<'_>) -> Step;
}

struct Registered<O>(PhantomData<fn() -> O>);

impl<O: ToolOperation> ErasedOperation for Registered<O> {
    fn scopes(&self) -> &'static [StateScope] {
        O::scopes()
    }

    fn execute(&self, payload: Value, state: &mut LoopState, ctx: &OpContext<'_>) -> Step {
        let request: O::Request = match serde_json::from_value(payload) {
            Ok(req) => req,
            Err(e) => return Step::Rejected(format!("Rejected: invalid payload for {}: {e}", O::NAME)),
        };
        if let Err(reason) = O::validate(&request, state, ctx) {
            return Step::Rejected(reason);
        }
        Step::Applied(O::apply(request, state, ctx))
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of dispatching one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The mutation stands.
    Applied { result: String },
    /// Validation refused the call; state is unchanged.
    Rejected(String),
    /// The handler failed; state was rolled back.
    Failed { error: String },
}

impl DispatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Wire form returned to the agent.
    pub fn to_envelope(&self) -> Value {
        match self {
            Self::Applied { result } => json!({ "ok": true, "result": result }),
            Self::Rejected(reason) => Value::String(reason.clone()),
            Self::Failed { error } => json!({ "error": error, "rolled_back": true }),
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_envelope())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Registry of typed operations plus the transaction discipline.
pub struct ToolDispatcher {
    config: LoopConfig,
    registry: HashMap<&'static str, Box<dyn ErasedOperation>>,
}

impl ToolDispatcher {
    /// Dispatcher with every built-in operation registered.
    pub fn new(config: &LoopConfig) -> Self {
        let mut dispatcher = Self {
            config: config.clone(),
            registry: HashMap::new(),
        };
        dispatcher.register::<ops::AddWorkItem>();
        dispatcher.register::<ops::ModifyWorkItem>();
        dispatcher.register::<ops::RemoveWorkItem>();
        dispatcher.register::<ops::AddCheck>();
        dispatcher.register::<ops::RecordCheckResult>();
        dispatcher.register::<ops::RecordFix>();
        dispatcher.register::<ops::ReportValueSnapshot>();
        dispatcher.register::<ops::ReportResearchFinding>();
        dispatcher.register::<ops::ReportStrategyChange>();
        dispatcher.register::<ops::Escalate>();
        dispatcher.register::<ops::ReportServiceHealth>();
        dispatcher.register::<ops::FlagCoherence>();
        dispatcher.register::<ops::RequestRollback>();
        dispatcher
    }

    /// Register an operation under its name, replacing any previous one.
    pub fn register<O: ToolOperation>(&mut self) {
        self.registry
            .insert(O::NAME, Box::new(Registered::<O>(PhantomData)));
    }

    /// Registered operation names, sorted.
    pub fn operation_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.registry.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Dispatch a tool call reported by an agent.
    pub fn dispatch_call(&self, state: &mut LoopState, caller: Caller, call: &ToolCall) -> DispatchOutcome {
        self.dispatch(state, caller, &call.name, call.payload.clone())
    }

    /// Dispatch one named operation.
    pub fn dispatch(
        &self,
        state: &mut LoopState,
        caller: Caller,
        name: &str,
        payload: Value,
    ) -> DispatchOutcome {
        let Some(op) = self.registry.get(name) else {
            debug!("{} called unknown operation '{}'", caller, name);
            return DispatchOutcome::Rejected(format!("Rejected: unknown operation '{name}'"));
        };

        if let Caller::Agent(role) = caller {
            if !role.allows(name) {
                debug!("{} is not allowed to call '{}'", caller, name);
                return DispatchOutcome::Rejected(format!(
                    "Rejected: role '{role}' may not call '{name}'"
                ));
            }
        }

        let ctx = OpContext {
            config: &self.config,
            caller,
            iteration: state.iteration,
        };

        let snapshot = ScopedSnapshot::capture(state, op.scopes());
        let step = catch_unwind(AssertUnwindSafe(|| op.execute(payload, state, &ctx)));

        match step {
            Ok(Step::Rejected(reason)) => {
                info!("{} -> {} rejected: {}", caller, name, reason);
                DispatchOutcome::Rejected(reason)
            }
            Ok(Step::Applied(Ok(result))) => {
                info!("{} -> {}: {}", caller, name, result);
                DispatchOutcome::Applied { result }
            }
            Ok(Step::Applied(Err(e))) => {
                snapshot.restore(state);
                warn!("{} -> {} failed, rolled back: {:#}", caller, name, e);
                DispatchOutcome::Failed {
                    error: format!("{e:#}"),
                }
            }
            Err(panic) => {
                snapshot.restore(state);
                let message = panic_message(panic.as_ref());
                warn!("{} -> {} panicked, rolled back: {}", caller, name, message);
                DispatchOutcome::Failed { error: message }
            }
        }
    }

    /// Run `f` against `state` with the same snapshot/commit/rollback
    /// discipline as a dispatched operation.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::HandlerFailure`] if `f` fails or panics; the
    /// declared scopes are restored first.
    pub fn transact<T, F>(
        state: &mut LoopState,
        scopes: &[StateScope],
        label: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut LoopState) -> anyhow::Result<T>,
    {
        let snapshot = ScopedSnapshot::capture(state, scopes);
        match catch_unwind(AssertUnwindSafe(|| f(state))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                snapshot.restore(state);
                warn!("Transaction '{}' rolled back: {:#}", label, e);
                Err(LoopError::HandlerFailure {
                    operation: label.to_string(),
                    message: format!("{e:#}"),
                })
            }
            Err(panic) => {
                snapshot.restore(state);
                let message = panic_message(panic.as_ref());
                warn!("Transaction '{}' panicked, rolled back: {}", label, message);
                Err(LoopError::HandlerFailure {
                    operation: label.to_string(),
                    message,
                })
            }
        }
    }
}

impl fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("operations", &self.operation_names())
            .finish()
    }
}

//! valueloop - control plane for an autonomous software-delivery loop
//!
//! Drives an external coding agent through repeated iterations until a unit
//! of work is delivered and verified. The loop owns the state; agents only
//! propose changes through validated structured operations.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`state`] - Loop state model and crash-safe persistence
//! - [`dispatch`] - Validated, transactional tool operations
//! - [`decision`] - Deterministic next-action ladder
//! - [`runner`] - Parallel verification-check execution
//! - [`monitor`] - Process metrics, health tiers and strategy reasoning
//! - [`checkpoint`] - Checkpoints and write-ahead-logged rollback
//! - [`orchestrator`] - The outer loop and per-action handlers
//! - [`agent`] - Agent roles and the Claude CLI capability
//! - [`vcs`] - Git workspace operations
//! - [`config`] - Configuration loading and validation
//! - [`lock`] - Single-process lock per project
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Mock agent and version control
//!
//! # Example
//!
//! ```rust,ignore
//! use valueloop::{LoopConfig, Orchestrator, RunOutcome};
//!
//! let config = LoopConfig::load(".")?;
//! let orchestrator = Orchestrator::new(".", config)?;
//! if let RunOutcome::Paused(reason) = orchestrator.run().await? {
//!     eprintln!("needs a human: {reason}");
//! }
//! ```

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod decision;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod monitor;
pub mod orchestrator;
pub mod runner;
pub mod state;
pub mod testing;
pub mod vcs;

// Re-export commonly used types
pub use error::{IntoLoopError, LoopError, Result};

pub use agent::{AgentCapability, AgentResponse, AgentRole, ClaudeCli, ToolCall};
pub use checkpoint::{create_checkpoint, find_checkpoint, RollbackManager};
pub use config::LoopConfig;
pub use decision::{next_action, Action};
pub use dispatch::{Caller, DispatchOutcome, ToolDispatcher};
pub use orchestrator::{LoopDependencies, Orchestrator, ResumeOutcome, RunOutcome, StepReport};
pub use runner::{ExecutionRunner, UnitResult};
pub use state::{CheckRecord, LoopState, StateStore, WorkItem};
pub use vcs::{GitWorkspace, VersionControl};

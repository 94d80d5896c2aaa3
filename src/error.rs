//! Error types for the delivery loop.
//!
//! Validation rejections from the tool dispatcher are *not* errors; they
//! are returned as [`crate::dispatch::DispatchOutcome::Rejected`] values.
//! Everything here is a failure the loop either retries or hands to a human.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for valueloop operations
#[derive(Error, Debug)]
pub enum LoopError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// The persisted state file exists but cannot be parsed
    #[error("Corrupt state file {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    /// A handler failed while mutating state; the transaction was rolled back
    #[error("Handler '{operation}' failed: {message}")]
    HandlerFailure { operation: String, message: String },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Agent invocation failed
    #[error("Agent role '{role}' failed: {message}")]
    Agent { role: String, message: String },

    /// A verification unit or agent call exceeded its time budget
    #[error("{what} timed out after {secs}s")]
    ExecutionTimeout { what: String, secs: u64 },

    /// Missing required tool
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    /// Version-control operation failed
    #[error("Version control operation failed: {operation} - {message}")]
    Vcs { operation: String, message: String },

    // =========================================================================
    // Checkpoint / Rollback Errors
    // =========================================================================
    /// No checkpoint carries the requested label
    #[error("No checkpoint labelled '{label}'")]
    CheckpointNotFound { label: String },

    /// A rollback step failed; the write-ahead log is left in place
    #[error("Rollback step '{step}' failed: {message}")]
    Rollback { step: String, message: String },

    // =========================================================================
    // Lock Errors
    // =========================================================================
    /// Another live process owns the loop
    #[error("Loop already running (pid {pid})")]
    LockHeld { pid: u32 },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// TOML error wrapper
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoopError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an agent error
    pub fn agent(role: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Agent {
            role: role.into(),
            message: message.into(),
        }
    }

    /// Create a version-control error
    pub fn vcs(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Vcs {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a rollback error
    pub fn rollback(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rollback {
            step: step.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is recoverable by another automated attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Agent { .. }
                | Self::ExecutionTimeout { .. }
                | Self::HandlerFailure { .. }
                | Self::Vcs { .. }
        )
    }

    /// Check if this error requires human intervention
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::CorruptState { .. } | Self::Rollback { .. })
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LockHeld { .. } => 4,
            Self::Rollback { .. } | Self::CheckpointNotFound { .. } => 5,
            Self::MissingTool { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            Self::CorruptState { .. } => 8,
            _ => 1,
        }
    }
}

/// Type alias for valueloop results
pub type Result<T> = std::result::Result<T, LoopError>;

/// Extension trait for converting foreign errors into [`LoopError`]
pub trait IntoLoopError<T> {
    fn into_loop_vcs(self, operation: &str) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoLoopError<T> for std::result::Result<T, E> {
    fn into_loop_vcs(self, operation: &str) -> Result<T> {
        self.map_err(|e| LoopError::vcs(operation, e.into().to_string()))
    }
}

//! Agent capability interface.
//!
//! The agent is the external actor that does generative and analytical
//! work. It is invoked with a role and a prompt and returns text plus zero
//! or more structured tool calls. Tool calls are never applied here; the
//! orchestrator routes every one of them through the
//! [`ToolDispatcher`](crate::dispatch::ToolDispatcher).

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

use crate::config::{AgentConfig, RoleProfile};
use crate::dispatch::ops::names;
use crate::error::{LoopError, Result};

// ============================================================================
// Roles
// ============================================================================

/// Role an agent is invoked in. Selects model tier, turn budget, timeout and
/// the operations the agent may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Executor,
    Fixer,
    Researcher,
    Evaluator,
    Strategist,
    CheckWriter,
    ServiceFixer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Fixer => "fixer",
            Self::Researcher => "researcher",
            Self::Evaluator => "evaluator",
            Self::Strategist => "strategist",
            Self::CheckWriter => "check_writer",
            Self::ServiceFixer => "service_fixer",
        }
    }

    /// Operations this role may dispatch.
    pub fn allowed_operations(&self) -> &'static [&'static str] {
        match self {
            Self::Planner => &[
                names::ADD_WORK_ITEM,
                names::MODIFY_WORK_ITEM,
                names::REMOVE_WORK_ITEM,
                names::FLAG_COHERENCE,
                names::ESCALATE,
            ],
            Self::Executor => &[
                names::ADD_WORK_ITEM,
                names::MODIFY_WORK_ITEM,
                names::FLAG_COHERENCE,
                names::REQUEST_ROLLBACK,
                names::ESCALATE,
            ],
            Self::Fixer => &[
                names::RECORD_FIX,
                names::RECORD_CHECK_RESULT,
                names::MODIFY_WORK_ITEM,
                names::REQUEST_ROLLBACK,
                names::ESCALATE,
            ],
            Self::Researcher => &[
                names::REPORT_RESEARCH_FINDING,
                names::ADD_WORK_ITEM,
                names::ESCALATE,
            ],
            Self::Evaluator => &[
                names::REPORT_VALUE_SNAPSHOT,
                names::ADD_WORK_ITEM,
                names::MODIFY_WORK_ITEM,
                names::REMOVE_WORK_ITEM,
                names::FLAG_COHERENCE,
                names::ESCALATE,
            ],
            Self::Strategist => &[
                names::REPORT_STRATEGY_CHANGE,
                names::REQUEST_ROLLBACK,
                names::ESCALATE,
            ],
            Self::CheckWriter => &[names::ADD_CHECK, names::ESCALATE],
            Self::ServiceFixer => &[names::REPORT_SERVICE_HEALTH, names::ESCALATE],
        }
    }

    /// Whether this role may dispatch `operation`.
    pub fn allows(&self, operation: &str) -> bool {
        self.allowed_operations().contains(&operation)
    }

    /// Built-in profile used when the config has no override.
    pub fn default_profile(&self) -> RoleProfile {
        let (model, max_turns, timeout_secs) = match self {
            Self::Planner | Self::Strategist | Self::Evaluator => ("opus", 20, 900),
            Self::Executor => ("sonnet", 40, 1800),
            Self::Fixer | Self::Researcher | Self::CheckWriter => ("sonnet", 25, 900),
            Self::ServiceFixer => ("haiku", 10, 300),
        };
        RoleProfile {
            model: model.to_string(),
            max_turns,
            timeout_secs,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Responses
// ============================================================================

/// One structured operation reported by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Result of one agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub tokens_used: u64,
}

impl AgentResponse {
    /// Response with text and no tool calls.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Add a tool call.
    #[must_use]
    pub fn with_call(mut self, name: &str, payload: serde_json::Value) -> Self {
        self.tool_calls.push(ToolCall::new(name, payload));
        self
    }

    /// Set the reported token usage.
    #[must_use]
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

// ============================================================================
// Capability
// ============================================================================

/// External agent capability.
///
/// Implementations must be cancel-safe: the orchestrator enforces the
/// per-role timeout by dropping the future.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    /// Invoke the agent in `role`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Agent`] when the agent cannot be run or exits
    /// unsuccessfully.
    async fn invoke(
        &self,
        role: AgentRole,
        system_context: &str,
        prompt: &str,
    ) -> Result<AgentResponse>;
}

/// Instructions shared by every role describing the tool-call protocol.
pub fn system_context(role: AgentRole) -> String {
    format!(
        "You are acting as the {role} of an autonomous delivery loop.\n\
         You may change loop state only by emitting tool calls, one per fenced block:\n\
         ```tool\n{{\"name\": \"<operation>\", \"payload\": {{ ... }}}}\n```\n\
         Operations available to you: {}.\n\
         Calls outside this list are rejected.",
        role.allowed_operations().join(", ")
    )
}

fn tool_block_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)```tool\s*\n(.*?)\n\s*```").ok())
        .as_ref()
}

/// Extract fenced tool calls from agent output.
///
/// Blocks that are not valid JSON are skipped with a warning.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let Some(pattern) = tool_block_pattern() else {
        return Vec::new();
    };
    pattern
        .captures_iter(text)
        .filter_map(|cap| {
            let body = cap.get(1)?.as_str();
            match serde_json::from_str::<ToolCall>(body) {
                Ok(call) => Some(call),
                Err(e) => {
                    warn!("Skipping malformed tool call block: {}", e);
                    None
                }
            }
        })
        .collect()
}

/// Invoke `agent` under the role's time budget.
///
/// # Errors
///
/// Returns [`LoopError::ExecutionTimeout`] when the budget elapses, or the
/// agent's own error.
pub async fn invoke_with_timeout(
    agent: &dyn AgentCapability,
    role: AgentRole,
    timeout_secs: u64,
    prompt: &str,
) -> Result<AgentResponse> {
    let context = system_context(role);
    let budget = std::time::Duration::from_secs(timeout_secs.max(1));
    match tokio::time::timeout(budget, agent.invoke(role, &context, prompt)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Agent role {} timed out after {}s", role, timeout_secs);
            Err(LoopError::ExecutionTimeout {
                what: format!("agent role '{role}'"),
                secs: timeout_secs,
            })
        }
    }
}

// ============================================================================
// Claude CLI
// ============================================================================

/// Agent capability backed by the `claude` command-line tool.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    binary: PathBuf,
    project_dir: PathBuf,
    config: AgentConfig,
}

impl ClaudeCli {
    /// Locate the configured binary on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::MissingTool`] if the binary cannot be found.
    pub fn new(project_dir: impl Into<PathBuf>, config: AgentConfig) -> Result<Self> {
        let binary = which::which(&config.binary).map_err(|_| LoopError::MissingTool {
            tool: config.binary.clone(),
        })?;
        Ok(Self {
            binary,
            project_dir: project_dir.into(),
            config,
        })
    }
}

#[async_trait]
impl AgentCapability for ClaudeCli {
    async fn invoke(
        &self,
        role: AgentRole,
        system_context: &str,
        prompt: &str,
    ) -> Result<AgentResponse> {
        let profile = self.config.profile(role);
        let max_turns = profile.max_turns.to_string();
        let args = [
            "-p",
            "--dangerously-skip-permissions",
            "--model",
            profile.model.as_str(),
            "--max-turns",
            max_turns.as_str(),
            "--append-system-prompt",
            system_context,
            "--output-format",
            "text",
        ];

        debug!("Invoking {} ({} chars prompt)", role, prompt.len());

        let mut child = AsyncCommand::new(&self.binary)
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LoopError::agent(role.as_str(), format!("spawn failed: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| LoopError::agent(role.as_str(), format!("stdin: {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| LoopError::agent(role.as_str(), format!("wait: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LoopError::agent(
                role.as_str(),
                format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        // ~4 chars per token
        let tokens_used = ((prompt.len() + system_context.len() + text.len()) / 4) as u64;
        let tool_calls = parse_tool_calls(&text);

        Ok(AgentResponse {
            text,
            tool_calls,
            tokens_used,
        })
    }
}

//! Controllable test doubles for the agent and version control.

use async_trait::async_trait;
use globset::GlobSet;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::agent::{AgentCapability, AgentResponse, AgentRole};
use crate::error::{LoopError, Result};
use crate::vcs::VersionControl;

// ============================================================================
// Agent
// ============================================================================

/// Scripted agent.
///
/// Responses queued for a specific role are used first, then the shared
/// queue; when both are empty the agent answers with empty text.
///
/// # Example
///
/// ```rust,ignore
/// let agent = MockAgent::new()
///     .with_role_response(AgentRole::Planner, AgentResponse::text("plan"))
///     .with_delay(Duration::from_millis(10));
/// ```
#[derive(Debug, Default)]
pub struct MockAgent {
    shared: Mutex<VecDeque<AgentResponse>>,
    by_role: Mutex<HashMap<AgentRole, VecDeque<AgentResponse>>>,
    calls: Mutex<Vec<(AgentRole, String)>>,
    delay: Option<Duration>,
    failure: Option<String>,
}

impl MockAgent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for whichever role calls next.
    #[must_use]
    pub fn with_response(self, response: AgentResponse) -> Self {
        if let Ok(mut queue) = self.shared.lock() {
            queue.push_back(response);
        }
        self
    }

    /// Queue a response for `role` only.
    #[must_use]
    pub fn with_role_response(self, role: AgentRole, response: AgentResponse) -> Self {
        if let Ok(mut map) = self.by_role.lock() {
            map.entry(role).or_default().push_back(response);
        }
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every invocation with `message`.
    #[must_use]
    pub fn with_failure(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Queue a response at runtime.
    pub fn push_response(&self, response: AgentResponse) {
        if let Ok(mut queue) = self.shared.lock() {
            queue.push_back(response);
        }
    }

    /// Every invocation so far as `(role, prompt)`.
    pub fn calls(&self) -> Vec<(AgentRole, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Roles invoked so far, in order.
    pub fn roles(&self) -> Vec<AgentRole> {
        self.calls().into_iter().map(|(role, _)| role).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn next_response(&self, role: AgentRole) -> AgentResponse {
        if let Ok(mut map) = self.by_role.lock() {
            if let Some(response) = map.get_mut(&role).and_then(VecDeque::pop_front) {
                return response;
            }
        }
        self.shared
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentCapability for MockAgent {
    async fn invoke(
        &self,
        role: AgentRole,
        _system_context: &str,
        prompt: &str,
    ) -> Result<AgentResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((role, prompt.to_string()));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(LoopError::agent(role.as_str(), message.clone()));
        }
        Ok(self.next_response(role))
    }
}

// ============================================================================
// Version control
// ============================================================================

#[derive(Debug)]
struct VcsInner {
    revisions: Vec<String>,
    branch: String,
    local_changes: bool,
    modified: Vec<String>,
    gitignore: Vec<String>,
    calls: Vec<String>,
    fail_reset: bool,
}

/// In-memory version control with a linear revision log `rev-0`, `rev-1`, ...
///
/// `reset_hard` truncates the log back to the target revision.
#[derive(Debug)]
pub struct MockVcs {
    inner: Mutex<VcsInner>,
}

impl Default for MockVcs {
    fn default() -> Self {
        Self {
            inner: Mutex::new(VcsInner {
                revisions: vec!["rev-0".to_string()],
                branch: "main".to_string(),
                local_changes: false,
                modified: Vec::new(),
                gitignore: Vec::new(),
                calls: Vec::new(),
                fail_reset: false,
            }),
        }
    }
}

impl MockVcs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_branch(self, branch: &str) -> Self {
        self.with_inner(|i| i.branch = branch.to_string())
    }

    /// Pretend the worktree has uncommitted changes at startup.
    #[must_use]
    pub fn with_local_changes(self) -> Self {
        self.with_inner(|i| i.local_changes = true)
    }

    #[must_use]
    pub fn with_modified_files(self, files: &[&str]) -> Self {
        self.with_inner(|i| i.modified = files.iter().map(|f| (*f).to_string()).collect())
    }

    /// Make every `reset_hard` fail.
    #[must_use]
    pub fn with_failing_reset(self) -> Self {
        self.with_inner(|i| i.fail_reset = true)
    }

    fn with_inner(self, f: impl FnOnce(&mut VcsInner)) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            f(&mut inner);
        }
        self
    }

    fn inner(&self) -> Result<std::sync::MutexGuard<'_, VcsInner>> {
        self.inner
            .lock()
            .map_err(|_| LoopError::vcs("lock", "mock state poisoned"))
    }

    /// Replace the set of modified files.
    pub fn set_modified_files(&self, files: &[&str]) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.modified = files.iter().map(|f| (*f).to_string()).collect();
        }
    }

    /// Calls made so far, e.g. `"reset_hard rev-1"`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().map(|i| i.calls.clone()).unwrap_or_default()
    }

    /// Number of commits on top of `rev-0`.
    pub fn commit_count(&self) -> usize {
        self.inner
            .lock()
            .map(|i| i.revisions.len().saturating_sub(1))
            .unwrap_or(0)
    }

    pub fn gitignore(&self) -> Vec<String> {
        self.inner.lock().map(|i| i.gitignore.clone()).unwrap_or_default()
    }
}

impl VersionControl for MockVcs {
    fn current_revision(&self) -> Result<String> {
        let inner = self.inner()?;
        inner
            .revisions
            .last()
            .cloned()
            .ok_or_else(|| LoopError::vcs("rev-parse", "empty history"))
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self.inner()?.branch.clone())
    }

    fn create_branch(&self, name: &str) -> Result<()> {
        let mut inner = self.inner()?;
        inner.calls.push(format!("create_branch {name}"));
        inner.branch = name.to_string();
        Ok(())
    }

    fn stash_local_changes(&self) -> Result<bool> {
        let mut inner = self.inner()?;
        inner.calls.push("stash".to_string());
        Ok(std::mem::take(&mut inner.local_changes))
    }

    fn commit_safe(
        &self,
        message: &str,
        _safe_dirs: &[String],
        sensitive: &GlobSet,
    ) -> Result<Option<String>> {
        let mut inner = self.inner()?;
        inner.calls.push(format!("commit {message}"));
        inner.modified.retain(|f| !sensitive.is_match(f));
        if inner.modified.is_empty() {
            return Ok(None);
        }
        inner.modified.clear();
        let rev = format!("rev-{}", inner.revisions.len());
        inner.revisions.push(rev.clone());
        Ok(Some(rev))
    }

    fn reset_hard(&self, revision: &str) -> Result<()> {
        let mut inner = self.inner()?;
        inner.calls.push(format!("reset_hard {revision}"));
        if inner.fail_reset {
            return Err(LoopError::vcs("reset", "simulated failure"));
        }
        let Some(pos) = inner.revisions.iter().position(|r| r == revision) else {
            return Err(LoopError::vcs("reset", format!("unknown revision {revision}")));
        };
        inner.revisions.truncate(pos + 1);
        inner.modified.clear();
        Ok(())
    }

    fn clean_untracked(&self) -> Result<()> {
        self.inner()?.calls.push("clean".to_string());
        Ok(())
    }

    fn ensure_gitignore(&self, patterns: &[&str]) -> Result<bool> {
        let mut inner = self.inner()?;
        inner.calls.push("gitignore".to_string());
        let mut changed = false;
        for pattern in patterns {
            if !inner.gitignore.iter().any(|p| p == pattern) {
                inner.gitignore.push((*pattern).to_string());
                changed = true;
            }
        }
        Ok(changed)
    }

    fn modified_files(&self) -> Result<Vec<String>> {
        Ok(self.inner()?.modified.clone())
    }
}

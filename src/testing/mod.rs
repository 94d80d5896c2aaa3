//! Test doubles for the loop's external collaborators.
//!
//! - [`MockAgent`]: scripted agent responses and tool calls
//! - [`MockVcs`]: in-memory revision log that records every call
//!
//! # Example
//!
//! ```rust,ignore
//! use valueloop::testing::{MockAgent, MockVcs};
//!
//! let vcs = MockVcs::new().with_modified_files(&["src/lib.rs"]);
//! let agent = MockAgent::new().with_response(AgentResponse::text("ok"));
//! ```

pub mod mocks;

pub use mocks::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentCapability, AgentResponse, AgentRole};
    use crate::vcs::{sensitive_set, VersionControl};
    use std::time::Duration;

    #[tokio::test]
    async fn test_mock_agent_role_queue_before_shared() {
        let agent = MockAgent::new()
            .with_response(AgentResponse::text("shared"))
            .with_role_response(AgentRole::Fixer, AgentResponse::text("fixer"));

        let a = agent.invoke(AgentRole::Planner, "", "p1").await.unwrap();
        let b = agent.invoke(AgentRole::Fixer, "", "p2").await.unwrap();
        let c = agent.invoke(AgentRole::Fixer, "", "p3").await.unwrap();

        assert_eq!(a.text, "shared");
        assert_eq!(b.text, "fixer");
        assert!(c.text.is_empty());
        assert_eq!(agent.roles(), vec![AgentRole::Planner, AgentRole::Fixer, AgentRole::Fixer]);
    }

    #[tokio::test]
    async fn test_mock_agent_failure_and_delay() {
        let agent = MockAgent::new()
            .with_failure("offline")
            .with_delay(Duration::from_millis(5));
        assert!(agent.invoke(AgentRole::Executor, "", "x").await.is_err());
        assert_eq!(agent.call_count(), 1);
    }

    #[test]
    fn test_mock_vcs_commit_and_reset() {
        let vcs = MockVcs::new().with_modified_files(&["src/a.rs", ".env"]);
        let sensitive = sensitive_set(&["**/.env".to_string(), ".env".to_string()]).unwrap();

        assert_eq!(vcs.commit_safe("one", &[], &sensitive).unwrap(), Some("rev-1".into()));
        assert_eq!(vcs.commit_safe("empty", &[], &sensitive).unwrap(), None);
        vcs.set_modified_files(&["src/b.rs"]);
        assert_eq!(vcs.commit_safe("two", &[], &sensitive).unwrap(), Some("rev-2".into()));

        vcs.reset_hard("rev-1").unwrap();
        assert_eq!(vcs.current_revision().unwrap(), "rev-1");
        assert_eq!(vcs.commit_count(), 1);
        assert!(vcs.reset_hard("rev-9").is_err());
        assert!(vcs.calls().contains(&"reset_hard rev-1".to_string()));
    }

    #[test]
    fn test_mock_vcs_stash_once() {
        let vcs = MockVcs::new().with_local_changes();
        assert!(vcs.stash_local_changes().unwrap());
        assert!(!vcs.stash_local_changes().unwrap());
    }
}

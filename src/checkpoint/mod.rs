//! Checkpoints and rollback.
//!
//! A checkpoint pairs a workspace revision with the good subset of state
//! (done items, passed checks, latest value score). Rolling back to one is
//! a write-ahead-logged operation; see [`rollback`].
//!
//! ```text
//! create_checkpoint ──> Checkpoint { revision, done_items, passed_checks }
//!                               │
//! RollbackManager::rollback ────┘──> WAL ──> reset ──> revert ──> persist ──> clear WAL
//! ```

pub mod rollback;

pub use rollback::{RollbackLog, RollbackManager, RollbackStep, WAL_FILE};

use chrono::Utc;
use tracing::info;

use crate::dispatch::{StateScope, ToolDispatcher};
use crate::error::Result;
use crate::state::{Checkpoint, LoopState};
use crate::vcs::VersionControl;

/// Record a checkpoint at the current workspace revision.
///
/// # Errors
///
/// Returns an error if the revision cannot be read.
pub fn create_checkpoint(
    state: &mut LoopState,
    vcs: &dyn VersionControl,
    label: &str,
) -> Result<Checkpoint> {
    let revision = vcs.current_revision()?;
    let checkpoint = Checkpoint {
        id: uuid::Uuid::new_v4().to_string(),
        label: label.to_string(),
        revision,
        created_at: Utc::now(),
        iteration: state.iteration,
        done_items: state.done_items(),
        passed_checks: state.passed_checks(),
        value_score: state.latest_snapshot().map_or(0.0, |s| s.score),
    };

    let recorded = checkpoint.clone();
    ToolDispatcher::transact(state, &[StateScope::Checkpoints], "create_checkpoint", move |s| {
        s.checkpoints.push(recorded);
        Ok(())
    })?;
    info!("Checkpoint {}", checkpoint.summary());
    Ok(checkpoint)
}

/// Most recent checkpoint carrying `label`.
pub fn find_checkpoint<'a>(state: &'a LoopState, label: &str) -> Option<&'a Checkpoint> {
    state.checkpoints.iter().rev().find(|c| c.label == label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CheckRecord, CheckStatus, ItemStatus, WorkItem};
    use crate::testing::MockVcs;

    #[test]
    fn test_create_checkpoint_records_good_subset() {
        let vcs = MockVcs::new();
        let mut state = LoopState::new("unit");
        state.iteration = 4;
        state.insert_item(WorkItem::new("A", "a").with_status(ItemStatus::Done));
        state.insert_item(WorkItem::new("B", "b"));
        state.insert_check(CheckRecord::new("c1", "unit").with_status(CheckStatus::Passed));
        state.insert_check(CheckRecord::new("c2", "unit").with_status(CheckStatus::Failed));

        let cp = create_checkpoint(&mut state, &vcs, "green-4").unwrap();
        assert_eq!(cp.revision, "rev-0");
        assert_eq!(cp.iteration, 4);
        assert_eq!(cp.done_items.iter().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(cp.passed_checks.iter().collect::<Vec<_>>(), vec!["c1"]);
        assert_eq!(state.checkpoints.len(), 1);
    }

    #[test]
    fn test_find_checkpoint_prefers_latest() {
        let vcs = MockVcs::new();
        let mut state = LoopState::new("unit");
        create_checkpoint(&mut state, &vcs, "ship").unwrap();
        state.iteration = 9;
        create_checkpoint(&mut state, &vcs, "ship").unwrap();
        assert_eq!(find_checkpoint(&state, "ship").map(|c| c.iteration), Some(9));
        assert!(find_checkpoint(&state, "nope").is_none());
    }
}

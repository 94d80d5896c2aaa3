//! Write-ahead-logged rollback.
//!
//! Rolling back touches two independently durable resources, the
//! workspace and the state file, so it is driven by a log record written
//! before anything else:
//!
//! 1. persist the log record
//! 2. reset the workspace to the checkpoint revision and clean untracked files
//! 3. revert done items not covered by the checkpoint to pending
//! 4. reset checks to the checkpoint's passing set, the rest to pending
//! 5. reset the no-progress counter
//! 6. record the rollback
//! 7. persist state
//! 8. delete the log record
//!
//! Every step is idempotent. On restart, [`RollbackManager::recover`]
//! replays a leftover log from step 2.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::{LoopError, Result};
use crate::state::{
    CheckStatus, Checkpoint, ItemStatus, LoopState, RollbackRecord, StateStore,
};
use crate::vcs::VersionControl;

use super::find_checkpoint;

/// Log file name, beside the state file.
pub const WAL_FILE: &str = "rollback.wal.json";

/// The intended transition, persisted before any step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackLog {
    pub id: String,
    pub reason: String,
    /// Revision the workspace was at when the rollback started.
    #[serde(default)]
    pub from_revision: Option<String>,
    pub started_at: DateTime<Utc>,
    pub checkpoint: Checkpoint,
}

/// Steps after which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStep {
    LogWritten,
    WorkspaceReset,
    ItemsReverted,
    ChecksReset,
    CountersReset,
    Recorded,
    StatePersisted,
}

impl fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LogWritten => "log_written",
            Self::WorkspaceReset => "workspace_reset",
            Self::ItemsReverted => "items_reverted",
            Self::ChecksReset => "checks_reset",
            Self::CountersReset => "counters_reset",
            Self::Recorded => "recorded",
            Self::StatePersisted => "state_persisted",
        };
        f.write_str(s)
    }
}

/// Performs and recovers rollbacks.
pub struct RollbackManager<'a> {
    store: &'a StateStore,
    vcs: &'a dyn VersionControl,
    crash_after: Option<RollbackStep>,
}

impl<'a> RollbackManager<'a> {
    #[must_use]
    pub fn new(store: &'a StateStore, vcs: &'a dyn VersionControl) -> Self {
        Self {
            store,
            vcs,
            crash_after: None,
        }
    }

    /// Abort with an error right after `step`, leaving the log in place.
    #[must_use]
    pub fn with_crash_after(mut self, step: RollbackStep) -> Self {
        self.crash_after = Some(step);
        self
    }

    /// Path of the log record.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.store.path().with_file_name(WAL_FILE)
    }

    /// Whether an unfinished rollback is on disk.
    #[must_use]
    pub fn pending(&self) -> bool {
        self.wal_path().exists()
    }

    /// Roll back to the latest checkpoint labelled `label`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::CheckpointNotFound`] for an unknown label, or
    /// [`LoopError::Rollback`] naming the step that failed. The log record
    /// is left in place on failure so [`recover`](Self::recover) can finish.
    pub fn rollback(
        &self,
        state: &mut LoopState,
        label: &str,
        reason: &str,
    ) -> Result<RollbackRecord> {
        let checkpoint = find_checkpoint(state, label)
            .cloned()
            .ok_or_else(|| LoopError::CheckpointNotFound {
                label: label.to_string(),
            })?;

        if self.pending() {
            warn!("Replacing an unfinished rollback log at {}", self.wal_path().display());
        }

        let log = RollbackLog {
            id: uuid::Uuid::new_v4().to_string(),
            reason: reason.to_string(),
            from_revision: self.vcs.current_revision().ok(),
            started_at: Utc::now(),
            checkpoint,
        };
        self.write_log(&log)?;
        info!(
            "Rolling back to '{}' ({}): {}",
            log.checkpoint.label, log.checkpoint.revision, reason
        );
        self.crash_point(RollbackStep::LogWritten)?;

        self.replay(state, &log)
    }

    /// Finish a rollback left behind by a crash.
    ///
    /// Returns the completed record, or `None` when there was nothing to do.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::CorruptState`] for an unreadable log record, or
    /// [`LoopError::Rollback`] if a replayed step fails.
    pub fn recover(&self, state: &mut LoopState) -> Result<Option<RollbackRecord>> {
        let path = self.wal_path();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let log: RollbackLog =
            serde_json::from_str(&content).map_err(|e| LoopError::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        warn!(
            "Found unfinished rollback to '{}' from {}; replaying",
            log.checkpoint.label, log.started_at
        );
        self.replay(state, &log).map(Some)
    }

    fn replay(&self, state: &mut LoopState, log: &RollbackLog) -> Result<RollbackRecord> {
        let checkpoint = &log.checkpoint;

        self.vcs
            .reset_hard(&checkpoint.revision)
            .and_then(|()| self.vcs.clean_untracked())
            .map_err(|e| LoopError::rollback(RollbackStep::WorkspaceReset.to_string(), e.to_string()))?;
        debug!("Workspace reset to {}", checkpoint.revision);
        self.crash_point(RollbackStep::WorkspaceReset)?;

        let mut reverted_items = Vec::new();
        for item in state.work_items.values_mut() {
            if item.status == ItemStatus::Done && !checkpoint.done_items.contains(&item.id) {
                item.revert_to_pending();
                reverted_items.push(item.id.clone());
            }
        }
        debug!("Reverted {} item(s) to pending", reverted_items.len());
        self.crash_point(RollbackStep::ItemsReverted)?;

        let mut reset_checks = Vec::new();
        for check in state.checks.values_mut() {
            let target = if checkpoint.passed_checks.contains(&check.id) {
                CheckStatus::Passed
            } else {
                CheckStatus::Pending
            };
            if check.status != target {
                check.status = target;
                reset_checks.push(check.id.clone());
            }
        }
        debug!("Reset {} check(s)", reset_checks.len());
        self.crash_point(RollbackStep::ChecksReset)?;

        state.no_progress_count = 0;
        state.pending_rollback = None;
        state.vcs.last_commit = Some(checkpoint.revision.clone());
        self.crash_point(RollbackStep::CountersReset)?;

        let record = match state.rollbacks.iter().find(|r| r.log_id == log.id) {
            Some(existing) => existing.clone(),
            None => {
                let record = RollbackRecord {
                    log_id: log.id.clone(),
                    label: checkpoint.label.clone(),
                    revision: checkpoint.revision.clone(),
                    reason: log.reason.clone(),
                    at: log.started_at,
                    reverted_items,
                    reset_checks,
                };
                state.rollbacks.push(record.clone());
                record
            }
        };
        self.crash_point(RollbackStep::Recorded)?;

        self.store
            .save(state)
            .map_err(|e| LoopError::rollback(RollbackStep::StatePersisted.to_string(), e.to_string()))?;
        self.crash_point(RollbackStep::StatePersisted)?;

        fs::remove_file(self.wal_path())
            .map_err(|e| LoopError::rollback("clear_log", e.to_string()))?;
        info!(
            "Rollback to '{}' complete: {} item(s) reverted, {} check(s) reset",
            record.label,
            record.reverted_items.len(),
            record.reset_checks.len()
        );
        Ok(record)
    }

    fn write_log(&self, log: &RollbackLog) -> Result<()> {
        let path = self.wal_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(log)?.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn crash_point(&self, step: RollbackStep) -> Result<()> {
        if self.crash_after == Some(step) {
            return Err(LoopError::rollback(step.to_string(), "simulated crash"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::create_checkpoint;
    use crate::state::{CheckRecord, WorkItem};
    use crate::testing::MockVcs;
    use tempfile::TempDir;

    /// 3 done / 2 passed at checkpoint, 5 done / 4 passed now.
    fn scenario(vcs: &MockVcs) -> LoopState {
        let mut state = LoopState::new("unit");
        for id in ["A", "B", "C", "D", "E"] {
            state.insert_item(WorkItem::new(id, format!("item {id}")));
        }
        for id in ["c1", "c2", "c3", "c4"] {
            state.insert_check(CheckRecord::new(id, "unit").with_command("true"));
        }
        for id in ["A", "B", "C"] {
            state.work_items.get_mut(id).unwrap().status = ItemStatus::Done;
        }
        for id in ["c1", "c2"] {
            state.checks.get_mut(id).unwrap().status = CheckStatus::Passed;
        }
        create_checkpoint(&mut state, vcs, "base").unwrap();

        vcs.set_modified_files(&["src/d.rs"]);
        let sensitive = globset::GlobSet::empty();
        vcs.commit_safe("more work", &[], &sensitive).unwrap();
        for id in ["D", "E"] {
            let item = state.work_items.get_mut(id).unwrap();
            item.status = ItemStatus::Done;
            item.files_touched.insert("src/d.rs".into());
            item.completed_iteration = Some(7);
        }
        for id in ["c3", "c4"] {
            state.checks.get_mut(id).unwrap().status = CheckStatus::Passed;
        }
        state.no_progress_count = 2;
        state
    }

    fn store(dir: &TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.json"))
    }

    #[test]
    fn test_rollback_reverts_exactly_the_extras() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let vcs = MockVcs::new();
        let mut state = scenario(&vcs);

        let record = RollbackManager::new(&store, &vcs)
            .rollback(&mut state, "base", "regression")
            .unwrap();

        assert_eq!(record.reverted_items, vec!["D", "E"]);
        assert_eq!(record.reset_checks, vec!["c3", "c4"]);
        assert_eq!(state.done_items().len(), 3);
        assert_eq!(state.passed_checks().len(), 2);
        let d = &state.work_items["D"];
        assert_eq!(d.status, ItemStatus::Pending);
        assert!(d.files_touched.is_empty());
        assert!(d.completed_iteration.is_none());
        assert_eq!(state.no_progress_count, 0);
        assert_eq!(vcs.current_revision().unwrap(), "rev-0");
        assert!(vcs.calls().contains(&"clean".to_string()));
        assert!(!RollbackManager::new(&store, &vcs).pending());
        assert_eq!(store.load().unwrap().unwrap(), state);
    }

    #[test]
    fn test_unknown_label() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let vcs = MockVcs::new();
        let mut state = LoopState::new("unit");
        let err = RollbackManager::new(&store, &vcs)
            .rollback(&mut state, "missing", "x")
            .unwrap_err();
        assert!(matches!(err, LoopError::CheckpointNotFound { .. }));
    }

    #[test]
    fn test_crash_before_log_cleared_then_recover_matches() {
        // Uninterrupted run.
        let dir_a = TempDir::new().unwrap();
        let store_a = store(&dir_a);
        let vcs_a = MockVcs::new();
        let mut clean = scenario(&vcs_a);
        RollbackManager::new(&store_a, &vcs_a)
            .rollback(&mut clean, "base", "regression")
            .unwrap();

        // Crash after persisting, before the log is removed.
        let dir_b = TempDir::new().unwrap();
        let store_b = store(&dir_b);
        let vcs_b = MockVcs::new();
        let mut crashed = scenario(&vcs_b);
        let err = RollbackManager::new(&store_b, &vcs_b)
            .with_crash_after(RollbackStep::StatePersisted)
            .rollback(&mut crashed, "base", "regression")
            .unwrap_err();
        assert!(matches!(err, LoopError::Rollback { .. }));

        let manager = RollbackManager::new(&store_b, &vcs_b);
        assert!(manager.pending());
        let mut restarted = store_b.load().unwrap().unwrap();
        let record = manager.recover(&mut restarted).unwrap().unwrap();
        assert!(!manager.pending());
        assert_eq!(restarted.rollbacks.len(), 1);
        assert_eq!(record.reverted_items, vec!["D", "E"]);

        assert_eq!(restarted.work_items, clean.work_items);
        assert_eq!(restarted.checks, clean.checks);
        assert_eq!(restarted.no_progress_count, clean.no_progress_count);
        assert_eq!(restarted.rollbacks[0].reverted_items, clean.rollbacks[0].reverted_items);
    }

    #[test]
    fn test_crash_mid_state_then_recover_from_disk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let vcs = MockVcs::new();
        let mut state = scenario(&vcs);
        store.save(&state).unwrap();

        RollbackManager::new(&store, &vcs)
            .with_crash_after(RollbackStep::ItemsReverted)
            .rollback(&mut state, "base", "regression")
            .unwrap_err();

        // In-memory changes are lost with the process.
        let mut restarted = store.load().unwrap().unwrap();
        assert_eq!(restarted.done_items().len(), 5);

        let manager = RollbackManager::new(&store, &vcs);
        manager.recover(&mut restarted).unwrap();
        assert_eq!(restarted.done_items().len(), 3);
        assert_eq!(restarted.passed_checks().len(), 2);
        assert!(!manager.pending());
        assert!(manager.recover(&mut restarted).unwrap().is_none());
    }

    #[test]
    fn test_failed_reset_keeps_log() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let vcs = MockVcs::new();
        let mut state = scenario(&vcs);
        let failing = MockVcs::new().with_failing_reset();

        let err = RollbackManager::new(&store, &failing)
            .rollback(&mut state, "base", "regression")
            .unwrap_err();
        assert!(err.to_string().contains("workspace_reset"));
        assert!(RollbackManager::new(&store, &vcs).pending());
        assert_eq!(state.done_items().len(), 5);
    }
}

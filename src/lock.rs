//! Whole-process mutual exclusion for one unit of work.
//!
//! The lock file holds the owner's pid and is additionally held with an
//! OS advisory lock. A lock file whose pid is no longer alive is stale and
//! is taken over.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{LoopError, Result};

/// Lock file name inside the state directory.
pub const LOCK_FILE: &str = "loop.lock";

/// Held process lock. Released on drop.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    file: File,
}

impl ProcessLock {
    /// Acquire the lock in `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::LockHeld`] if a live process owns the lock.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let recorded = read_pid(&mut file);

        if FileExt::try_lock_exclusive(&file).is_err() {
            return Err(LoopError::LockHeld {
                pid: recorded.unwrap_or(0),
            });
        }

        let own = std::process::id();
        match recorded {
            Some(pid) if pid != own && pid_alive(pid) => {
                let _ = FileExt::unlock(&file);
                return Err(LoopError::LockHeld { pid });
            }
            Some(pid) if pid != own => {
                warn!("Recovered stale lock from pid {}", pid);
            }
            _ => {}
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{own}")?;
        file.sync_all()?;
        debug!("Acquired loop lock {}", path.display());

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

/// Whether a process with `pid` is currently running.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if proc_root.is_dir() {
        return proc_root.join(pid.to_string()).exists();
    }
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Whether a process with `pid` is currently running.
#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // No cheap probe; the advisory lock alone decides.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_pid_and_releases() {
        let dir = TempDir::new().unwrap();
        let path = {
            let lock = ProcessLock::acquire(dir.path()).unwrap();
            let content = std::fs::read_to_string(lock.path()).unwrap();
            assert_eq!(content, std::process::id().to_string());
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = TempDir::new().unwrap();
        let _held = ProcessLock::acquire(dir.path()).unwrap();
        match ProcessLock::acquire(dir.path()) {
            Err(LoopError::LockHeld { pid }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stale_lock_is_recovered() {
        let dir = TempDir::new().unwrap();
        // Pid far above the default pid_max.
        std::fs::write(dir.path().join(LOCK_FILE), "99999999").unwrap();
        let lock = ProcessLock::acquire(dir.path()).unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_live_foreign_pid_is_respected() {
        let dir = TempDir::new().unwrap();
        // pid 1 is always alive and never us.
        std::fs::write(dir.path().join(LOCK_FILE), "1").unwrap();
        assert!(matches!(
            ProcessLock::acquire(dir.path()),
            Err(LoopError::LockHeld { pid: 1 })
        ));
    }

    #[test]
    fn test_released_lock_can_be_reacquired() {
        let dir = TempDir::new().unwrap();
        drop(ProcessLock::acquire(dir.path()).unwrap());
        assert!(ProcessLock::acquire(dir.path()).is_ok());
    }
}

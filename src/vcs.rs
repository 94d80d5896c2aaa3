//! Version-control command surface.
//!
//! A narrow set of git operations: branch, stash, allowlisted commit, hard
//! reset and untracked cleanup. New files are only ever staged from the
//! safe-directory allowlist, and staged paths matching a sensitive pattern
//! are unstaged before commit.

use anyhow::{bail, Context};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config::STATE_DIR;
use crate::error::{IntoLoopError, LoopError, Result};

/// Operations the loop needs from version control.
pub trait VersionControl: Send + Sync {
    /// Current HEAD revision.
    fn current_revision(&self) -> Result<String>;

    /// Current branch name.
    fn current_branch(&self) -> Result<String>;

    /// Switch to `name`, creating it from HEAD when it does not exist.
    fn create_branch(&self, name: &str) -> Result<()>;

    /// Stash pre-existing local changes. Returns `true` if anything was stashed.
    fn stash_local_changes(&self) -> Result<bool>;

    /// Stage and commit. Returns the new revision, or `None` when nothing
    /// was staged.
    fn commit_safe(
        &self,
        message: &str,
        safe_dirs: &[String],
        sensitive: &GlobSet,
    ) -> Result<Option<String>>;

    /// Reset the workspace to `revision`, discarding tracked changes.
    fn reset_hard(&self, revision: &str) -> Result<()>;

    /// Remove untracked files (ignored files are kept).
    fn clean_untracked(&self) -> Result<()>;

    /// Append missing patterns to `.gitignore`. Returns `true` if it changed.
    fn ensure_gitignore(&self, patterns: &[&str]) -> Result<bool>;

    /// Paths with uncommitted changes.
    fn modified_files(&self) -> Result<Vec<String>>;
}

/// Compile sensitive-path patterns.
///
/// # Errors
///
/// Returns [`LoopError::InvalidConfig`] naming the bad pattern.
pub fn sensitive_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            LoopError::invalid_config("sensitive_patterns", format!("{pattern}: {e}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| LoopError::invalid_config("sensitive_patterns", e.to_string()))
}

/// Whether `path` lies inside one of the safe directories.
pub fn in_safe_dir(path: &str, safe_dirs: &[String]) -> bool {
    safe_dirs.iter().any(|dir| {
        let dir = dir.trim_end_matches('/');
        path == dir || path.starts_with(&format!("{dir}/"))
    })
}

/// Add missing lines to the `.gitignore` in `project_dir`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or written.
pub fn ensure_gitignore_file(project_dir: &Path, patterns: &[&str]) -> Result<bool> {
    let path = project_dir.join(".gitignore");
    let existing = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let present: std::collections::HashSet<&str> = existing.lines().map(str::trim).collect();
    let missing: Vec<&str> = patterns
        .iter()
        .copied()
        .filter(|p| !present.contains(p))
        .collect();

    if missing.is_empty() {
        return Ok(false);
    }

    let mut content = existing.clone();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str("# valueloop\n");
    for pattern in &missing {
        content.push_str(pattern);
        content.push('\n');
    }
    std::fs::write(&path, content)?;
    debug!("Added {} patterns to .gitignore", missing.len());
    Ok(true)
}

/// [`VersionControl`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    project_dir: PathBuf,
}

impl GitWorkspace {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    fn git(&self, args: &[&str]) -> anyhow::Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.project_dir)
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn lines(&self, args: &[&str]) -> anyhow::Result<Vec<String>> {
        Ok(self
            .git(args)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

impl VersionControl for GitWorkspace {
    fn current_revision(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"]).into_loop_vcs("rev-parse")
    }

    fn current_branch(&self) -> Result<String> {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .into_loop_vcs("current-branch")
    }

    fn create_branch(&self, name: &str) -> Result<()> {
        let exists = self
            .git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{name}")])
            .is_ok();
        if exists {
            self.git(&["checkout", name]).into_loop_vcs("checkout")?;
        } else {
            self.git(&["checkout", "-b", name]).into_loop_vcs("checkout -b")?;
            info!("Created branch {}", name);
        }
        Ok(())
    }

    fn stash_local_changes(&self) -> Result<bool> {
        let dirty = !self
            .lines(&["status", "--porcelain"])
            .into_loop_vcs("status")?
            .is_empty();
        if !dirty {
            return Ok(false);
        }
        self.git(&["stash", "push", "--include-untracked", "-m", "valueloop: pre-run changes"])
            .into_loop_vcs("stash")?;
        info!("Stashed pre-existing local changes");
        Ok(true)
    }

    fn commit_safe(
        &self,
        message: &str,
        safe_dirs: &[String],
        sensitive: &GlobSet,
    ) -> Result<Option<String>> {
        // Tracked modifications and deletions.
        self.git(&["add", "-u"]).into_loop_vcs("add -u")?;

        let untracked = self
            .lines(&["ls-files", "--others", "--exclude-standard"])
            .into_loop_vcs("ls-files")?;
        let safe: Vec<&str> = untracked
            .iter()
            .map(String::as_str)
            .filter(|p| in_safe_dir(p, safe_dirs))
            .collect();
        if !safe.is_empty() {
            let mut args = vec!["add", "--"];
            args.extend(safe.iter().copied());
            self.git(&args).into_loop_vcs("add")?;
        }

        let staged = self
            .lines(&["diff", "--cached", "--name-only"])
            .into_loop_vcs("diff --cached")?;
        for path in staged.iter().filter(|p| sensitive.is_match(p.as_str())) {
            warn!("Unstaging sensitive path {}", path);
            self.git(&["reset", "-q", "--", path])
                .into_loop_vcs("reset")?;
        }

        let remaining = self
            .lines(&["diff", "--cached", "--name-only"])
            .into_loop_vcs("diff --cached")?;
        if remaining.is_empty() {
            debug!("Nothing to commit");
            return Ok(None);
        }

        self.git(&["commit", "-q", "-m", message])
            .into_loop_vcs("commit")?;
        self.current_revision().map(Some)
    }

    fn reset_hard(&self, revision: &str) -> Result<()> {
        self.git(&["reset", "--hard", "-q", revision])
            .into_loop_vcs("reset --hard")?;
        Ok(())
    }

    fn clean_untracked(&self) -> Result<()> {
        let exclude = format!("{STATE_DIR}/");
        self.git(&["clean", "-fdq", "-e", &exclude])
            .into_loop_vcs("clean")?;
        Ok(())
    }

    fn ensure_gitignore(&self, patterns: &[&str]) -> Result<bool> {
        ensure_gitignore_file(&self.project_dir, patterns)
    }

    fn modified_files(&self) -> Result<Vec<String>> {
        let lines = self
            .lines(&["status", "--porcelain"])
            .into_loop_vcs("status")?;
        Ok(lines
            .iter()
            .filter_map(|l| l.get(3..))
            .map(|p| p.rsplit(" -> ").next().unwrap_or(p).to_string())
            .filter(|p| !p.starts_with(STATE_DIR))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_safe_dirs, default_sensitive_patterns, GITIGNORE_PATTERNS};
    use tempfile::TempDir;

    fn git_available() -> bool {
        which::which("git").is_ok()
    }

    fn init_repo(dir: &Path) -> GitWorkspace {
        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .unwrap();
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "loop@example.com"]);
        run(&["config", "user.name", "Loop"]);
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        run(&["add", "README.md"]);
        run(&["commit", "-q", "-m", "init"]);
        GitWorkspace::new(dir)
    }

    #[test]
    fn test_in_safe_dir() {
        let dirs = vec!["src".to_string(), "tests/".to_string()];
        assert!(in_safe_dir("src/main.rs", &dirs));
        assert!(in_safe_dir("tests/a/b.rs", &dirs));
        assert!(!in_safe_dir("srcx/main.rs", &dirs));
        assert!(!in_safe_dir(".env", &dirs));
    }

    #[test]
    fn test_sensitive_set_matches() {
        let set = sensitive_set(&default_sensitive_patterns()).unwrap();
        assert!(set.is_match(".env"));
        assert!(set.is_match("src/config/.env.local"));
        assert!(set.is_match("keys/server.pem"));
        assert!(!set.is_match("src/main.rs"));
    }

    #[test]
    fn test_invalid_sensitive_pattern() {
        assert!(sensitive_set(&["[".to_string()]).is_err());
    }

    #[test]
    fn test_ensure_gitignore_appends_once() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "target/").unwrap();

        assert!(ensure_gitignore_file(dir.path(), GITIGNORE_PATTERNS).unwrap());
        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content.matches("target/").count(), 1);
        assert!(content.contains(".env\n"));

        assert!(!ensure_gitignore_file(dir.path(), GITIGNORE_PATTERNS).unwrap());
    }

    #[test]
    fn test_commit_safe_respects_allowlist() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let git = init_repo(dir.path());
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        std::fs::write(dir.path().join("src/.env"), "SECRET=1\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "scratch\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "changed\n").unwrap();

        let sensitive = sensitive_set(&default_sensitive_patterns()).unwrap();
        let rev = git
            .commit_safe("work", &default_safe_dirs(), &sensitive)
            .unwrap();
        assert!(rev.is_some());

        let committed = git
            .git(&["show", "--name-only", "--format=", "HEAD"])
            .unwrap();
        assert!(committed.contains("src/lib.rs"));
        assert!(committed.contains("README.md"));
        assert!(!committed.contains(".env"));
        assert!(!committed.contains("notes.txt"));
    }

    #[test]
    fn test_reset_and_clean() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let git = init_repo(dir.path());
        let base = git.current_revision().unwrap();

        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/new.rs"), "x").unwrap();
        let sensitive = sensitive_set(&[]).unwrap();
        git.commit_safe("add", &default_safe_dirs(), &sensitive)
            .unwrap();
        std::fs::write(dir.path().join("stray.txt"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        std::fs::write(dir.path().join(STATE_DIR).join("state.json"), "{}").unwrap();

        git.reset_hard(&base).unwrap();
        git.clean_untracked().unwrap();

        assert_eq!(git.current_revision().unwrap(), base);
        assert!(!dir.path().join("src/new.rs").exists());
        assert!(!dir.path().join("stray.txt").exists());
        assert!(dir.path().join(STATE_DIR).join("state.json").exists());
    }
}

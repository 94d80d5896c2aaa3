//! Execution runner.
//!
//! Runs batches of independent verification units concurrently with a
//! bounded worker pool. Each unit runs under its own timeout; a timeout is
//! reported as a failed result with output [`TIMEOUT_SENTINEL`] rather than
//! holding up the batch.

use async_trait::async_trait;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::state::{CheckRecord, CheckStatus, LoopState};

/// Output recorded for a unit that exceeded its timeout.
pub const TIMEOUT_SENTINEL: &str = "TIMEOUT";

/// Captured output is truncated to this many bytes.
pub const MAX_OUTPUT_BYTES: usize = 8 * 1024;

/// What a unit produced when it ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

impl UnitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// One independent verification unit.
#[async_trait]
pub trait VerificationUnit: Send + Sync {
    fn id(&self) -> &str;

    fn timeout(&self) -> Duration;

    /// Run to completion. Must be cancel-safe.
    async fn run(&self) -> anyhow::Result<UnitOutput>;
}

/// Result of one unit in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitResult {
    pub id: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// A shell command run through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellCheck {
    id: String,
    command: String,
    cwd: PathBuf,
    timeout: Duration,
}

impl ShellCheck {
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        cwd: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            cwd: cwd.into(),
            timeout,
        }
    }
}

#[async_trait]
impl VerificationUnit for ShellCheck {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self) -> anyhow::Result<UnitOutput> {
        let output = AsyncCommand::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.cwd)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        Ok(UnitOutput {
            exit_code: output.status.code(),
            output: truncate_output(text),
        })
    }
}

/// Keep the tail of long output; failures usually print last.
fn truncate_output(text: String) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text;
    }
    let mut start = text.len() - MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...[truncated]\n{}", &text[start..])
}

/// Worker count: twice the available parallelism, capped, at least one.
pub fn worker_count(max_workers: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 2).min(max_workers).max(1)
}

/// Run `units` concurrently with at most `workers` in flight.
///
/// Results are returned in input order. A unit waiting for a worker slot
/// does not consume its timeout.
pub async fn run_batch(units: Vec<Arc<dyn VerificationUnit>>, workers: usize) -> Vec<UnitResult> {
    if units.is_empty() {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    debug!("Running {} units on {} workers", units.len(), workers);

    let handles: Vec<_> = units
        .iter()
        .map(|unit| {
            let unit = Arc::clone(unit);
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run_with_timeout(unit.as_ref()).await
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .zip(units.iter())
        .map(|(joined, unit)| {
            joined.unwrap_or_else(|e| UnitResult {
                id: unit.id().to_string(),
                passed: false,
                exit_code: None,
                output: format!("worker panicked: {e}"),
                timed_out: false,
                duration_ms: 0,
            })
        })
        .collect()
}

async fn run_with_timeout(unit: &dyn VerificationUnit) -> UnitResult {
    let start = Instant::now();
    let limit = unit.timeout();
    let result = tokio::time::timeout(limit, unit.run()).await;
    let duration_ms = start.elapsed().as_millis() as u64;
    let id = unit.id().to_string();

    match result {
        Ok(Ok(out)) => UnitResult {
            id,
            passed: out.success(),
            exit_code: out.exit_code,
            output: out.output,
            timed_out: false,
            duration_ms,
        },
        Ok(Err(e)) => UnitResult {
            id,
            passed: false,
            exit_code: None,
            output: format!("failed to run: {e:#}"),
            timed_out: false,
            duration_ms,
        },
        Err(_elapsed) => {
            warn!("{} timed out after {}s", id, limit.as_secs());
            UnitResult {
                id,
                passed: false,
                exit_code: None,
                output: TIMEOUT_SENTINEL.to_string(),
                timed_out: true,
                duration_ms,
            }
        }
    }
}

/// A previously passing check that now fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regression {
    pub check_id: String,
    pub result: UnitResult,
}

/// Runs checks and health probes for one project.
#[derive(Debug, Clone)]
pub struct ExecutionRunner {
    project_dir: PathBuf,
    config: RunnerConfig,
}

impl ExecutionRunner {
    pub fn new(project_dir: impl Into<PathBuf>, config: RunnerConfig) -> Self {
        Self {
            project_dir: project_dir.into(),
            config,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn workers(&self) -> usize {
        worker_count(self.config.max_workers)
    }

    fn unit_for(&self, check: &CheckRecord) -> Arc<dyn VerificationUnit> {
        let secs = check.timeout_secs.unwrap_or(self.config.check_timeout_secs);
        Arc::new(ShellCheck::new(
            check.id.clone(),
            check.command.clone(),
            self.project_dir.clone(),
            Duration::from_secs(secs),
        ))
    }

    /// Run the given checks as one batch.
    pub async fn run_checks(&self, checks: &[&CheckRecord]) -> Vec<UnitResult> {
        let units = checks.iter().map(|c| self.unit_for(c)).collect();
        run_batch(units, self.workers()).await
    }

    /// Run one shell command (service health probe, pause verification).
    pub async fn probe(&self, id: &str, command: &str) -> UnitResult {
        let unit: Arc<dyn VerificationUnit> = Arc::new(ShellCheck::new(
            id,
            command,
            self.project_dir.clone(),
            Duration::from_secs(self.config.check_timeout_secs),
        ));
        let mut results = run_batch(vec![unit], 1).await;
        results.pop().unwrap_or_else(|| UnitResult {
            id: id.to_string(),
            passed: false,
            exit_code: None,
            output: "probe produced no result".to_string(),
            timed_out: false,
            duration_ms: 0,
        })
    }

    /// Re-run every currently passing check and report the ones that fail.
    pub async fn regression_sweep(&self, state: &LoopState) -> Vec<Regression> {
        let passed: Vec<&CheckRecord> = state
            .checks
            .values()
            .filter(|c| c.status == CheckStatus::Passed && !c.command.trim().is_empty())
            .collect();
        if passed.is_empty() {
            return Vec::new();
        }

        let regressions: Vec<Regression> = self
            .run_checks(&passed)
            .await
            .into_iter()
            .filter(|r| !r.passed)
            .map(|r| Regression {
                check_id: r.id.clone(),
                result: r,
            })
            .collect();

        if regressions.is_empty() {
            debug!("Regression sweep clean ({} checks)", passed.len());
        } else {
            info!(
                "Regression sweep: {} of {} checks newly failing",
                regressions.len(),
                passed.len()
            );
        }
        regressions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SleepUnit {
        id: String,
        sleep: Duration,
        timeout: Duration,
        exit_code: i32,
    }

    #[async_trait]
    impl VerificationUnit for SleepUnit {
        fn id(&self) -> &str {
            &self.id
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        async fn run(&self) -> anyhow::Result<UnitOutput> {
            tokio::time::sleep(self.sleep).await;
            Ok(UnitOutput {
                exit_code: Some(self.exit_code),
                output: format!("{} done", self.id),
            })
        }
    }

    fn unit(id: &str, sleep_ms: u64, timeout_ms: u64, exit_code: i32) -> Arc<dyn VerificationUnit> {
        Arc::new(SleepUnit {
            id: id.to_string(),
            sleep: Duration::from_millis(sleep_ms),
            timeout: Duration::from_millis(timeout_ms),
            exit_code,
        })
    }

    #[tokio::test]
    async fn test_batch_with_one_timeout() {
        let units = vec![
            unit("c1", 10, 1000, 0),
            unit("c2", 10, 1000, 1),
            unit("slow", 5_000, 100, 0),
            unit("c4", 20, 1000, 0),
            unit("c5", 5, 1000, 0),
        ];

        let start = Instant::now();
        let results = run_batch(units, 2).await;
        assert!(start.elapsed() < Duration::from_secs(3));

        assert_eq!(results.len(), 5);
        let timed_out: Vec<_> = results.iter().filter(|r| r.timed_out).collect();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].id, "slow");
        assert_eq!(timed_out[0].output, TIMEOUT_SENTINEL);
        assert!(!timed_out[0].passed);

        let real: Vec<_> = results.iter().filter(|r| !r.timed_out).collect();
        assert_eq!(real.len(), 4);
        assert!(real.iter().all(|r| r.output.ends_with("done")));
        assert_eq!(real.iter().filter(|r| r.passed).count(), 3);

        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "slow", "c4", "c5"]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        assert!(run_batch(Vec::new(), 4).await.is_empty());
    }

    #[test]
    fn test_worker_count_bounds() {
        assert_eq!(worker_count(1), 1);
        assert_eq!(worker_count(0), 1);
        assert!(worker_count(8) <= 8);
    }

    #[test]
    fn test_truncate_keeps_tail() {
        let text = format!("{}END", "x".repeat(MAX_OUTPUT_BYTES * 2));
        let out = truncate_output(text);
        assert!(out.starts_with("...[truncated]"));
        assert!(out.ends_with("END"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_check_captures_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = ExecutionRunner::new(dir.path(), RunnerConfig::default());
        let ok = runner.probe("ok", "echo fine").await;
        assert!(ok.passed);
        assert_eq!(ok.output.trim(), "fine");

        let bad = runner.probe("bad", "echo broken >&2; exit 3").await;
        assert!(!bad.passed);
        assert_eq!(bad.exit_code, Some(3));
        assert!(bad.output.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_regression_sweep_flags_newly_failing() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = ExecutionRunner::new(dir.path(), RunnerConfig::default());
        let mut state = LoopState::new("unit");
        state.insert_check(
            CheckRecord::new("still-ok", "unit")
                .with_command("true")
                .with_status(CheckStatus::Passed),
        );
        state.insert_check(
            CheckRecord::new("broke", "unit")
                .with_command("false")
                .with_status(CheckStatus::Passed),
        );
        state.insert_check(
            CheckRecord::new("never-ran", "unit")
                .with_command("false")
                .with_status(CheckStatus::Pending),
        );

        let regressions = runner.regression_sweep(&state).await;
        assert_eq!(regressions.len(), 1);
        assert_eq!(regressions[0].check_id, "broke");
    }
}

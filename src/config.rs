//! Configuration for the delivery loop.
//!
//! Loaded from `<project>/.valueloop/config.toml`. Every field has a
//! default, so a missing file or a partial file is fine.
//!
//! # Example config.toml
//!
//! ```toml
//! unit = "checkout-flow"
//! phases = ["mvp", "hardening"]
//!
//! [limits]
//! stall_threshold = 4
//!
//! [dispatch]
//! duplicate_similarity = 0.75
//!
//! [[services]]
//! name = "postgres"
//! health_command = "pg_isready -h localhost"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::agent::AgentRole;
use crate::error::{LoopError, Result};
use crate::state::StrategyKnobs;

/// Name of the per-project working directory.
pub const STATE_DIR: &str = ".valueloop";

/// Name of the configuration file inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Directories from which new (untracked) files may be staged.
pub fn default_safe_dirs() -> Vec<String> {
    ["src", "tests", "docs", "scripts", "migrations", "benches"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Paths that must never be committed.
pub fn default_sensitive_patterns() -> Vec<String> {
    [
        "**/.env",
        "**/.env.*",
        "**/*.pem",
        "**/*.key",
        "**/id_rsa*",
        "**/id_ed25519*",
        "**/*.p12",
        "**/credentials*.json",
        "**/secrets.*",
        ".valueloop/**",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Standard entries kept in the workspace `.gitignore`.
pub const GITIGNORE_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "id_rsa*",
    "*.p12",
    "credentials*.json",
    ".valueloop/",
    "target/",
    "node_modules/",
    "__pycache__/",
    ".DS_Store",
];

// ============================================================================
// Sections
// ============================================================================

/// Thresholds used by the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// No-progress iterations tolerated before course correction.
    pub stall_threshold: u32,
    /// Course corrections tolerated before pausing for a human.
    pub max_course_corrections: u32,
    /// Done items required before checks are generated.
    pub min_done_for_checks: usize,
    /// Run a critical evaluation every N iterations.
    pub critical_eval_interval: u32,
    /// Value score considered near-maximal.
    pub near_max_value: f64,
    /// Completion fraction that allows exit when no checks exist.
    pub min_completion_fraction: f64,
    /// Hard cap on loop iterations per run.
    pub max_iterations: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            stall_threshold: 3,
            max_course_corrections: 3,
            min_done_for_checks: 3,
            critical_eval_interval: 10,
            near_max_value: 0.95,
            min_completion_fraction: 0.8,
            max_iterations: 100,
        }
    }
}

/// Validation thresholds used by the tool dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Token-overlap ratio at or above which a new item is a duplicate.
    pub duplicate_similarity: f64,
    /// Ceiling on concurrently open items not originating from the plan.
    pub max_open_items: usize,
    /// Maximum description length of a new item.
    pub max_description_chars: usize,
    /// Maximum number of files a new item may declare.
    pub max_declared_files: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            duplicate_similarity: 0.8,
            max_open_items: 12,
            max_description_chars: 1200,
            max_declared_files: 8,
        }
    }
}

/// Process monitor parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// EMA smoothing factor.
    pub alpha: f64,
    /// Iterations before any trigger may fire.
    pub warmup_iterations: u32,
    /// Iterations after a strategy change before triggers fire again.
    pub cooldown_iterations: u32,
    /// Absolute velocity EMA below which value is considered plateaued.
    pub plateau_epsilon: f64,
    pub churn_warn: u32,
    pub churn_critical: u32,
    /// Occurrences of one error signature that trip the RED tier.
    pub error_recurrence: u32,
    /// Budget fraction / value score ratio that trips YELLOW.
    pub budget_ratio: f64,
    /// Share of all touches on one file that trips YELLOW.
    pub file_concentration: f64,
    /// Minimum total touches before concentration is evaluated.
    pub min_file_touches: u32,
    /// Rolling baseline window for the efficiency CUSUM.
    pub baseline_window: usize,
    /// CUSUM value that trips YELLOW.
    pub cusum_threshold: f64,
    /// Relative shortfall absorbed per pass before the CUSUM grows.
    pub cusum_slack: f64,
    /// History records included in the strategy prompt.
    pub strategy_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            warmup_iterations: 3,
            cooldown_iterations: 5,
            plateau_epsilon: 0.005,
            churn_warn: 2,
            churn_critical: 4,
            error_recurrence: 3,
            budget_ratio: 1.5,
            file_concentration: 0.5,
            min_file_touches: 6,
            baseline_window: 10,
            cusum_threshold: 0.5,
            cusum_slack: 0.25,
            strategy_history: 15,
        }
    }
}

/// Execution runner parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Upper bound on concurrently running verification units.
    pub max_workers: usize,
    /// Default per-check timeout.
    pub check_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            check_timeout_secs: 300,
        }
    }
}

/// Per-role agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleProfile {
    /// Model tier passed to the agent binary.
    pub model: String,
    pub max_turns: u32,
    pub timeout_secs: u64,
}

/// Agent capability settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent binary to invoke.
    pub binary: String,
    /// Overrides keyed by role name (e.g. `fixer`).
    pub roles: std::collections::BTreeMap<String, RoleProfile>,
    /// Optional total token budget for the unit of work.
    pub token_budget: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            roles: std::collections::BTreeMap::new(),
            token_budget: None,
        }
    }
}

impl AgentConfig {
    /// Effective profile for a role (override or role default).
    #[must_use]
    pub fn profile(&self, role: AgentRole) -> RoleProfile {
        self.roles
            .get(role.as_str())
            .cloned()
            .unwrap_or_else(|| role.default_profile())
    }
}

/// A declared external dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Shell command that exits zero when the service is healthy.
    pub health_command: String,
}

// ============================================================================
// Loop Configuration
// ============================================================================

/// Complete loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Name of the unit of delivery.
    pub unit: String,
    /// Ordered phase tags; empty means a single unphased loop.
    pub phases: Vec<String>,
    pub limits: LimitsConfig,
    pub dispatch: DispatchConfig,
    pub monitor: MonitorConfig,
    pub runner: RunnerConfig,
    pub agent: AgentConfig,
    /// Initial strategy knobs.
    pub strategy: StrategyKnobs,
    pub services: Vec<ServiceConfig>,
    pub safe_dirs: Vec<String>,
    pub sensitive_patterns: Vec<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            unit: "default".to_string(),
            phases: Vec::new(),
            limits: LimitsConfig::default(),
            dispatch: DispatchConfig::default(),
            monitor: MonitorConfig::default(),
            runner: RunnerConfig::default(),
            agent: AgentConfig::default(),
            strategy: StrategyKnobs::default(),
            services: Vec::new(),
            safe_dirs: default_safe_dirs(),
            sensitive_patterns: default_sensitive_patterns(),
        }
    }
}

impl LoopConfig {
    /// Load configuration from a project directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is not valid TOML or fails
    /// validation.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::config_path(project_dir);

        let config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<LoopConfig>(&content)
                .map_err(|e| LoopError::config_with_path(e.to_string(), path.clone()))?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML for `valueloop init`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LoopError::config(e.to_string()))
    }

    /// Get the working directory for a project
    pub fn state_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR)
    }

    /// Get the config.toml path for a project
    pub fn config_path(project_dir: &Path) -> PathBuf {
        Self::state_dir(project_dir).join(CONFIG_FILE)
    }

    /// Check values that would make the loop misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let unit_fraction = |field: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(LoopError::invalid_config(field, format!("{v} is outside [0, 1]")))
            }
        };

        unit_fraction("monitor.alpha", self.monitor.alpha)?;
        unit_fraction("dispatch.duplicate_similarity", self.dispatch.duplicate_similarity)?;
        unit_fraction("limits.near_max_value", self.limits.near_max_value)?;
        unit_fraction("limits.min_completion_fraction", self.limits.min_completion_fraction)?;
        unit_fraction("monitor.file_concentration", self.monitor.file_concentration)?;

        if self.runner.max_workers == 0 {
            return Err(LoopError::invalid_config("runner.max_workers", "must be at least 1"));
        }
        if self.monitor.churn_critical < self.monitor.churn_warn {
            return Err(LoopError::invalid_config(
                "monitor.churn_critical",
                "must not be below churn_warn",
            ));
        }
        if self.strategy.max_item_retries <= self.monitor.churn_critical {
            return Err(LoopError::invalid_config(
                "strategy.max_item_retries",
                format!(
                    "must exceed monitor.churn_critical ({}); items would block before churn escalates",
                    self.monitor.churn_critical
                ),
            ));
        }
        if self.unit.trim().is_empty() {
            return Err(LoopError::invalid_config("unit", "must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        LoopConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = LoopConfig::load(dir.path()).unwrap();
        assert_eq!(config, LoopConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(LoopConfig::state_dir(dir.path())).unwrap();
        std::fs::write(
            LoopConfig::config_path(dir.path()),
            r#"
unit = "checkout"
phases = ["mvp", "polish"]

[limits]
stall_threshold = 6

[strategy]
max_fix_attempts = 5

[[services]]
name = "db"
health_command = "true"
"#,
        )
        .unwrap();

        let config = LoopConfig::load(dir.path()).unwrap();
        assert_eq!(config.unit, "checkout");
        assert_eq!(config.phases, vec!["mvp", "polish"]);
        assert_eq!(config.limits.stall_threshold, 6);
        assert_eq!(config.limits.max_course_corrections, 3);
        assert_eq!(config.strategy.max_fix_attempts, 5);
        assert_eq!(config.services[0].name, "db");
        assert_eq!(config.safe_dirs, default_safe_dirs());
    }

    #[test]
    fn test_retry_cap_must_exceed_churn_critical() {
        let mut config = LoopConfig::default();
        assert!(config.strategy.max_item_retries > config.monitor.churn_critical);

        config.strategy.max_item_retries = config.monitor.churn_critical;
        match config.validate() {
            Err(LoopError::InvalidConfig { field, .. }) => {
                assert_eq!(field, "strategy.max_item_retries");
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        let mut config = LoopConfig::default();
        config.monitor.alpha = 1.5;
        match config.validate() {
            Err(LoopError::InvalidConfig { field, .. }) => assert_eq!(field, "monitor.alpha"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(LoopConfig::state_dir(dir.path())).unwrap();
        std::fs::write(LoopConfig::config_path(dir.path()), "unit = [").unwrap();
        assert!(matches!(
            LoopConfig::load(dir.path()),
            Err(LoopError::Config { .. })
        ));
    }

    #[test]
    fn test_role_profile_override() {
        let mut config = AgentConfig::default();
        config.roles.insert(
            "fixer".to_string(),
            RoleProfile {
                model: "haiku".into(),
                max_turns: 4,
                timeout_secs: 60,
            },
        );
        assert_eq!(config.profile(AgentRole::Fixer).model, "haiku");
        assert_eq!(
            config.profile(AgentRole::Executor),
            AgentRole::Executor.default_profile()
        );
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = LoopConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: LoopConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}

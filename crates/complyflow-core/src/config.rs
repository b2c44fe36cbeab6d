//! ComplyFlow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ComplyError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComplyConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl ComplyConfig {
    /// Load config from the default path (~/.complyflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ComplyError::Config(format!("Failed to read config: {e}")))?;
        let config = Self::from_toml(&content)?;
        tracing::debug!("📄 Config loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ComplyError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrency == 0 {
            return Err(ComplyError::Config("scheduler.max_concurrency must be > 0".into()));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(ComplyError::Config("scheduler.tick_interval_secs must be > 0".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ComplyError::Config("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ComplyError::Config("retry.jitter must be within [0, 1]".into()));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(ComplyError::Config(
                "retry.max_backoff_ms must be >= retry.initial_backoff_ms".into(),
            ));
        }
        match self.store.backend.as_str() {
            "sqlite" | "memory" => {}
            other => {
                return Err(ComplyError::Config(format!(
                    "unknown store backend '{other}' (expected sqlite or memory)"
                )));
            }
        }
        if self.graph.max_steps == 0 || self.graph.parallel_limit == 0 {
            return Err(ComplyError::Config(
                "graph.max_steps and graph.parallel_limit must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ComplyFlow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".complyflow")
    }
}

/// Expand `~` in configured paths.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Tick loop and dispatch limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Deadline for one whole task execution (all nodes).
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    /// Default per-node timeout.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Where the scheduler persists its task registry.
    #[serde(default = "default_tasks_db")]
    pub tasks_db: String,
}

fn default_tick_interval() -> u64 { 30 }
fn default_max_concurrency() -> usize { 4 }
fn default_execution_timeout() -> u64 { 900 }
fn default_node_timeout() -> u64 { 300 }
fn default_tasks_db() -> String { "~/.complyflow/scheduler.db".into() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_concurrency: default_max_concurrency(),
            execution_timeout_secs: default_execution_timeout(),
            node_timeout_secs: default_node_timeout(),
            tasks_db: default_tasks_db(),
        }
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay randomized on each attempt (0.0 = none).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1_000 }
fn default_max_backoff() -> u64 { 60_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.1 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Checkpoint store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "sqlite" or "memory".
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: String,
    /// How many times a conflicting checkpoint is rebased before giving up.
    #[serde(default = "default_rebase_attempts")]
    pub rebase_attempts: u32,
}

fn default_store_backend() -> String { "sqlite".into() }
fn default_store_path() -> String { "~/.complyflow/checkpoints.db".into() }
fn default_rebase_attempts() -> u32 { 3 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            rebase_attempts: default_rebase_attempts(),
        }
    }
}

/// Graph executor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Upper bound on node invocations per execution (guards routing loops).
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Worker pool size for parallel stages.
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,
    /// Error count above which the error handler stops asking for retries.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
}

fn default_max_steps() -> u32 { 32 }
fn default_parallel_limit() -> usize { 4 }
fn default_max_errors() -> u32 { 10 }

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            parallel_limit: default_parallel_limit(),
            max_errors: default_max_errors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Where alerts and node notifications go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_headers: Vec<(String, String)>,
    #[serde(default = "bool_true")]
    pub alert_on_failure: bool,
    #[serde(default = "default_history")]
    pub history_size: usize,
}

fn bool_true() -> bool { true }
fn default_history() -> usize { 100 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_headers: Vec::new(),
            alert_on_failure: true,
            history_size: default_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    #[serde(default = "default_reports_dir")]
    pub dir: String,
}

fn default_reports_dir() -> String { "~/.complyflow/reports".into() }

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: default_reports_dir(),
        }
    }
}

/// An HTTP evidence source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_integration_timeout")]
    pub timeout_secs: u64,
}

fn default_integration_timeout() -> u64 { 30 }

/// A task registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub name: String,
    pub graph: String,
    /// Cron expression ("0 2 * * *"), "every:<secs>" or "once:<rfc3339>".
    pub schedule: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

fn default_priority() -> String { "medium".into() }
fn default_queue() -> String { "default".into() }
fn default_actor() -> String { "EvidenceCollector".into() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ComplyConfig::from_toml("").unwrap();
        assert_eq!(config.scheduler.max_concurrency, 4);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.store.backend, "sqlite");
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn test_parse_tasks_and_integrations() {
        let config = ComplyConfig::from_toml(
            r#"
            [scheduler]
            max_concurrency = 2

            [retry]
            initial_backoff_ms = 500

            [[integrations]]
            name = "github"
            url = "https://evidence.internal/github"

            [[tasks]]
            id = "nightly-soc2"
            name = "Nightly SOC2 evidence sweep"
            graph = "evidence_review"
            schedule = "0 2 * * *"
            priority = "high"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrency, 2);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(config.integrations[0].timeout_secs, 30);
        assert_eq!(config.tasks[0].queue, "default");
        assert_eq!(config.tasks[0].actor, "EvidenceCollector");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ComplyConfig::from_toml("[scheduler]\nmax_concurrency = 0").is_err());
        assert!(ComplyConfig::from_toml("[retry]\njitter = 1.5").is_err());
        assert!(ComplyConfig::from_toml("[store]\nbackend = \"postgres\"").is_err());
        assert!(ComplyConfig::from_toml("[retry]\nmultiplier = 0.5").is_err());
    }
}

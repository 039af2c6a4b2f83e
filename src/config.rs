//! Daemon configuration.
//!
//! Every knob has a default here; the binary overrides them from flags and
//! `FLEET_DISPATCH_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::classify::{PolicyParseError, RetryPolicy};
use crate::types::IssueNumber;
use crate::workspace::WorkspaceConfig;

/// Default number of concurrent workers.
pub const DEFAULT_MAX_PARALLEL: usize = 2;

/// Default free-space floor for the workspace volume (1 GiB).
pub const DEFAULT_MIN_FREE_BYTES: u64 = 1 << 30;

/// Default interval between ticks (1 minute).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default amount of a worker log read when classifying its outcome (16 KiB).
pub const DEFAULT_LOG_TAIL_BYTES: u64 = 16 * 1024;

/// Default tracker backoff after a `rate_limited` failure (5 minutes).
pub const DEFAULT_RATE_LIMIT_BACKOFF_SECS: u64 = 300;

/// Default age at which orphaned job workspaces are swept (24 hours).
pub const DEFAULT_WORKSPACE_MAX_AGE_SECS: u64 = 24 * 3600;

pub const DEFAULT_PIPELINE: &str = "pipeline";

pub const DEFAULT_CLONE_URL_TEMPLATE: &str = "https://github.com/{org}/{repo}.git";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_parallel must be at least 1")]
    ZeroParallelism,

    #[error("poll interval must be non-zero")]
    ZeroPollInterval,

    #[error("log tail size must be non-zero")]
    ZeroLogTail,

    #[error("clone URL template {0:?} must contain {{repo}}")]
    CloneTemplate(String),

    #[error("invalid retry overrides: {0}")]
    RetryPolicy(#[from] PolicyParseError),
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Holds `state.json`, its lock, the event log and the rate-limit deadline.
    pub state_dir: PathBuf,

    /// Per-issue worker logs.
    pub log_dir: PathBuf,

    /// Fleet clones and per-job worktrees.
    pub workspace_root: PathBuf,

    /// Checkout used for jobs that name no repository.
    pub repo_root: PathBuf,

    pub max_parallel: usize,

    /// Spawns are refused while the workspace volume has less free space.
    pub min_free_bytes: u64,

    pub poll_interval: Duration,

    pub log_tail_bytes: u64,

    /// Worker executable, run as `<pipeline> <issue> <worktree>`.
    pub pipeline: PathBuf,

    pub notify_command: Option<PathBuf>,

    pub retry_policy: RetryPolicy,

    pub rate_limit_backoff: Duration,

    pub clone_url_template: String,

    pub workspace_max_age: Duration,

    /// Cap on `completed` and `failure_history`; unbounded when `None`.
    pub history_limit: Option<usize>,
}

impl DaemonConfig {
    /// Defaults rooted at `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        DaemonConfig {
            log_dir: state_dir.join("logs"),
            workspace_root: state_dir.join("workspaces"),
            repo_root: PathBuf::from("."),
            max_parallel: DEFAULT_MAX_PARALLEL,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            log_tail_bytes: DEFAULT_LOG_TAIL_BYTES,
            pipeline: PathBuf::from(DEFAULT_PIPELINE),
            notify_command: None,
            retry_policy: RetryPolicy::default(),
            rate_limit_backoff: Duration::from_secs(DEFAULT_RATE_LIMIT_BACKOFF_SECS),
            clone_url_template: DEFAULT_CLONE_URL_TEMPLATE.to_string(),
            workspace_max_age: Duration::from_secs(DEFAULT_WORKSPACE_MAX_AGE_SECS),
            history_limit: None,
            state_dir,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.log_tail_bytes == 0 {
            return Err(ConfigError::ZeroLogTail);
        }
        if !self.clone_url_template.contains("{repo}") {
            return Err(ConfigError::CloneTemplate(self.clone_url_template.clone()));
        }
        Ok(())
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join("events.jsonl")
    }

    pub fn rate_limit_path(&self) -> PathBuf {
        self.state_dir.join("rate_limit_until")
    }

    pub fn log_path(&self, issue: IssueNumber) -> PathBuf {
        self.log_dir.join(format!("issue-{}.log", issue.0))
    }

    pub fn workspace_config(&self) -> WorkspaceConfig {
        WorkspaceConfig {
            root: self.workspace_root.clone(),
            repo_root: self.repo_root.clone(),
            clone_url_template: self.clone_url_template.clone(),
            max_age: self.workspace_max_age,
        }
    }
}

//! Per-job working copies.
//!
//! Every job runs in its own git worktree so concurrent workers never share a
//! mutable working directory. Worktrees are created in **detached HEAD mode**:
//! git refuses to check out one branch in two worktrees, and the pipeline
//! creates whatever branch it needs itself.
//!
//! # Layout
//!
//! ```text
//! <workspace_root>/
//!   repos/<org>/<repo>/   # fleet-mode clones, one per repository
//!   jobs/issue-<n>/       # per-job worktrees, keyed by issue
//! ```
//!
//! In single-repository mode worktrees hang off the configured repo root
//! instead of a clone under `repos/`.

pub mod git;

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use thiserror::Error;

use crate::types::{IssueNumber, RepoSlug};

pub use git::GitWorkspaces;

/// Errors from workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{} is not inside a git repository", path.display())]
    NotARepository { path: PathBuf },
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// Provides isolated working copies for jobs.
pub trait WorkspaceManager: Send + Sync {
    /// Returns a checked-out copy of a fleet repository, cloning it on first
    /// use. Later calls reuse the checkout without touching the network.
    fn ensure_repo(&self, repo: &RepoSlug) -> WorkspaceResult<PathBuf>;

    /// Creates (or reuses) the working tree for one issue.
    fn create_job_workspace(&self, repo_root: &Path, issue: IssueNumber)
    -> WorkspaceResult<PathBuf>;

    /// Releases a job's working tree. Missing workspaces are not an error.
    fn remove_job_workspace(&self, path: &Path) -> WorkspaceResult<()>;

    /// Removes workspaces of issues not in `active` once they exceed the
    /// configured age. Returns the issues cleaned up.
    fn cleanup_stale_workspaces(
        &self,
        active: &HashSet<IssueNumber>,
    ) -> WorkspaceResult<Vec<IssueNumber>>;

    /// Checkout used when a job names no repository.
    fn default_repo_root(&self) -> PathBuf;
}

/// Paths and clone settings for [`GitWorkspaces`].
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Base directory for fleet clones and job worktrees.
    pub root: PathBuf,

    /// Checkout used in single-repository mode.
    pub repo_root: PathBuf,

    /// Clone URL with `{org}` and `{repo}` placeholders.
    pub clone_url_template: String,

    /// Orphaned job worktrees older than this are removed on start-up.
    pub max_age: Duration,
}

impl WorkspaceConfig {
    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub fn clone_dir(&self, repo: &RepoSlug) -> PathBuf {
        self.repos_dir().join(&repo.org).join(&repo.repo)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn job_workspace_path(&self, issue: IssueNumber) -> PathBuf {
        self.jobs_dir().join(format!("issue-{}", issue.0))
    }

    pub fn clone_url(&self, repo: &RepoSlug) -> String {
        self.clone_url_template
            .replace("{org}", &repo.org)
            .replace("{repo}", &repo.repo)
    }
}

/// Parses a job directory name like `issue-123`.
pub fn parse_issue_dir_name(path: &Path) -> Option<IssueNumber> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix("issue-")?;
    digits.parse::<u64>().ok().map(IssueNumber)
}

/// Builds a git command that never prompts for credentials.
pub(crate) fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd
}

/// Runs git in `workdir`, turning a non-zero exit into [`WorkspaceError::CommandFailed`].
pub(crate) fn run_git<I, S>(workdir: &Path, args: I) -> WorkspaceResult<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let output = git_command(workdir).args(&args).output()?;

    if output.status.success() {
        Ok(output)
    } else {
        let rendered: Vec<_> = args.iter().map(|a| a.to_string_lossy()).collect();
        Err(WorkspaceError::CommandFailed {
            command: format!("git {}", rendered.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

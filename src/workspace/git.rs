//! Git-backed [`WorkspaceManager`].

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::{
    WorkspaceConfig, WorkspaceError, WorkspaceManager, WorkspaceResult, parse_issue_dir_name,
    run_git,
};
use crate::types::{IssueNumber, RepoSlug};

/// Clones repositories and hands out detached worktrees for jobs.
#[derive(Debug, Clone)]
pub struct GitWorkspaces {
    config: WorkspaceConfig,
}

impl GitWorkspaces {
    pub fn new(config: WorkspaceConfig) -> Self {
        GitWorkspaces { config }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// The single-repo root plus every fleet clone under `repos/<org>/<repo>`.
    fn known_checkouts(&self) -> WorkspaceResult<Vec<PathBuf>> {
        let mut checkouts = Vec::new();
        if self.config.repo_root.join(".git").exists() {
            checkouts.push(self.config.repo_root.clone());
        }

        let repos_dir = self.config.repos_dir();
        if !repos_dir.exists() {
            return Ok(checkouts);
        }
        for org in std::fs::read_dir(&repos_dir)? {
            let org = org?.path();
            if !org.is_dir() {
                continue;
            }
            for repo in std::fs::read_dir(&org)? {
                let repo = repo?.path();
                if repo.join(".git").exists() {
                    checkouts.push(repo);
                }
            }
        }
        Ok(checkouts)
    }

    /// Main checkout that owns the worktree at `path`.
    fn owning_checkout(path: &Path) -> WorkspaceResult<PathBuf> {
        let output = run_git(path, ["rev-parse", "--path-format=absolute", "--git-common-dir"])
            .map_err(|_| WorkspaceError::NotARepository {
                path: path.to_path_buf(),
            })?;
        let common_dir = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        common_dir
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| WorkspaceError::NotARepository {
                path: path.to_path_buf(),
            })
    }
}

impl WorkspaceManager for GitWorkspaces {
    fn ensure_repo(&self, repo: &RepoSlug) -> WorkspaceResult<PathBuf> {
        let clone_dir = self.config.clone_dir(repo);
        if clone_dir.join(".git").exists() {
            return Ok(clone_dir);
        }

        // A directory without .git is the remains of an interrupted clone.
        if clone_dir.exists() {
            tracing::warn!(path = %clone_dir.display(), "removing incomplete clone");
            std::fs::remove_dir_all(&clone_dir)?;
        }

        let parent = clone_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.root.clone());
        std::fs::create_dir_all(&parent)?;

        let url = self.config.clone_url(repo);
        tracing::info!(%repo, %url, path = %clone_dir.display(), "cloning repository");
        run_git(
            &parent,
            [
                OsStr::new("clone"),
                OsStr::new("--quiet"),
                OsStr::new(&url),
                clone_dir.as_os_str(),
            ],
        )?;

        Ok(clone_dir)
    }

    fn create_job_workspace(
        &self,
        repo_root: &Path,
        issue: IssueNumber,
    ) -> WorkspaceResult<PathBuf> {
        let path = self.config.job_workspace_path(issue);
        if path.exists() {
            tracing::debug!(%issue, path = %path.display(), "reusing job workspace");
            return Ok(path);
        }

        std::fs::create_dir_all(self.config.jobs_dir())?;
        run_git(
            repo_root,
            [
                OsStr::new("worktree"),
                OsStr::new("add"),
                OsStr::new("--detach"),
                path.as_os_str(),
                OsStr::new("HEAD"),
            ],
        )?;

        tracing::info!(%issue, path = %path.display(), "created job workspace");
        Ok(path)
    }

    fn remove_job_workspace(&self, path: &Path) -> WorkspaceResult<()> {
        if !path.exists() {
            return Ok(());
        }

        match Self::owning_checkout(path) {
            Ok(checkout) => {
                let removed = run_git(
                    &checkout,
                    [
                        OsStr::new("worktree"),
                        OsStr::new("remove"),
                        OsStr::new("--force"),
                        path.as_os_str(),
                    ],
                );
                if let Err(e) = removed {
                    tracing::warn!(path = %path.display(), error = %e, "git worktree remove failed");
                    std::fs::remove_dir_all(path)?;
                    let _ = run_git(&checkout, ["worktree", "prune"]);
                }
            }
            Err(_) => std::fs::remove_dir_all(path)?,
        }

        tracing::debug!(path = %path.display(), "removed job workspace");
        Ok(())
    }

    /// Removes job worktrees whose issue is no longer active and whose
    /// directory is older than `max_age`, then prunes dangling worktree
    /// metadata in every known checkout.
    ///
    /// Returns the issues whose workspaces were removed.
    fn cleanup_stale_workspaces(
        &self,
        active: &HashSet<IssueNumber>,
    ) -> WorkspaceResult<Vec<IssueNumber>> {
        let jobs_dir = self.config.jobs_dir();
        let mut removed = Vec::new();

        if jobs_dir.exists() {
            for entry in std::fs::read_dir(&jobs_dir)? {
                let path = entry?.path();
                let Some(issue) = parse_issue_dir_name(&path) else {
                    continue;
                };
                if active.contains(&issue) {
                    continue;
                }

                let modified = std::fs::metadata(&path)?.modified()?;
                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::MAX);

                // >= so a zero max age removes immediately despite coarse mtimes.
                if age >= self.config.max_age {
                    tracing::info!(
                        path = %path.display(),
                        age_hours = age.as_secs() / 3600,
                        %issue,
                        "removing stale job workspace"
                    );
                    self.remove_job_workspace(&path)?;
                    removed.push(issue);
                }
            }
        }

        for checkout in self.known_checkouts()? {
            if let Err(e) = run_git(&checkout, ["worktree", "prune"]) {
                tracing::debug!(checkout = %checkout.display(), error = %e, "worktree prune failed");
            }
        }

        Ok(removed)
    }

    fn default_repo_root(&self) -> PathBuf {
        self.config.repo_root.clone()
    }
}

//! OS process seams.
//!
//! The scheduler never blocks on a worker. It launches a detached child,
//! records the pid, and later asks a [`LivenessChecker`] whether the pid is
//! still running. Both sides are traits so tests can simulate processes.

pub mod disk;
pub mod worker;

use std::io;
use std::path::PathBuf;

use crate::types::{IssueNumber, RepoSlug};

pub use disk::{DiskProbe, Fs2DiskProbe};
pub use worker::WorkerProcesses;

/// Result of a non-blocking liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The process is gone. `code` is known only for children this daemon
    /// launched itself.
    Exited { code: Option<i32> },
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

/// Everything a worker needs to start on one issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub issue: IssueNumber,
    pub worktree: PathBuf,
    pub log_path: PathBuf,
    pub repo: Option<RepoSlug>,
    pub title: String,
}

/// Starts and stops worker processes.
pub trait ProcessLauncher: Send + Sync {
    /// Starts a detached worker and returns its pid once the process exists.
    fn launch(&self, request: &LaunchRequest) -> io::Result<u32>;

    /// Asks a worker to stop. A process that is already gone is not an error.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Non-blocking probe for whether a pid is still running.
pub trait LivenessChecker: Send + Sync {
    fn probe(&self, pid: u32) -> Liveness;
}

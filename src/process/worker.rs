//! Production launcher and liveness checker.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};

use super::{LaunchRequest, Liveness, LivenessChecker, ProcessLauncher};

/// Runs the pipeline executable as `<program> <issue> <worktree>`.
///
/// Output goes to the job's log file. Each worker leads its own process group
/// so terminating it also stops anything it spawned. Child handles are kept
/// so exits are collected without leaving zombies; pids inherited from an
/// earlier daemon are probed with signal 0 instead.
#[derive(Debug)]
pub struct WorkerProcesses {
    program: PathBuf,
    children: Mutex<HashMap<u32, Child>>,
}

impl WorkerProcesses {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        WorkerProcesses {
            program: program.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self, request: &LaunchRequest) -> io::Result<Command> {
        if let Some(parent) = request.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.program);
        cmd.arg(request.issue.0.to_string())
            .arg(&request.worktree)
            .current_dir(&request.worktree)
            .env("FLEET_ISSUE", request.issue.0.to_string())
            .env("FLEET_WORKTREE", &request.worktree)
            .env("FLEET_TITLE", &request.title)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        if let Some(repo) = &request.repo {
            cmd.env("FLEET_REPO", repo.to_string());
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        Ok(cmd)
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessLauncher for WorkerProcesses {
    fn launch(&self, request: &LaunchRequest) -> io::Result<u32> {
        let child = self.command(request)?.spawn()?;
        let pid = child.id();
        tracing::debug!(
            issue = %request.issue,
            pid,
            log = %request.log_path.display(),
            "worker process started"
        );
        self.children().insert(pid, child);
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        signal_group_term(pid)?;
        if let Some(mut child) = self.children().remove(&pid) {
            // Nobody will probe this pid again; collect it off-thread.
            std::thread::spawn(move || {
                let _ = child.wait();
            });
        }
        Ok(())
    }
}

impl LivenessChecker for WorkerProcesses {
    fn probe(&self, pid: u32) -> Liveness {
        let mut children = self.children();
        if let Some(child) = children.get_mut(&pid) {
            return match child.try_wait() {
                Ok(None) => Liveness::Alive,
                Ok(Some(status)) => {
                    children.remove(&pid);
                    Liveness::Exited {
                        code: exit_code(status),
                    }
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "cannot collect worker status");
                    children.remove(&pid);
                    Liveness::Exited { code: None }
                }
            };
        }
        drop(children);
        probe_foreign(pid)
    }
}

/// Exit code as a shell reports it: death by signal N is `128 + N`.
#[cfg(unix)]
fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|signo| 128 + signo))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(unix)]
fn unix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    // pid 0 and negative values address process groups, never a single worker.
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(nix::unistd::Pid::from_raw)
}

#[cfg(unix)]
fn probe_foreign(pid: u32) -> Liveness {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(target) = unix_pid(pid) else {
        return Liveness::Exited { code: None };
    };
    match kill(target, None) {
        Ok(()) => Liveness::Alive,
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => Liveness::Alive,
        Err(_) => Liveness::Exited { code: None },
    }
}

#[cfg(not(unix))]
fn probe_foreign(pid: u32) -> Liveness {
    tracing::warn!(pid, "cannot probe processes on this platform; assuming alive");
    Liveness::Alive
}

#[cfg(unix)]
fn signal_group_term(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};

    let Some(target) = unix_pid(pid) else {
        return Ok(());
    };
    match killpg(target, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(unix))]
fn signal_group_term(pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot terminate pid {pid} on this platform"),
    ))
}

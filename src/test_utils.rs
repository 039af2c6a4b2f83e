//! In-memory fakes for every scheduler seam, plus a harness wiring them up.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use tempfile::TempDir;

use crate::classify::{FailureClass, FailureClassifier};
use crate::config::DaemonConfig;
use crate::daemon::Daemon;
use crate::dispatch::Dispatcher;
use crate::notify::{Notifier, NotifyError, NotifyEvent};
use crate::persistence::{EventSink, LifecyclePayload, MemoryStateStore};
use crate::process::{DiskProbe, LaunchRequest, Liveness, LivenessChecker, ProcessLauncher};
use crate::ratelimit::RateLimiter;
use crate::reaper::Reaper;
use crate::services::Services;
use crate::types::{IssueNumber, QueueEntry, RepoSlug};
use crate::workspace::{WorkspaceError, WorkspaceManager, WorkspaceResult};

pub fn entry(n: u64) -> QueueEntry {
    QueueEntry::new(IssueNumber(n))
}

pub fn arb_failure_class() -> impl Strategy<Value = FailureClass> {
    prop::sample::select(FailureClass::ALL.to_vec())
}

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct LauncherInner {
    next_pid: u32,
    launched: Vec<LaunchRequest>,
    terminated: Vec<u32>,
    fail: bool,
}

/// Hands out increasing pids without starting anything.
#[derive(Default)]
pub struct FakeLauncher {
    inner: Mutex<LauncherInner>,
    on_launch: Mutex<Option<Hook>>,
}

impl FakeLauncher {
    pub fn launched(&self) -> Vec<IssueNumber> {
        let inner = self.inner.lock().unwrap();
        inner.launched.iter().map(|r| r.issue).collect()
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.inner.lock().unwrap().launched.clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.inner.lock().unwrap().terminated.clone()
    }

    pub fn fail_launches(&self) {
        self.inner.lock().unwrap().fail = true;
    }

    /// Runs `hook` inside every launch, after the pid is assigned.
    pub fn on_launch(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_launch.lock().unwrap() = Some(Box::new(hook));
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, request: &LaunchRequest) -> io::Result<u32> {
        let pid = {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail {
                return Err(io::Error::new(io::ErrorKind::NotFound, "pipeline not found"));
            }
            inner.next_pid += 1;
            inner.launched.push(request.clone());
            1000 + inner.next_pid
        };
        if let Some(hook) = self.on_launch.lock().unwrap().as_ref() {
            hook();
        }
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        self.inner.lock().unwrap().terminated.push(pid);
        Ok(())
    }
}

/// Every pid is alive until marked exited.
#[derive(Default)]
pub struct FakeLiveness {
    exited: Mutex<HashMap<u32, Option<i32>>>,
    on_probe: Mutex<Option<Hook>>,
}

impl FakeLiveness {
    pub fn exit(&self, pid: u32, code: Option<i32>) {
        self.exited.lock().unwrap().insert(pid, code);
    }

    /// Runs `hook` once, on the next probe.
    pub fn on_probe(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_probe.lock().unwrap() = Some(Box::new(hook));
    }
}

impl LivenessChecker for FakeLiveness {
    fn probe(&self, pid: u32) -> Liveness {
        if let Some(hook) = self.on_probe.lock().unwrap().take() {
            hook();
        }
        match self.exited.lock().unwrap().get(&pid) {
            Some(code) => Liveness::Exited { code: *code },
            None => Liveness::Alive,
        }
    }
}

#[derive(Default)]
struct WorkspacesInner {
    ensured: Vec<RepoSlug>,
    created: Vec<(PathBuf, IssueNumber)>,
    removed: Vec<PathBuf>,
    failing: HashSet<IssueNumber>,
    swept_with: Option<HashSet<IssueNumber>>,
}

/// Computes workspace paths without touching the filesystem.
#[derive(Default)]
pub struct FakeWorkspaces {
    inner: Mutex<WorkspacesInner>,
}

impl FakeWorkspaces {
    pub fn fail_for(&self, issue: IssueNumber) {
        self.inner.lock().unwrap().failing.insert(issue);
    }

    pub fn ensured(&self) -> Vec<RepoSlug> {
        self.inner.lock().unwrap().ensured.clone()
    }

    pub fn created(&self) -> Vec<(PathBuf, IssueNumber)> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.inner.lock().unwrap().removed.clone()
    }

    /// The active set passed to the last stale-workspace sweep.
    pub fn swept_with(&self) -> Option<HashSet<IssueNumber>> {
        self.inner.lock().unwrap().swept_with.clone()
    }
}

impl WorkspaceManager for FakeWorkspaces {
    fn ensure_repo(&self, repo: &RepoSlug) -> WorkspaceResult<PathBuf> {
        self.inner.lock().unwrap().ensured.push(repo.clone());
        Ok(PathBuf::from("/ws/repos").join(&repo.org).join(&repo.repo))
    }

    fn create_job_workspace(&self, repo_root: &Path, issue: IssueNumber) -> WorkspaceResult<PathBuf> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing.contains(&issue) {
            return Err(WorkspaceError::CommandFailed {
                command: "git worktree add".to_string(),
                stderr: "fatal: simulated failure".to_string(),
            });
        }
        inner.created.push((repo_root.to_path_buf(), issue));
        Ok(PathBuf::from(format!("/ws/jobs/issue-{}", issue.0)))
    }

    fn remove_job_workspace(&self, path: &Path) -> WorkspaceResult<()> {
        self.inner.lock().unwrap().removed.push(path.to_path_buf());
        Ok(())
    }

    fn cleanup_stale_workspaces(
        &self,
        active: &HashSet<IssueNumber>,
    ) -> WorkspaceResult<Vec<IssueNumber>> {
        self.inner.lock().unwrap().swept_with = Some(active.clone());
        Ok(Vec::new())
    }

    fn default_repo_root(&self) -> PathBuf {
        PathBuf::from("/src/app")
    }
}

/// Reports a settable amount of free space.
pub struct FakeDisk {
    available: AtomicU64,
    fail: AtomicBool,
}

impl Default for FakeDisk {
    fn default() -> Self {
        FakeDisk {
            available: AtomicU64::new(u64::MAX),
            fail: AtomicBool::new(false),
        }
    }
}

impl FakeDisk {
    pub fn set(&self, bytes: u64) {
        self.available.store(bytes, Ordering::SeqCst);
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl DiskProbe for FakeDisk {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::other("statvfs failed"));
        }
        Ok(self.available.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(NotifyEvent, IssueNumber, String)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(NotifyEvent, IssueNumber)> {
        let sent = self.sent.lock().unwrap();
        sent.iter().map(|(e, i, _)| (*e, *i)).collect()
    }

    pub fn details(&self) -> Vec<String> {
        let sent = self.sent.lock().unwrap();
        sent.iter().map(|(_, _, d)| d.clone()).collect()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: NotifyEvent, issue: IssueNumber, detail: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((event, issue, detail.to_string()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Spawn {
                program: PathBuf::from("hook"),
                source: io::Error::other("simulated"),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEvents {
    payloads: Mutex<Vec<LifecyclePayload>>,
}

impl MemoryEvents {
    pub fn payloads(&self) -> Vec<LifecyclePayload> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.payloads.lock().unwrap().iter().map(|p| p.kind()).collect()
    }
}

impl EventSink for MemoryEvents {
    fn emit(&self, payload: LifecyclePayload) {
        self.payloads.lock().unwrap().push(payload);
    }
}

/// A daemon over an in-memory store and fake seams. Worker logs live in a
/// temporary directory.
pub struct Harness {
    pub daemon: Daemon<MemoryStateStore>,
    pub store: MemoryStateStore,
    pub launcher: Arc<FakeLauncher>,
    pub liveness: Arc<FakeLiveness>,
    pub workspaces: Arc<FakeWorkspaces>,
    pub disk: Arc<FakeDisk>,
    pub notifier: Arc<RecordingNotifier>,
    pub events: Arc<MemoryEvents>,
    pub rate_limiter: RateLimiter,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(max_parallel: usize) -> Self {
        Self::build(|config| config.max_parallel = max_parallel)
    }

    pub fn build(configure: impl FnOnce(&mut DaemonConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::new(dir.path().join("state"));
        config.workspace_root = PathBuf::from("/ws");
        configure(&mut config);

        let store = MemoryStateStore::new();
        let launcher = Arc::new(FakeLauncher::default());
        let liveness = Arc::new(FakeLiveness::default());
        let workspaces = Arc::new(FakeWorkspaces::default());
        let disk = Arc::new(FakeDisk::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let events = Arc::new(MemoryEvents::default());
        let rate_limiter = RateLimiter::in_memory();

        let services = Services {
            store: store.clone(),
            config,
            workspaces: workspaces.clone(),
            launcher: launcher.clone(),
            liveness: liveness.clone(),
            disk: disk.clone(),
            rate_limiter: rate_limiter.clone(),
            notifier: notifier.clone(),
            events: events.clone(),
            classifier: FailureClassifier,
        };

        Harness {
            daemon: Daemon::new(services),
            store,
            launcher,
            liveness,
            workspaces,
            disk,
            notifier,
            events,
            rate_limiter,
            dir,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher<'_, MemoryStateStore> {
        self.daemon.dispatcher()
    }

    pub fn reaper(&self) -> Reaper<'_, MemoryStateStore> {
        self.daemon.reaper()
    }

    /// Appends to the issue's log, the way a worker writes it.
    pub fn write_log(&self, issue: u64, text: &str) {
        use std::io::Write;
        let path = self.daemon.services().config.log_path(IssueNumber(issue));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        log.write_all(text.as_bytes()).unwrap();
    }
}

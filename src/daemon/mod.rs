//! The scheduler loop.
//!
//! A tick reaps first and dispatches second, both to completion, so a slot
//! freed by the reaper is visible to the dispatcher in the same tick and no
//! job is counted as both reaped and spawned. Ticks are synchronous: nothing
//! inside one waits on a worker. Parallelism comes from the worker processes.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::classify::FailureClassifier;
use crate::config::DaemonConfig;
use crate::dispatch::{DispatchSummary, Dispatcher};
use crate::notify::{CommandNotifier, NoopNotifier, Notifier};
use crate::persistence::{EventLog, FileStateStore, LifecyclePayload, StateStore, StoreError};
use crate::process::{Fs2DiskProbe, WorkerProcesses};
use crate::queue::{self, EnqueueOutcome};
use crate::ratelimit::RateLimiter;
use crate::reaper::{ReapSummary, Reaper};
use crate::services::Services;
use crate::types::{IssueNumber, QueueEntry};
use crate::workspace::GitWorkspaces;


/// Result of one reap-then-dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reaped: ReapSummary,
    pub dispatched: DispatchSummary,
}

impl TickSummary {
    /// Every issue spawned this tick, backfill included.
    pub fn spawned(&self) -> Vec<IssueNumber> {
        self.reaped
            .backfill
            .spawned
            .iter()
            .chain(&self.dispatched.spawned)
            .copied()
            .collect()
    }
}

/// What start-up recovery found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub created_document: bool,
    pub active: usize,
    pub malformed: usize,
    pub queued: usize,
    pub stale_workspaces_removed: Vec<IssueNumber>,
}

pub struct Daemon<S: StateStore> {
    services: Services<S>,
}

impl Daemon<FileStateStore> {
    /// Wires the production seams for `config`.
    pub fn open(config: DaemonConfig) -> Self {
        let workers = Arc::new(WorkerProcesses::new(&config.pipeline));
        let notifier: Arc<dyn Notifier> = match &config.notify_command {
            Some(program) => Arc::new(CommandNotifier::new(program)),
            None => Arc::new(NoopNotifier),
        };

        let services = Services {
            store: FileStateStore::new(&config.state_dir),
            workspaces: Arc::new(GitWorkspaces::new(config.workspace_config())),
            launcher: workers.clone(),
            liveness: workers,
            disk: Arc::new(Fs2DiskProbe),
            rate_limiter: RateLimiter::file(config.rate_limit_path()),
            notifier,
            events: Arc::new(EventLog::new(config.events_path())),
            classifier: FailureClassifier,
            config,
        };
        Daemon::new(services)
    }
}

impl<S: StateStore> Daemon<S> {
    pub fn new(services: Services<S>) -> Self {
        Daemon { services }
    }

    pub fn services(&self) -> &Services<S> {
        &self.services
    }

    pub fn dispatcher(&self) -> Dispatcher<'_, S> {
        Dispatcher::new(&self.services)
    }

    pub fn reaper(&self) -> Reaper<'_, S> {
        Reaper::new(&self.services)
    }

    /// One reap-then-dispatch cycle.
    #[instrument(skip_all)]
    pub fn tick(&self) -> Result<TickSummary, StoreError> {
        let reaped = self.reaper().reap()?;
        let dispatched = self.dispatcher().dispatch()?;
        let summary = TickSummary { reaped, dispatched };
        tracing::debug!(
            reaped = summary.reaped.reaped(),
            running = summary.reaped.still_running,
            spawned = summary.spawned().len(),
            "tick complete"
        );
        Ok(summary)
    }

    /// Prepares the state directory and sweeps orphaned workspaces.
    ///
    /// Jobs left in `active_jobs` by an earlier run are kept: their workers
    /// may still be running and the next reap settles them either way.
    pub fn recover(&self) -> Result<RecoverySummary, StoreError> {
        let created_document = self.services.store.initialize()?;
        let state = self.services.store.read()?;

        let malformed = state.malformed_count();
        if malformed > 0 {
            tracing::warn!(malformed, "state has malformed active job entries; run `repair` to drop them");
        }
        let set_aside = state.set_aside_count();
        if set_aside > 0 {
            tracing::warn!(set_aside, "state holds unparsable entries; run `repair` to drop them");
        }

        if let Err(e) = std::fs::create_dir_all(&self.services.config.log_dir) {
            tracing::warn!(path = %self.services.config.log_dir.display(), error = %e, "cannot create log dir");
        }

        let active: HashSet<_> = state.valid_jobs().map(|job| job.issue).collect();
        let stale_workspaces_removed = self
            .services
            .workspaces
            .cleanup_stale_workspaces(&active)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "stale workspace sweep failed");
                Vec::new()
            });

        let summary = RecoverySummary {
            created_document,
            active: state.active_count(),
            malformed,
            queued: state.queued.len(),
            stale_workspaces_removed,
        };
        tracing::info!(
            active = summary.active,
            queued = summary.queued,
            swept = summary.stale_workspaces_removed.len(),
            "recovered scheduler state"
        );
        Ok(summary)
    }

    /// Queues an issue, recording its title. Already-queued or active issues
    /// are left as they are.
    pub fn enqueue(
        &self,
        entry: QueueEntry,
        title: Option<&str>,
        priority: bool,
    ) -> Result<EnqueueOutcome, StoreError> {
        let issue = entry.issue;
        let repo = entry.repo.clone();
        let outcome = self.services.store.update(|state| {
            let outcome = if priority {
                queue::enqueue_priority(state, entry)
            } else {
                queue::enqueue(state, entry)
            };
            if outcome.is_queued()
                && let Some(title) = title.filter(|t| !t.is_empty())
            {
                state.titles.insert(issue, title.to_string());
            }
            outcome
        })?;

        if outcome.is_queued() {
            tracing::info!(%issue, priority, "issue queued");
            self.services.emit(LifecyclePayload::Enqueue {
                issue,
                repo,
                priority,
            });
        }
        Ok(outcome)
    }

    pub fn promote(&self, issue: IssueNumber) -> Result<bool, StoreError> {
        self.services.store.update(|state| queue::promote(state, issue))
    }

    pub fn set_paused(&self, paused: bool) -> Result<(), StoreError> {
        self.services.store.update(|state| state.paused = paused)?;
        tracing::info!(paused, "dispatch pause flag updated");
        Ok(())
    }

    /// Drops malformed active-job entries and any set-aside unparsable
    /// entries. Returns how many were removed.
    pub fn repair(&self) -> Result<usize, StoreError> {
        let removed = self
            .services
            .store
            .update(|state| state.remove_malformed() + state.clear_set_aside())?;
        if removed > 0 {
            tracing::warn!(removed, "dropped malformed state entries");
        }
        Ok(removed)
    }

    /// Ticks every poll interval until `shutdown` fires. Running workers are
    /// left alone on shutdown; the next start picks them up.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.services.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_secs = self.services.config.poll_interval.as_secs(),
            max_parallel = self.services.config.max_parallel,
            "dispatch loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested; stopping dispatch loop");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = run_blocking(|| self.tick()) {
                        tracing::error!(error = %e, "tick failed; retrying next interval");
                    }
                }
            }
        }
    }
}

/// Runs a synchronous tick without starving other tasks on a multi-thread
/// runtime. Git clones and worktree setup can take a while.
fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    use tokio::runtime::{Handle, RuntimeFlavor};
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

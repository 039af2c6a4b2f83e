//! Admission control and worker launch.
//!
//! A spawn runs in a fixed order: admission checks, workspace provisioning,
//! process launch, then registration in the state document. Registration is
//! the only step that writes state, so a job is never tracked before its
//! process exists. Capacity and de-duplication are checked again inside the
//! registration lock; a concurrent daemon may have filled the last slot since
//! our snapshot, in which case the freshly launched worker is terminated.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

use chrono::Utc;
use thiserror::Error;
use tracing::instrument;

use crate::notify::NotifyEvent;
use crate::persistence::{LifecyclePayload, SchedulerState, StateStore, StoreError};
use crate::process::LaunchRequest;
use crate::queue;
use crate::services::Services;
use crate::types::{IssueNumber, Job, RepoSlug};
use crate::workspace::WorkspaceError;

/// Why a spawn was refused. None of these are errors: the issue is simply
/// tried again on a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenial {
    Paused,
    AtCapacity,
    AlreadyActive,
    RateLimited,
    InsufficientDisk { available: u64, required: u64 },
}

impl AdmissionDenial {
    /// Whether the denial applies to every candidate, not just this issue.
    pub fn blocks_all(&self) -> bool {
        !matches!(self, AdmissionDenial::AlreadyActive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned(Job),
    Denied(AdmissionDenial),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workspace for {issue} failed: {source}")]
    Workspace {
        issue: IssueNumber,
        #[source]
        source: WorkspaceError,
    },

    #[error("failed to launch worker for {issue}: {source}")]
    Launch {
        issue: IssueNumber,
        #[source]
        source: io::Error,
    },
}

/// What one [`Dispatcher::dispatch`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub spawned: Vec<IssueNumber>,
    /// Issues left queued after a workspace or launch failure.
    pub failed: Vec<IssueNumber>,
    /// The denial that ended the pass, if any.
    pub stopped_by: Option<AdmissionDenial>,
}

pub struct Dispatcher<'a, S: StateStore> {
    services: &'a Services<S>,
}

impl<'a, S: StateStore> Dispatcher<'a, S> {
    pub fn new(services: &'a Services<S>) -> Self {
        Dispatcher { services }
    }

    /// Starts a worker for `issue` if admission allows it.
    ///
    /// On success the job is registered and the issue's queue entry, if any,
    /// is removed in the same update.
    #[instrument(skip_all, fields(%issue))]
    pub fn spawn(
        &self,
        issue: IssueNumber,
        title: &str,
        repo: Option<&RepoSlug>,
    ) -> Result<SpawnOutcome, DispatchError> {
        let snapshot = self.services.store.read()?;
        if let Some(denial) = self.admission(&snapshot, issue) {
            tracing::debug!(?denial, "spawn refused");
            return Ok(SpawnOutcome::Denied(denial));
        }

        let worktree = self.provision(issue, repo)?;

        let config = &self.services.config;
        let request = LaunchRequest {
            issue,
            worktree: worktree.clone(),
            log_path: config.log_path(issue),
            repo: repo.cloned(),
            title: title.to_string(),
        };
        // Earlier attempts share the log; this one starts at its current end.
        let log_offset = std::fs::metadata(&request.log_path).map_or(0, |m| m.len());
        let pid = self
            .services
            .launcher
            .launch(&request)
            .map_err(|source| DispatchError::Launch { issue, source })?;

        let job = Job::new(issue, pid, worktree, title, repo.cloned(), Utc::now())
            .with_log_offset(log_offset);
        let max_parallel = config.max_parallel;
        let registered = self.services.store.update(|state| {
            if state.paused {
                return Err(AdmissionDenial::Paused);
            }
            if state.is_active(issue) {
                return Err(AdmissionDenial::AlreadyActive);
            }
            if state.active_count() >= max_parallel {
                return Err(AdmissionDenial::AtCapacity);
            }
            queue::remove(state, issue);
            if !job.title.is_empty() {
                state.titles.insert(issue, job.title.clone());
            }
            state.active_jobs.push(job.clone().into());
            Ok(())
        });

        match registered {
            Ok(Ok(())) => {}
            Ok(Err(denial)) => {
                tracing::info!(pid, ?denial, "lost registration race; terminating worker");
                self.terminate(pid);
                return Ok(SpawnOutcome::Denied(denial));
            }
            Err(e) => {
                self.terminate(pid);
                return Err(e.into());
            }
        }

        tracing::info!(pid, worktree = %job.worktree.display(), "spawned worker");
        self.services.emit(LifecyclePayload::Spawn {
            issue,
            pid,
            worktree: job.worktree.clone(),
            repo: job.repo.clone(),
        });
        self.services.notify(NotifyEvent::Spawned, issue, &job.title);
        Ok(SpawnOutcome::Spawned(job))
    }

    /// Fills free capacity from the queue, priority lane first.
    ///
    /// A workspace or launch failure leaves that issue queued and moves on to
    /// the next candidate. A denial that applies to every issue (pause,
    /// capacity, rate limit, disk) ends the pass.
    #[instrument(skip_all)]
    pub fn dispatch(&self) -> Result<DispatchSummary, StoreError> {
        let mut summary = DispatchSummary::default();
        let mut tried = HashSet::new();

        loop {
            let state = self.services.store.read()?;
            let Some(entry) = queue::ordered(&state)
                .find(|entry| !tried.contains(&entry.issue))
                .cloned()
            else {
                break;
            };
            tried.insert(entry.issue);
            let title = state.title(entry.issue).to_string();

            match self.spawn(entry.issue, &title, entry.repo.as_ref()) {
                Ok(SpawnOutcome::Spawned(_)) => summary.spawned.push(entry.issue),
                Ok(SpawnOutcome::Denied(denial)) if denial.blocks_all() => {
                    summary.stopped_by = Some(denial);
                    break;
                }
                Ok(SpawnOutcome::Denied(_)) => {}
                Err(DispatchError::Store(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!(issue = %entry.issue, error = %e, "spawn failed; issue stays queued");
                    if let DispatchError::Workspace { source, .. } = &e {
                        self.services.emit(LifecyclePayload::WorkspaceFailed {
                            issue: entry.issue,
                            error: source.to_string(),
                        });
                    }
                    summary.failed.push(entry.issue);
                }
            }
        }

        Ok(summary)
    }

    fn admission(
        &self,
        state: &SchedulerState,
        issue: IssueNumber,
    ) -> Option<AdmissionDenial> {
        let config = &self.services.config;
        if state.paused {
            return Some(AdmissionDenial::Paused);
        }
        if state.active_count() >= config.max_parallel {
            return Some(AdmissionDenial::AtCapacity);
        }
        if state.is_active(issue) {
            return Some(AdmissionDenial::AlreadyActive);
        }
        if self.services.rate_limiter.is_rate_limited() {
            return Some(AdmissionDenial::RateLimited);
        }

        let required = config.min_free_bytes;
        match self.services.disk.available_bytes(&config.workspace_root) {
            Ok(available) if available >= required => None,
            Ok(available) => {
                tracing::warn!(
                    available,
                    required,
                    path = %config.workspace_root.display(),
                    "insufficient disk space; not spawning"
                );
                Some(AdmissionDenial::InsufficientDisk {
                    available,
                    required,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read free disk space; not spawning");
                Some(AdmissionDenial::InsufficientDisk {
                    available: 0,
                    required,
                })
            }
        }
    }

    fn provision(
        &self,
        issue: IssueNumber,
        repo: Option<&RepoSlug>,
    ) -> Result<PathBuf, DispatchError> {
        let workspaces = &self.services.workspaces;
        let repo_root = match repo {
            Some(repo) => workspaces.ensure_repo(repo),
            None => Ok(workspaces.default_repo_root()),
        }
        .and_then(|root| workspaces.create_job_workspace(&root, issue));

        repo_root.map_err(|source| DispatchError::Workspace { issue, source })
    }

    fn terminate(&self, pid: u32) {
        if let Err(e) = self.services.launcher.terminate(pid) {
            tracing::warn!(pid, error = %e, "failed to terminate unregistered worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Harness, entry};
    use crate::types::QueueEntry;

    #[test]
    fn spawn_registers_job_and_dequeues() {
        let h = Harness::new(2);
        h.store
            .update(|s| queue::enqueue(s, entry(70)))
            .unwrap();

        let outcome = h.dispatcher().spawn(IssueNumber(70), "Fix login", None).unwrap();
        let SpawnOutcome::Spawned(job) = outcome else {
            panic!("expected spawn, got {outcome:?}");
        };

        let state = h.store.read().unwrap();
        assert_eq!(state.job(IssueNumber(70)), Some(&job));
        assert!(!state.is_queued(IssueNumber(70)));
        assert_eq!(state.title(IssueNumber(70)), "Fix login");
        assert_eq!(h.launcher.launched(), vec![IssueNumber(70)]);
        assert_eq!(h.events.kinds(), vec!["spawn"]);
        assert_eq!(h.notifier.events(), vec![(NotifyEvent::Spawned, IssueNumber(70))]);
    }

    #[test]
    fn low_disk_never_registers() {
        let h = Harness::new(2);
        h.disk.set(1024);

        let outcome = h.dispatcher().spawn(IssueNumber(70), "", None).unwrap();
        assert!(matches!(
            outcome,
            SpawnOutcome::Denied(AdmissionDenial::InsufficientDisk { available: 1024, .. })
        ));
        assert!(h.store.read().unwrap().active_jobs.is_empty());
        assert_eq!(h.store.write_count(), 0);
        assert!(h.launcher.launched().is_empty());
        assert!(h.workspaces.created().is_empty());
    }

    #[test]
    fn disk_probe_error_denies() {
        let h = Harness::new(2);
        h.disk.fail();
        let outcome = h.dispatcher().spawn(IssueNumber(70), "", None).unwrap();
        assert!(matches!(
            outcome,
            SpawnOutcome::Denied(AdmissionDenial::InsufficientDisk { .. })
        ));
    }

    #[test]
    fn capacity_and_duplicates_are_denied() {
        let h = Harness::new(1);
        let d = h.dispatcher();
        assert!(matches!(
            d.spawn(IssueNumber(1), "", None).unwrap(),
            SpawnOutcome::Spawned(_)
        ));
        assert_eq!(
            d.spawn(IssueNumber(2), "", None).unwrap(),
            SpawnOutcome::Denied(AdmissionDenial::AtCapacity)
        );

        let h = Harness::new(3);
        let d = h.dispatcher();
        d.spawn(IssueNumber(1), "", None).unwrap();
        assert_eq!(
            d.spawn(IssueNumber(1), "", None).unwrap(),
            SpawnOutcome::Denied(AdmissionDenial::AlreadyActive)
        );
    }

    #[test]
    fn paused_and_rate_limited_are_denied() {
        let h = Harness::new(2);
        h.store.update(|s| s.paused = true).unwrap();
        assert_eq!(
            h.dispatcher().spawn(IssueNumber(1), "", None).unwrap(),
            SpawnOutcome::Denied(AdmissionDenial::Paused)
        );

        let h = Harness::new(2);
        h.rate_limiter
            .back_off_for(std::time::Duration::from_secs(60))
            .unwrap();
        assert_eq!(
            h.dispatcher().spawn(IssueNumber(1), "", None).unwrap(),
            SpawnOutcome::Denied(AdmissionDenial::RateLimited)
        );
        assert!(h.launcher.launched().is_empty());
    }

    #[test]
    fn workspace_failure_launches_nothing() {
        let h = Harness::new(2);
        h.workspaces.fail_for(IssueNumber(70));

        let err = h.dispatcher().spawn(IssueNumber(70), "", None).unwrap_err();
        assert!(matches!(err, DispatchError::Workspace { .. }));
        assert!(h.launcher.launched().is_empty());
        assert_eq!(h.store.write_count(), 0);
    }

    #[test]
    fn launch_failure_registers_nothing() {
        let h = Harness::new(2);
        h.launcher.fail_launches();

        let err = h.dispatcher().spawn(IssueNumber(70), "", None).unwrap_err();
        assert!(matches!(err, DispatchError::Launch { .. }));
        assert!(h.store.read().unwrap().active_jobs.is_empty());
    }

    #[test]
    fn fleet_job_uses_repo_checkout() {
        let h = Harness::new(2);
        let repo = RepoSlug::new("acme", "widgets");
        h.dispatcher().spawn(IssueNumber(9), "", Some(&repo)).unwrap();

        assert_eq!(h.workspaces.ensured(), vec![repo.clone()]);
        let state = h.store.read().unwrap();
        assert_eq!(state.job(IssueNumber(9)).unwrap().repo, Some(repo));
    }

    #[test]
    fn registration_race_terminates_worker() {
        let h = Harness::new(1);
        // Another daemon registers a job between our snapshot and our update.
        let racing = h.store.clone();
        h.launcher.on_launch(move || {
            racing
                .update(|s| {
                    s.active_jobs.push(
                        Job::new(IssueNumber(99), 1, "/w/issue-99", "", None, Utc::now()).into(),
                    )
                })
                .unwrap();
        });

        let outcome = h.dispatcher().spawn(IssueNumber(70), "", None).unwrap();
        assert_eq!(outcome, SpawnOutcome::Denied(AdmissionDenial::AtCapacity));
        assert_eq!(h.launcher.terminated().len(), 1);
        assert!(!h.store.read().unwrap().is_active(IssueNumber(70)));
    }

    #[test]
    fn dispatch_fills_capacity_in_queue_order() {
        let h = Harness::new(2);
        h.store
            .update(|s| {
                for n in [70, 71, 72] {
                    queue::enqueue(s, entry(n));
                }
                queue::enqueue_priority(s, entry(73));
            })
            .unwrap();

        let summary = h.dispatcher().dispatch().unwrap();
        assert_eq!(summary.spawned, vec![IssueNumber(73), IssueNumber(70)]);
        assert_eq!(summary.stopped_by, Some(AdmissionDenial::AtCapacity));

        let state = h.store.read().unwrap();
        let queued: Vec<_> = queue::ordered(&state).map(|e| e.issue).collect();
        assert_eq!(queued, vec![IssueNumber(71), IssueNumber(72)]);
    }

    #[test]
    fn dispatch_skips_workspace_failures() {
        let h = Harness::new(1);
        h.store
            .update(|s| {
                queue::enqueue(s, entry(70));
                queue::enqueue(s, QueueEntry::new(IssueNumber(71)));
            })
            .unwrap();
        h.workspaces.fail_for(IssueNumber(70));

        let summary = h.dispatcher().dispatch().unwrap();
        assert_eq!(summary.failed, vec![IssueNumber(70)]);
        assert_eq!(summary.spawned, vec![IssueNumber(71)]);

        let state = h.store.read().unwrap();
        assert!(state.is_queued(IssueNumber(70)));
        assert!(state.is_active(IssueNumber(71)));
        assert!(h.events.kinds().contains(&"workspace_failed"));
    }

    #[test]
    fn dispatch_on_empty_queue_does_nothing() {
        let h = Harness::new(2);
        assert_eq!(h.dispatcher().dispatch().unwrap(), DispatchSummary::default());
        assert_eq!(h.store.write_count(), 0);
    }

    #[test]
    fn dispatch_stops_when_disk_is_low() {
        let h = Harness::new(2);
        h.store
            .update(|s| {
                queue::enqueue(s, entry(1));
                queue::enqueue(s, entry(2));
            })
            .unwrap();
        h.disk.set(0);
        let writes = h.store.write_count();

        let summary = h.dispatcher().dispatch().unwrap();
        assert!(summary.spawned.is_empty());
        assert!(matches!(
            summary.stopped_by,
            Some(AdmissionDenial::InsufficientDisk { .. })
        ));
        assert_eq!(h.store.write_count(), writes);
    }
}

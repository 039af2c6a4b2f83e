//! Reconciles finished workers with the state document.
//!
//! The reaper works from one snapshot of `active_jobs` and probes each pid
//! without blocking. Every dead job is settled in its own locked update that
//! removes it only if the same issue and pid are still registered, so two
//! daemons reaping the same document settle each job once.

use chrono::Utc;
use tracing::instrument;

use crate::classify::{ExitContext, FailureClass, Outcome, RetryDecision, detect_outcome, read_log_tail};
use crate::dispatch::{DispatchSummary, Dispatcher};
use crate::notify::NotifyEvent;
use crate::persistence::{LifecyclePayload, StateStore, StoreError};
use crate::process::Liveness;
use crate::queue;
use crate::services::Services;
use crate::types::{IssueNumber, Job, QueueEntry};

/// What one [`Reaper::reap`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub completed: Vec<IssueNumber>,
    pub requeued: Vec<IssueNumber>,
    pub failed: Vec<IssueNumber>,
    pub still_running: usize,
    pub skipped_malformed: usize,
    /// Spawns made to refill slots freed by this pass.
    pub backfill: DispatchSummary,
}

impl ReapSummary {
    pub fn reaped(&self) -> usize {
        self.completed.len() + self.requeued.len() + self.failed.len()
    }
}

enum Settled {
    Completed { duration_secs: u64 },
    Retry { attempt: u32, max: u32 },
    Terminal { retries: u32 },
}

pub struct Reaper<'a, S: StateStore> {
    services: &'a Services<S>,
}

impl<'a, S: StateStore> Reaper<'a, S> {
    pub fn new(services: &'a Services<S>) -> Self {
        Reaper { services }
    }

    /// Settles every exited worker, then backfills freed capacity.
    ///
    /// Returns immediately, without locking or writing, when nothing is
    /// active. Per-job failures are logged and do not stop the pass.
    #[instrument(skip_all)]
    pub fn reap(&self) -> Result<ReapSummary, StoreError> {
        let snapshot = self.services.store.read()?;
        let mut summary = ReapSummary::default();
        if snapshot.active_jobs.is_empty() {
            return Ok(summary);
        }

        for entry in &snapshot.active_jobs {
            let Some(job) = entry.job() else {
                tracing::warn!(entry = %entry.issue_hint(), "skipping malformed active job entry");
                summary.skipped_malformed += 1;
                continue;
            };

            let exit = match self.services.liveness.probe(job.pid) {
                Liveness::Alive => {
                    summary.still_running += 1;
                    continue;
                }
                Liveness::Exited { code } => ExitContext { code },
            };

            match self.settle(job, &exit) {
                Ok(Some(Settled::Completed { .. })) => summary.completed.push(job.issue),
                Ok(Some(Settled::Retry { .. })) => summary.requeued.push(job.issue),
                Ok(Some(Settled::Terminal { .. })) => summary.failed.push(job.issue),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(issue = %job.issue, pid = job.pid, error = %e, "failed to reap job");
                }
            }
        }

        if summary.reaped() > 0 {
            match Dispatcher::new(self.services).dispatch() {
                Ok(backfill) => summary.backfill = backfill,
                Err(e) => tracing::warn!(error = %e, "backfill failed"),
            }
        }

        Ok(summary)
    }

    /// Settles one dead job. `None` means another daemon already did.
    fn settle(&self, job: &Job, exit: &ExitContext) -> Result<Option<Settled>, StoreError> {
        let config = &self.services.config;
        let log_path = config.log_path(job.issue);
        let tail = read_log_tail(&log_path, job.log_offset, config.log_tail_bytes).unwrap_or_else(|e| {
            tracing::warn!(issue = %job.issue, path = %log_path.display(), error = %e, "cannot read worker log");
            String::new()
        });

        let settled = match detect_outcome(&tail, exit) {
            Outcome::Success => self.complete(job)?,
            Outcome::Failure {
                declared_class,
                stage,
            } => {
                let class = declared_class
                    .unwrap_or_else(|| self.services.classifier.classify(&tail, exit));
                self.fail(job, class, stage)?
            }
        };

        if settled.is_some() {
            if let Err(e) = self.services.workspaces.remove_job_workspace(&job.worktree) {
                tracing::warn!(issue = %job.issue, path = %job.worktree.display(), error = %e, "failed to remove job workspace");
            }
        } else {
            tracing::debug!(issue = %job.issue, pid = job.pid, "job already reaped elsewhere");
        }
        Ok(settled)
    }

    fn complete(&self, job: &Job) -> Result<Option<Settled>, StoreError> {
        let history_limit = self.services.config.history_limit;
        let now = Utc::now();
        let settled = self.services.store.update(|state| {
            let job = state.remove_job(job.issue, job.pid)?;
            state.record_completion(&job, now);
            let duration_secs = state
                .completed
                .last()
                .map_or(0, |record| record.duration_secs);
            if let Some(limit) = history_limit {
                state.prune_history(limit);
            }
            Some(Settled::Completed { duration_secs })
        })?;

        if let Some(Settled::Completed { duration_secs }) = settled {
            tracing::info!(issue = %job.issue, pid = job.pid, duration_secs, "job completed");
            self.services.emit(LifecyclePayload::Reap {
                issue: job.issue,
                pid: job.pid,
                duration_secs,
            });
            self.services
                .notify(NotifyEvent::Completed, job.issue, &job.title);
        }
        Ok(settled)
    }

    fn fail(
        &self,
        job: &Job,
        class: FailureClass,
        stage: Option<String>,
    ) -> Result<Option<Settled>, StoreError> {
        let config = &self.services.config;
        let now = Utc::now();
        let settled = self.services.store.update(|state| {
            let job = state.remove_job(job.issue, job.pid)?;
            let retries = state.retry_count(job.issue);
            let settled = match config.retry_policy.decide(class, retries) {
                RetryDecision::Retry { attempt, max } => {
                    state.retry_counts.insert(job.issue, attempt);
                    state.record_failure(job.issue, class, attempt, false, now);
                    queue::requeue(state, QueueEntry::new(job.issue).with_repo(job.repo.clone()));
                    Settled::Retry { attempt, max }
                }
                RetryDecision::Terminal { .. } => {
                    state.record_failure(job.issue, class, retries, true, now);
                    Settled::Terminal { retries }
                }
            };
            if let Some(limit) = config.history_limit {
                state.prune_history(limit);
            }
            Some(settled)
        })?;

        if settled.is_some() && class == FailureClass::RateLimited {
            match self.services.rate_limiter.back_off_for(config.rate_limit_backoff) {
                Ok(until) => tracing::warn!(issue = %job.issue, %until, "tracker rate limited; backing off"),
                Err(e) => tracing::warn!(error = %e, "failed to persist rate-limit deadline"),
            }
        }

        match &settled {
            Some(Settled::Retry { attempt, max }) => {
                tracing::info!(issue = %job.issue, %class, attempt, max, "job failed; requeued");
                self.services.emit(LifecyclePayload::Requeue {
                    issue: job.issue,
                    class,
                    attempt: *attempt,
                    max_retries: *max,
                });
                let detail = match &stage {
                    Some(stage) => format!("{class} in {stage} (retry {attempt}/{max})"),
                    None => format!("{class} (retry {attempt}/{max})"),
                };
                self.services.notify(NotifyEvent::StageFailed, job.issue, &detail);
            }
            Some(Settled::Terminal { retries }) => {
                tracing::warn!(issue = %job.issue, %class, retries, "job failed terminally");
                self.services.emit(LifecyclePayload::Failed {
                    issue: job.issue,
                    class,
                    retries: *retries,
                    stage: stage.clone(),
                });
                self.services.notify(NotifyEvent::Failed, job.issue, class.as_str());
            }
            Some(Settled::Completed { .. }) | None => {}
        }
        Ok(settled)
    }
}

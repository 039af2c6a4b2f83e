//! The handles a scheduler tick works through.

use std::sync::Arc;

use crate::classify::FailureClassifier;
use crate::config::DaemonConfig;
use crate::notify::{Notifier, NotifyEvent};
use crate::persistence::{EventSink, LifecyclePayload, StateStore};
use crate::process::{DiskProbe, LivenessChecker, ProcessLauncher};
use crate::ratelimit::RateLimiter;
use crate::types::IssueNumber;
use crate::workspace::WorkspaceManager;

/// Store, configuration and every injected seam, owned by the daemon and
/// borrowed by [`Dispatcher`](crate::dispatch::Dispatcher) and
/// [`Reaper`](crate::reaper::Reaper).
pub struct Services<S: StateStore> {
    pub store: S,
    pub config: DaemonConfig,
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub liveness: Arc<dyn LivenessChecker>,
    pub disk: Arc<dyn DiskProbe>,
    pub rate_limiter: RateLimiter,
    pub notifier: Arc<dyn Notifier>,
    pub events: Arc<dyn EventSink>,
    pub classifier: FailureClassifier,
}

impl<S: StateStore> Services<S> {
    /// Sends a tracker notification unless the tracker is backing off.
    /// Failures are logged and dropped.
    pub fn notify(&self, event: NotifyEvent, issue: IssueNumber, detail: &str) {
        if self.rate_limiter.is_rate_limited() {
            tracing::debug!(%event, %issue, "rate limited; skipping notification");
            return;
        }
        if let Err(e) = self.notifier.notify(event, issue, detail) {
            tracing::warn!(%event, %issue, error = %e, "notification failed");
        }
    }

    pub fn emit(&self, payload: LifecyclePayload) {
        self.events.emit(payload);
    }
}

//! Lifecycle events consumed by metrics and dashboards.
//!
//! Events are written as JSON Lines. The payload is flattened into the event
//! object:
//!
//! ```json
//! {"ts":"2024-01-15T10:00:00Z","type":"spawn","issue":70,"pid":4242,"worktree":"/w/issue-70"}
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::FailureClass;
use crate::types::{IssueNumber, RepoSlug};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub ts: DateTime<Utc>,

    #[serde(flatten)]
    pub payload: LifecyclePayload,
}

impl LifecycleEvent {
    pub fn now(payload: LifecyclePayload) -> Self {
        LifecycleEvent {
            ts: Utc::now(),
            payload,
        }
    }
}

/// Serialized with internal tagging: `{"type": "reap", "issue": 70, ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecyclePayload {
    /// An issue was added to the queue.
    Enqueue {
        issue: IssueNumber,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<RepoSlug>,
        priority: bool,
    },

    /// A worker was launched and registered.
    Spawn {
        issue: IssueNumber,
        pid: u32,
        worktree: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<RepoSlug>,
    },

    /// A worker exited successfully and its job was completed.
    Reap {
        issue: IssueNumber,
        pid: u32,
        duration_secs: u64,
    },

    /// A failed issue went back on the queue.
    Requeue {
        issue: IssueNumber,
        class: FailureClass,
        attempt: u32,
        max_retries: u32,
    },

    /// A failed issue exhausted its retries.
    Failed {
        issue: IssueNumber,
        class: FailureClass,
        retries: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },

    /// Workspace provisioning failed; the issue stays queued.
    WorkspaceFailed { issue: IssueNumber, error: String },
}

impl LifecyclePayload {
    pub fn issue(&self) -> IssueNumber {
        match self {
            LifecyclePayload::Enqueue { issue, .. }
            | LifecyclePayload::Spawn { issue, .. }
            | LifecyclePayload::Reap { issue, .. }
            | LifecyclePayload::Requeue { issue, .. }
            | LifecyclePayload::Failed { issue, .. }
            | LifecyclePayload::WorkspaceFailed { issue, .. } => *issue,
        }
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecyclePayload::Enqueue { .. } => "enqueue",
            LifecyclePayload::Spawn { .. } => "spawn",
            LifecyclePayload::Reap { .. } => "reap",
            LifecyclePayload::Requeue { .. } => "requeue",
            LifecyclePayload::Failed { .. } => "failed",
            LifecyclePayload::WorkspaceFailed { .. } => "workspace_failed",
        }
    }
}

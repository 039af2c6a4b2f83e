//! Records stored in the scheduler document.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{IssueNumber, RepoSlug};
use crate::classify::FailureClass;

/// One in-flight unit of work: an issue being processed by a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub issue: IssueNumber,

    /// OS process id of the worker.
    pub pid: u32,

    /// Isolated workspace the worker runs in.
    pub worktree: PathBuf,

    #[serde(default)]
    pub title: String,

    /// Target repository in fleet mode; `None` for the single configured repo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoSlug>,

    pub started_at: DateTime<Utc>,

    /// Length of the issue's log when this attempt was launched. Only output
    /// past this offset belongs to this attempt.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub log_offset: u64,

    /// Fields written by newer versions or other tools, kept across writes.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn new(
        issue: IssueNumber,
        pid: u32,
        worktree: impl Into<PathBuf>,
        title: impl Into<String>,
        repo: Option<RepoSlug>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Job {
            issue,
            pid,
            worktree: worktree.into(),
            title: title.into(),
            repo,
            started_at,
            log_offset: 0,
            extra: Map::new(),
        }
    }

    pub fn with_log_offset(mut self, offset: u64) -> Self {
        self.log_offset = offset;
        self
    }
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// An entry of `active_jobs` as found on disk.
///
/// Entries that fail to parse (non-numeric issue or pid, missing fields) are
/// kept verbatim so that a write never destroys them; the reaper skips them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobEntry {
    Valid(Job),
    Malformed(Value),
}

impl JobEntry {
    pub fn job(&self) -> Option<&Job> {
        match self {
            JobEntry::Valid(job) => Some(job),
            JobEntry::Malformed(_) => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, JobEntry::Malformed(_))
    }

    /// Whatever the entry claims its issue is, for log lines.
    pub fn issue_hint(&self) -> String {
        match self {
            JobEntry::Valid(job) => job.issue.to_string(),
            JobEntry::Malformed(value) => value
                .get("issue")
                .map(Value::to_string)
                .unwrap_or_else(|| "<missing>".to_string()),
        }
    }
}

impl From<Job> for JobEntry {
    fn from(job: Job) -> Self {
        JobEntry::Valid(job)
    }
}

/// A pending issue in the backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "QueueEntryRepr")]
pub struct QueueEntry {
    pub issue: IssueNumber,

    /// Set by triage tooling; carried for display, never reorders the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoSlug>,
}

impl QueueEntry {
    pub fn new(issue: IssueNumber) -> Self {
        QueueEntry {
            issue,
            score: None,
            repo: None,
        }
    }

    pub fn with_repo(mut self, repo: Option<RepoSlug>) -> Self {
        self.repo = repo;
        self
    }

    pub fn with_score(mut self, score: Option<i64>) -> Self {
        self.score = score;
        self
    }
}

/// Legacy documents store the queue as bare issue numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum QueueEntryRepr {
    Bare(IssueNumber),
    Full {
        issue: IssueNumber,
        #[serde(default)]
        score: Option<i64>,
        #[serde(default)]
        repo: Option<RepoSlug>,
    },
}

impl From<QueueEntryRepr> for QueueEntry {
    fn from(repr: QueueEntryRepr) -> Self {
        match repr {
            QueueEntryRepr::Bare(issue) => QueueEntry::new(issue),
            QueueEntryRepr::Full { issue, score, repo } => QueueEntry { issue, score, repo },
        }
    }
}

/// A successfully finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub issue: IssueNumber,

    /// Wall-clock seconds between spawn and reap.
    pub duration_secs: u64,

    pub completed_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoSlug>,
}

/// A classified worker failure. Retried failures are recorded too, with
/// `terminal: false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub issue: IssueNumber,
    pub class: FailureClass,
    pub at: DateTime<Utc>,

    /// Retry count before this failure was handled.
    #[serde(default)]
    pub attempt: u32,

    #[serde(default)]
    pub terminal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job::new(
            IssueNumber(70),
            4242,
            "/work/issue-70",
            "Fix the widget",
            Some(RepoSlug::new("acme", "widgets")),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        )
    }

    #[test]
    fn valid_job_parses_as_valid_entry() {
        let value = serde_json::to_value(sample_job()).unwrap();
        let entry: JobEntry = serde_json::from_value(value).unwrap();
        assert_eq!(entry.job(), Some(&sample_job()));
    }

    #[test]
    fn non_numeric_issue_is_malformed_not_an_error() {
        let raw = json!({
            "issue": "abc",
            "pid": 12,
            "worktree": "/w",
            "started_at": "2024-01-01T00:00:00Z"
        });
        let entry: JobEntry = serde_json::from_value(raw.clone()).unwrap();
        assert!(entry.is_malformed());
        assert_eq!(entry.issue_hint(), "\"abc\"");
        // Preserved byte-for-byte on the way back out.
        assert_eq!(serde_json::to_value(&entry).unwrap(), raw);
    }

    #[test]
    fn non_numeric_pid_is_malformed() {
        let raw = json!({
            "issue": 5,
            "pid": "not-a-pid",
            "worktree": "/w",
            "started_at": "2024-01-01T00:00:00Z"
        });
        let entry: JobEntry = serde_json::from_value(raw).unwrap();
        assert!(entry.is_malformed());
    }

    #[test]
    fn log_offset_is_optional_on_the_wire() {
        let value = serde_json::to_value(sample_job()).unwrap();
        assert!(value.get("log_offset").is_none());

        let job = sample_job().with_log_offset(512);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["log_offset"], json!(512));
        assert_eq!(serde_json::from_value::<Job>(value).unwrap(), job);
    }

    #[test]
    fn unknown_job_fields_survive_roundtrip() {
        let mut value = serde_json::to_value(sample_job()).unwrap();
        value["stage"] = json!("review");
        let job: Job = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(job.extra.get("stage"), Some(&json!("review")));
        assert_eq!(serde_json::to_value(&job).unwrap(), value);
    }

    #[test]
    fn queue_entry_accepts_bare_integer() {
        let entry: QueueEntry = serde_json::from_value(json!(71)).unwrap();
        assert_eq!(entry, QueueEntry::new(IssueNumber(71)));
    }

    #[test]
    fn queue_entry_accepts_object_form() {
        let entry: QueueEntry =
            serde_json::from_value(json!({"issue": 72, "score": 9, "repo": "acme/widgets"}))
                .unwrap();
        assert_eq!(entry.issue, IssueNumber(72));
        assert_eq!(entry.score, Some(9));
        assert_eq!(entry.repo, Some(RepoSlug::new("acme", "widgets")));
    }

    #[test]
    fn queue_entry_serializes_minimal_object() {
        let json = serde_json::to_value(QueueEntry::new(IssueNumber(3))).unwrap();
        assert_eq!(json, json!({"issue": 3}));
    }
}

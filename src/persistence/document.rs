//! The scheduler state document.
//!
//! One JSON document holds everything the daemon schedules from: active jobs,
//! the queue, completion and failure history, retry counters and titles.
//!
//! # Compatibility
//!
//! - Unknown top-level fields are kept in [`SchedulerState::extra`] and written
//!   back unchanged, so older daemons sharing a state dir with newer tooling do
//!   not strip its fields.
//! - A document without `version` predates versioning and is read as version 0;
//!   its queue may hold bare issue numbers (see `QueueEntry`).
//! - A document with a version newer than [`SCHEMA_VERSION`] is refused rather
//!   than rewritten in an older shape.
//! - An entry of a known collection that does not parse is moved to
//!   [`SchedulerState::malformed_entries`] and written back there, so one bad
//!   entry neither blocks the rest of the document nor gets lost.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::store::{StoreError, StoreResult};
use crate::classify::FailureClass;
use crate::types::{CompletionRecord, FailureEvent, IssueNumber, Job, JobEntry, QueueEntry};

/// Current document version.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub active_jobs: Vec<JobEntry>,

    /// FIFO backlog; see [`crate::queue`] for the priority-lane rules.
    #[serde(default)]
    pub queued: Vec<QueueEntry>,

    #[serde(default)]
    pub completed: Vec<CompletionRecord>,

    /// Retries already spent per issue.
    #[serde(default)]
    pub retry_counts: BTreeMap<IssueNumber, u32>,

    #[serde(default)]
    pub failure_history: Vec<FailureEvent>,

    /// Issues dequeued ahead of plain FIFO order.
    #[serde(default)]
    pub priority_lane_active: BTreeSet<IssueNumber>,

    /// Display titles; not authoritative.
    #[serde(default)]
    pub titles: BTreeMap<IssueNumber, String>,

    /// Operator pause: no new spawns while set. Running jobs are left alone.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,

    /// Entries that did not parse, keyed by the field they were read from.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub malformed_entries: BTreeMap<String, Vec<Value>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        SchedulerState {
            version: SCHEMA_VERSION,
            active_jobs: Vec::new(),
            queued: Vec::new(),
            completed: Vec::new(),
            retry_counts: BTreeMap::new(),
            failure_history: Vec::new(),
            priority_lane_active: BTreeSet::new(),
            titles: BTreeMap::new(),
            paused: false,
            malformed_entries: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

impl SchedulerState {
    /// Parses a document, upgrading older versions.
    pub fn from_json(bytes: &[u8]) -> StoreResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> StoreResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(StoreError::NotAnObject);
        };
        let found = fields
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if found > u64::from(SCHEMA_VERSION) {
            return Err(StoreError::UnsupportedVersion {
                supported: SCHEMA_VERSION,
                found,
            });
        }
        fields.remove("version");

        let mut set_aside = take_set_aside(&mut fields);
        let known = count_set_aside(&set_aside);
        split_list::<JobEntry>(&mut fields, "active_jobs", &mut set_aside);
        split_list::<QueueEntry>(&mut fields, "queued", &mut set_aside);
        split_list::<CompletionRecord>(&mut fields, "completed", &mut set_aside);
        split_list::<FailureEvent>(&mut fields, "failure_history", &mut set_aside);
        split_list::<IssueNumber>(&mut fields, "priority_lane_active", &mut set_aside);
        split_map::<u32>(&mut fields, "retry_counts", &mut set_aside);
        split_map::<String>(&mut fields, "titles", &mut set_aside);
        if fields.get("paused").is_some_and(|p| !p.is_boolean())
            && let Some(paused) = fields.remove("paused")
        {
            push_aside(&mut set_aside, "paused", paused);
        }
        let newly = count_set_aside(&set_aside) - known;
        if newly > 0 {
            tracing::warn!(entries = newly, "set aside unparsable state entries");
        }

        let mut state: SchedulerState = serde_json::from_value(Value::Object(fields))?;
        // Version 0 differs only in accepting bare queue entries, which the
        // entry deserializer already handles.
        state.version = SCHEMA_VERSION;
        state.malformed_entries = set_aside;
        Ok(state)
    }

    /// Number of entries in `active_jobs`, malformed ones included: an entry
    /// that cannot be probed may still belong to a live worker.
    pub fn active_count(&self) -> usize {
        self.active_jobs.len()
    }

    pub fn valid_jobs(&self) -> impl Iterator<Item = &Job> {
        self.active_jobs.iter().filter_map(JobEntry::job)
    }

    pub fn malformed_count(&self) -> usize {
        self.active_jobs.iter().filter(|e| e.is_malformed()).count()
    }

    pub fn is_active(&self, issue: IssueNumber) -> bool {
        self.valid_jobs().any(|job| job.issue == issue)
    }

    pub fn is_queued(&self, issue: IssueNumber) -> bool {
        self.queued.iter().any(|entry| entry.issue == issue)
    }

    /// True iff the issue is active or queued.
    pub fn is_inflight(&self, issue: IssueNumber) -> bool {
        self.is_active(issue) || self.is_queued(issue)
    }

    pub fn job(&self, issue: IssueNumber) -> Option<&Job> {
        self.valid_jobs().find(|job| job.issue == issue)
    }

    pub fn retry_count(&self, issue: IssueNumber) -> u32 {
        self.retry_counts.get(&issue).copied().unwrap_or(0)
    }

    pub fn title(&self, issue: IssueNumber) -> &str {
        self.titles.get(&issue).map(String::as_str).unwrap_or("")
    }

    /// Removes the job only if the same issue is still tracked with the same
    /// pid. Another daemon instance may already have reaped and respawned it.
    pub fn remove_job(&mut self, issue: IssueNumber, pid: u32) -> Option<Job> {
        let idx = self
            .active_jobs
            .iter()
            .position(|entry| matches!(entry.job(), Some(job) if job.issue == issue && job.pid == pid))?;
        match self.active_jobs.remove(idx) {
            JobEntry::Valid(job) => Some(job),
            JobEntry::Malformed(_) => None,
        }
    }

    /// Drops malformed active-job entries, returning how many were removed.
    pub fn remove_malformed(&mut self) -> usize {
        let before = self.active_jobs.len();
        self.active_jobs.retain(|entry| !entry.is_malformed());
        before - self.active_jobs.len()
    }

    /// Drops every entry set aside by [`Self::from_value`], returning how many
    /// there were.
    pub fn clear_set_aside(&mut self) -> usize {
        let count = count_set_aside(&self.malformed_entries);
        self.malformed_entries.clear();
        count
    }

    pub fn set_aside_count(&self) -> usize {
        count_set_aside(&self.malformed_entries)
    }

    /// Records a success and forgets the issue's retry counter and lane slot.
    pub fn record_completion(&mut self, job: &Job, completed_at: DateTime<Utc>) {
        let duration_secs = (completed_at - job.started_at).num_seconds().max(0) as u64;
        self.completed.push(CompletionRecord {
            issue: job.issue,
            duration_secs,
            completed_at,
            repo: job.repo.clone(),
        });
        self.retry_counts.remove(&job.issue);
        self.priority_lane_active.remove(&job.issue);
    }

    pub fn record_failure(
        &mut self,
        issue: IssueNumber,
        class: FailureClass,
        attempt: u32,
        terminal: bool,
        at: DateTime<Utc>,
    ) {
        self.failure_history.push(FailureEvent {
            issue,
            class,
            at,
            attempt,
            terminal,
        });
        if terminal {
            self.retry_counts.remove(&issue);
            self.priority_lane_active.remove(&issue);
        }
    }

    /// Keeps only the newest `limit` completion and failure records.
    pub fn prune_history(&mut self, limit: usize) {
        fn keep_last<T>(items: &mut Vec<T>, limit: usize) {
            if items.len() > limit {
                items.drain(..items.len() - limit);
            }
        }
        keep_last(&mut self.completed, limit);
        keep_last(&mut self.failure_history, limit);
    }
}

fn count_set_aside(set_aside: &BTreeMap<String, Vec<Value>>) -> usize {
    set_aside.values().map(Vec::len).sum()
}

fn push_aside(set_aside: &mut BTreeMap<String, Vec<Value>>, field: &str, value: Value) {
    set_aside.entry(field.to_owned()).or_default().push(value);
}

/// Removes the previously set-aside entries from the raw document. A value of
/// the wrong shape is itself set aside.
fn take_set_aside(fields: &mut Map<String, Value>) -> BTreeMap<String, Vec<Value>> {
    match fields.remove("malformed_entries") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(value) => serde_json::from_value(value.clone())
            .unwrap_or_else(|_| BTreeMap::from([("malformed_entries".to_owned(), vec![value])])),
    }
}

/// Leaves only the elements of `field` that parse as `T`. A field that is not
/// an array is set aside whole.
fn split_list<T: DeserializeOwned>(
    fields: &mut Map<String, Value>,
    field: &str,
    set_aside: &mut BTreeMap<String, Vec<Value>>,
) {
    let Some(value) = fields.remove(field) else {
        return;
    };
    let items = match value {
        Value::Array(items) => items,
        Value::Null => return,
        other => {
            push_aside(set_aside, field, other);
            return;
        }
    };
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        if serde_json::from_value::<T>(item.clone()).is_ok() {
            kept.push(item);
        } else {
            push_aside(set_aside, field, item);
        }
    }
    fields.insert(field.to_owned(), Value::Array(kept));
}

/// Leaves only the `issue -> V` pairs of `field` that parse. Each bad pair is
/// set aside as a one-key object.
fn split_map<V: DeserializeOwned>(
    fields: &mut Map<String, Value>,
    field: &str,
    set_aside: &mut BTreeMap<String, Vec<Value>>,
) {
    let Some(value) = fields.remove(field) else {
        return;
    };
    let pairs = match value {
        Value::Object(pairs) => pairs,
        Value::Null => return,
        other => {
            push_aside(set_aside, field, other);
            return;
        }
    };
    let mut kept = Map::new();
    for (key, item) in pairs {
        let parses =
            key.parse::<u64>().is_ok() && serde_json::from_value::<V>(item.clone()).is_ok();
        if parses {
            kept.insert(key, item);
        } else {
            push_aside(set_aside, field, Value::Object(Map::from_iter([(key, item)])));
        }
    }
    fields.insert(field.to_owned(), Value::Object(kept));
}

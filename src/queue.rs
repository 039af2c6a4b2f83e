//! Backlog ordering for pending issues.
//!
//! The queue lives in [`SchedulerState::queued`]; these functions are the only
//! code that reorders it. Entries are ordered by:
//! 1. Priority lane membership (`priority_lane_active`) first
//! 2. Position in `queued` (FIFO) within each group
//!
//! Promoting an issue moves its entry to the tail of `queued`. Plain entries
//! keep their relative order, and the lane is FIFO by promotion time.
//!
//! All functions operate on a document the caller holds inside
//! [`StateStore::update`](crate::persistence::StateStore::update).

use crate::persistence::SchedulerState;
use crate::types::{IssueNumber, QueueEntry};

/// Result of [`enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    AlreadyQueued,
    AlreadyActive,
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued)
    }
}

/// Appends an issue unless it is already queued or active.
pub fn enqueue(state: &mut SchedulerState, entry: QueueEntry) -> EnqueueOutcome {
    if state.is_active(entry.issue) {
        return EnqueueOutcome::AlreadyActive;
    }
    if state.is_queued(entry.issue) {
        return EnqueueOutcome::AlreadyQueued;
    }
    state.queued.push(entry);
    EnqueueOutcome::Queued
}

/// Enqueues straight into the priority lane. An issue that is already queued
/// is promoted instead.
pub fn enqueue_priority(state: &mut SchedulerState, entry: QueueEntry) -> EnqueueOutcome {
    let issue = entry.issue;
    let outcome = enqueue(state, entry);
    match outcome {
        EnqueueOutcome::Queued => {
            state.priority_lane_active.insert(issue);
        }
        EnqueueOutcome::AlreadyQueued => {
            promote(state, issue);
        }
        EnqueueOutcome::AlreadyActive => {}
    }
    outcome
}

/// Puts an in-flight issue in the priority lane.
///
/// Returns false if the issue is neither queued nor active, or was already in
/// the lane. An active issue stays in the lane, so a retry jumps the queue.
pub fn promote(state: &mut SchedulerState, issue: IssueNumber) -> bool {
    if !state.is_inflight(issue) || state.priority_lane_active.contains(&issue) {
        return false;
    }
    state.priority_lane_active.insert(issue);
    if let Some(entry) = remove(state, issue) {
        state.queued.push(entry);
    }
    true
}

/// Queue entries in dequeue order.
pub fn ordered(state: &SchedulerState) -> impl Iterator<Item = &QueueEntry> {
    let lane = &state.priority_lane_active;
    let priority = state.queued.iter().filter(|e| lane.contains(&e.issue));
    let plain = state.queued.iter().filter(|e| !lane.contains(&e.issue));
    priority.chain(plain)
}

/// The entry [`dequeue_next`] would return.
pub fn peek_next(state: &SchedulerState) -> Option<&QueueEntry> {
    ordered(state).next()
}

/// Removes and returns the head of the queue, or `None` when it is empty.
pub fn dequeue_next(state: &mut SchedulerState) -> Option<QueueEntry> {
    let issue = peek_next(state)?.issue;
    remove(state, issue)
}

/// Removes an issue's entry wherever it sits.
pub fn remove(state: &mut SchedulerState, issue: IssueNumber) -> Option<QueueEntry> {
    let idx = state.queued.iter().position(|e| e.issue == issue)?;
    Some(state.queued.remove(idx))
}

/// Puts a failed issue back at the tail for another attempt. Lane membership
/// is unchanged.
pub fn requeue(state: &mut SchedulerState, entry: QueueEntry) -> EnqueueOutcome {
    enqueue(state, entry)
}

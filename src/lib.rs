//! Fleet Dispatch - a daemon that runs tracker issues through isolated
//! pipeline workers.
//!
//! Issues wait in a persistent queue. Each tick the daemon reaps finished
//! workers, classifies failures and requeues the retryable ones, then fills
//! free slots by giving each admitted issue its own git worktree and a
//! detached worker process. All scheduling state lives in one JSON document
//! shared by every daemon invocation pointed at the same state directory.

pub mod classify;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod notify;
pub mod persistence;
pub mod process;
pub mod queue;
pub mod ratelimit;
pub mod reaper;
pub mod services;
pub mod types;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_utils;

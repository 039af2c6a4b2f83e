//! Core domain types for the dispatch daemon.

pub mod ids;
pub mod job;

pub use ids::{InvalidRepoSlug, IssueNumber, RepoSlug};
pub use job::{CompletionRecord, FailureEvent, Job, JobEntry, QueueEntry};

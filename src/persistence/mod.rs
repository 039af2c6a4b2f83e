//! Persistence layer for the dispatch daemon.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   state.json          # scheduler document (see `document`)
//!   state.lock          # advisory lock for read-modify-write updates
//!   events.jsonl        # lifecycle event stream (see `log`)
//!   rate_limit_until    # tracker backoff deadline (see `crate::ratelimit`)
//! ```
//!
//! # Crash Safety
//!
//! - The document is replaced with write-to-temp-then-rename, with fsync on
//!   the file and its directory, so a reader sees the old or the new document.
//! - Updates hold an exclusive `flock` from read to rename, so two daemons on
//!   the same host (or on shared storage honouring flock) never lose each
//!   other's writes.
//! - The event log is append-only and readers skip torn lines.

pub mod document;
pub mod event;
pub mod fsync;
pub mod log;
pub mod store;

pub use document::{SCHEMA_VERSION, SchedulerState};
pub use event::{LifecycleEvent, LifecyclePayload};
pub use fsync::{fsync_dir, fsync_file, write_atomic};
pub use log::{EventLog, EventSink, read_events};
pub use store::{FileStateStore, MemoryStateStore, StateStore, StoreError, StoreResult};

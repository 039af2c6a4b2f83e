//! Backoff gate for the external issue tracker.
//!
//! One deadline (`backoff_until`, epoch seconds) is shared by every daemon
//! using the state directory. Anything that would call the tracker checks
//! [`RateLimiter::is_rate_limited`] first and skips its work, leaving state
//! untouched so the same item is retried next tick.
//!
//! Whoever observes a rate-limit response sets the deadline: the reaper when
//! a worker failure classifies as `rate_limited`, or a tracker adapter through
//! the `rate-limit` command.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::persistence::write_atomic;

#[derive(Debug, Clone)]
enum Deadline {
    File(PathBuf),
    Memory(Arc<Mutex<Option<i64>>>),
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    deadline: Deadline,
}

impl RateLimiter {
    /// Deadline stored in `path`. A missing or unreadable file means "not limited".
    pub fn file(path: impl Into<PathBuf>) -> Self {
        RateLimiter {
            deadline: Deadline::File(path.into()),
        }
    }

    pub fn in_memory() -> Self {
        RateLimiter {
            deadline: Deadline::Memory(Arc::new(Mutex::new(None))),
        }
    }

    pub fn backoff_until(&self) -> Option<DateTime<Utc>> {
        let secs = match &self.deadline {
            Deadline::File(path) => read_deadline(path),
            Deadline::Memory(cell) => *cell.lock().unwrap_or_else(PoisonError::into_inner),
        }?;
        DateTime::from_timestamp(secs, 0)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.is_rate_limited_at(Utc::now())
    }

    pub fn is_rate_limited_at(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until().is_some_and(|until| now < until)
    }

    /// Moves the deadline to `until`, never earlier than an existing one.
    /// Returns the deadline now in force.
    pub fn extend_until(&self, until: DateTime<Utc>) -> io::Result<DateTime<Utc>> {
        let effective = match self.backoff_until() {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        self.store(Some(effective.timestamp()))?;
        Ok(effective)
    }

    pub fn back_off_for(&self, duration: Duration) -> io::Result<DateTime<Utc>> {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        let until = Utc::now()
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.extend_until(until)
    }

    pub fn clear(&self) -> io::Result<()> {
        self.store(None)
    }

    fn store(&self, secs: Option<i64>) -> io::Result<()> {
        match &self.deadline {
            Deadline::File(path) => match secs {
                Some(secs) => write_atomic(path, secs.to_string().as_bytes()),
                None => match std::fs::remove_file(path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                },
            },
            Deadline::Memory(cell) => {
                *cell.lock().unwrap_or_else(PoisonError::into_inner) = secs;
                Ok(())
            }
        }
    }
}

fn read_deadline(path: &Path) -> Option<i64> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read rate-limit deadline");
            return None;
        }
    };
    match text.trim().parse::<i64>() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!(path = %path.display(), "ignoring unparsable rate-limit deadline");
            None
        }
    }
}

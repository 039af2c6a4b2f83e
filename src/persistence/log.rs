//! Append-only lifecycle event stream.
//!
//! The daemon only ever writes here. Readers (metrics, dashboards) must
//! tolerate a truncated final line: a crash mid-append leaves one behind, and
//! the next append starts a fresh line after it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::event::{LifecycleEvent, LifecyclePayload};

/// Destination for lifecycle events. Emitting never fails the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, payload: LifecyclePayload);
}

/// JSON Lines file shared by every daemon invocation using the state dir.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        EventLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one event. The line is written with a single `write_all` on an
    /// `O_APPEND` handle so concurrent writers do not interleave within it.
    pub fn append(&self, event: &LifecycleEvent) -> io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        if ends_mid_line(&mut file)? {
            line.insert(0, b'\n');
        }
        file.write_all(&line)
    }
}

fn ends_mid_line(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl EventSink for EventLog {
    fn emit(&self, payload: LifecyclePayload) {
        let event = LifecycleEvent::now(payload);
        if let Err(e) = self.append(&event) {
            tracing::warn!(
                path = %self.path.display(),
                event = event.payload.kind(),
                issue = %event.payload.issue(),
                error = %e,
                "failed to append lifecycle event"
            );
        }
    }
}

/// Reads every complete event from a log, skipping lines that do not parse.
pub fn read_events(path: &Path) -> io::Result<Vec<LifecycleEvent>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(text
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

//! Fire-and-forget notifications to tracker adapters.
//!
//! The scheduler reports job transitions through a [`Notifier`]; what happens
//! next (comments, labels, chat messages) belongs to the adapter. A failed
//! notification is logged by the caller and never changes scheduling state.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::types::IssueNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyEvent {
    Spawned,
    StageComplete,
    StageFailed,
    Review,
    Completed,
    Failed,
}

impl NotifyEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyEvent::Spawned => "spawned",
            NotifyEvent::StageComplete => "stage_complete",
            NotifyEvent::StageFailed => "stage_failed",
            NotifyEvent::Review => "review",
            NotifyEvent::Completed => "completed",
            NotifyEvent::Failed => "failed",
        }
    }
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to start notify hook {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotifyEvent, issue: IssueNumber, detail: &str)
    -> Result<(), NotifyError>;
}

/// Drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, event: NotifyEvent, issue: IssueNumber, _detail: &str) -> Result<(), NotifyError> {
        tracing::trace!(%event, %issue, "notification dropped (no hook configured)");
        Ok(())
    }
}

/// Runs `<program> <event> <issue> <detail>` without waiting for it.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: PathBuf,
}

impl CommandNotifier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        CommandNotifier {
            program: program.into(),
        }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, event: NotifyEvent, issue: IssueNumber, detail: &str) -> Result<(), NotifyError> {
        let mut child = Command::new(&self.program)
            .arg(event.as_str())
            .arg(issue.0.to_string())
            .arg(detail)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| NotifyError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let program = self.program.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) if !status.success() => {
                tracing::warn!(
                    program = %program.display(),
                    %event,
                    %issue,
                    code = ?status.code(),
                    "notify hook exited unsuccessfully"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(program = %program.display(), error = %e, "notify hook wait failed"),
        });
        Ok(())
    }
}

//! Success/failure detection from a finished worker's log.
//!
//! Workers signal their result with a trailer line:
//!
//! ```text
//! PIPELINE-RESULT {"status":"failure","class":"build_failure","stage":"test"}
//! ```
//!
//! Older workers only print free-text phrases, so the detector falls back in
//! this order: last trailer line, known exit code, legacy phrases, and finally
//! "failure" when the process died without saying anything.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use serde::Deserialize;

use super::FailureClass;

/// Prefix of the machine-readable result line.
pub const RESULT_TRAILER_PREFIX: &str = "PIPELINE-RESULT ";

const LEGACY_SUCCESS: &str = "pipeline completed successfully";
const LEGACY_FAILURE: &str = "pipeline failed";

/// What is known about how the worker process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitContext {
    /// Exit code, when the daemon holds the child handle. Processes inherited
    /// from an earlier daemon run are only probed by signal, so this is `None`.
    pub code: Option<i32>,
}

impl ExitContext {
    pub fn unknown() -> Self {
        ExitContext { code: None }
    }

    pub fn exited(code: i32) -> Self {
        ExitContext { code: Some(code) }
    }
}

/// Result of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure {
        /// Class the worker reported about itself, if any.
        declared_class: Option<FailureClass>,
        /// Pipeline stage that failed, if reported.
        stage: Option<String>,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    fn failure() -> Self {
        Outcome::Failure {
            declared_class: None,
            stage: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TrailerStatus {
    Success,
    Failure,
}

#[derive(Debug, Deserialize)]
struct Trailer {
    status: TrailerStatus,
    #[serde(default)]
    class: Option<String>,
    #[serde(default)]
    stage: Option<String>,
}

fn last_trailer(log_tail: &str) -> Option<Trailer> {
    log_tail
        .lines()
        .rev()
        .filter_map(|line| line.trim().strip_prefix(RESULT_TRAILER_PREFIX))
        .find_map(|json| serde_json::from_str::<Trailer>(json).ok())
}

/// Decides whether a dead worker succeeded.
pub fn detect_outcome(log_tail: &str, exit: &ExitContext) -> Outcome {
    if let Some(trailer) = last_trailer(log_tail) {
        return match trailer.status {
            TrailerStatus::Success => Outcome::Success,
            TrailerStatus::Failure => Outcome::Failure {
                declared_class: trailer.class.and_then(|c| c.parse().ok()),
                stage: trailer.stage,
            },
        };
    }

    match exit.code {
        Some(0) => return Outcome::Success,
        Some(_) => return Outcome::failure(),
        None => {}
    }

    // Whichever legacy phrase appears last wins; a retried stage may print
    // "Pipeline failed" before a later success.
    let lower = log_tail.to_lowercase();
    match (lower.rfind(LEGACY_SUCCESS), lower.rfind(LEGACY_FAILURE)) {
        (Some(ok), Some(failed)) if ok > failed => Outcome::Success,
        (Some(_), None) => Outcome::Success,
        _ => Outcome::failure(),
    }
}

/// Reads at most the last `max_bytes` written to a log file at or after byte
/// `since`, the log length when the current attempt was launched.
///
/// Earlier attempts append to the same file and must not be mistaken for this
/// one. A log shorter than `since` was rotated or truncated and is read from
/// its start. A missing log reads as empty: a worker that died before writing
/// anything is simply a failure with no further signal.
pub fn read_log_tail(path: &Path, since: u64, max_bytes: u64) -> io::Result<String> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };

    let len = file.metadata()?.len();
    let since = if since > len { 0 } else { since };
    let start = len.saturating_sub(max_bytes).max(since);
    file.seek(SeekFrom::Start(start))?;

    let mut bytes = Vec::with_capacity((len - start) as usize);
    file.take(len - start).read_to_end(&mut bytes)?;

    let text = String::from_utf8_lossy(&bytes).into_owned();
    if start > since {
        // Drop the partial first line.
        if let Some((_, rest)) = text.split_once('\n') {
            return Ok(rest.to_string());
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn trailer_success() {
        let log = "stage build ok\nPIPELINE-RESULT {\"status\":\"success\"}\n";
        assert_eq!(detect_outcome(log, &ExitContext::unknown()), Outcome::Success);
    }

    #[test]
    fn trailer_failure_carries_class_and_stage() {
        let log = "PIPELINE-RESULT {\"status\":\"failure\",\"class\":\"auth_error\",\"stage\":\"push\"}";
        assert_eq!(
            detect_outcome(log, &ExitContext::exited(1)),
            Outcome::Failure {
                declared_class: Some(FailureClass::AuthError),
                stage: Some("push".to_string()),
            }
        );
    }

    #[test]
    fn last_trailer_wins() {
        let log = "PIPELINE-RESULT {\"status\":\"failure\"}\nretrying\nPIPELINE-RESULT {\"status\":\"success\"}";
        assert!(detect_outcome(log, &ExitContext::unknown()).is_success());
    }

    #[test]
    fn garbled_trailer_is_ignored() {
        let log = "PIPELINE-RESULT {not json\nPipeline completed successfully";
        assert!(detect_outcome(log, &ExitContext::unknown()).is_success());
    }

    #[test]
    fn trailer_beats_exit_code() {
        let log = "PIPELINE-RESULT {\"status\":\"success\"}";
        assert!(detect_outcome(log, &ExitContext::exited(3)).is_success());
    }

    #[test]
    fn exit_code_beats_legacy_phrase() {
        let log = "Pipeline completed successfully";
        assert!(!detect_outcome(log, &ExitContext::exited(2)).is_success());
        assert!(detect_outcome("", &ExitContext::exited(0)).is_success());
    }

    #[test]
    fn legacy_phrases() {
        let unknown = ExitContext::unknown();
        assert!(detect_outcome("...\nPipeline completed successfully\n", &unknown).is_success());
        assert!(!detect_outcome("...\nPipeline failed at stage test\n", &unknown).is_success());
        assert!(
            detect_outcome("Pipeline failed\nretry\nPipeline completed successfully", &unknown)
                .is_success()
        );
        assert!(
            !detect_outcome("Pipeline completed successfully\nPipeline failed", &unknown)
                .is_success()
        );
    }

    #[test]
    fn silence_is_failure() {
        assert!(!detect_outcome("", &ExitContext::unknown()).is_success());
    }

    #[test]
    fn tail_of_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let tail = read_log_tail(&dir.path().join("issue-1.log"), 0, 1024).unwrap();
        assert!(tail.is_empty());
    }

    #[test]
    fn tail_reads_only_the_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issue-2.log");
        let mut contents = String::new();
        for i in 0..1000 {
            contents.push_str(&format!("line {i}\n"));
        }
        contents.push_str("Pipeline completed successfully\n");
        std::fs::write(&path, &contents).unwrap();

        let tail = read_log_tail(&path, 0, 64).unwrap();
        assert!(tail.len() <= 64);
        assert!(!tail.starts_with("ine"), "partial first line should be dropped");
        assert!(tail.ends_with("Pipeline completed successfully\n"));
    }

    #[test]
    fn short_file_is_read_whole() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issue-3.log");
        std::fs::write(&path, "one\ntwo\n").unwrap();
        assert_eq!(read_log_tail(&path, 0, 1024).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn tail_ignores_earlier_attempts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issue-4.log");
        let first = "PIPELINE-RESULT {\"status\":\"failure\",\"class\":\"merge_conflict\"}\n";
        std::fs::write(&path, format!("{first}second attempt\n")).unwrap();

        let since = first.len() as u64;
        assert_eq!(read_log_tail(&path, since, 1024).unwrap(), "second attempt\n");
        assert_eq!(read_log_tail(&path, since + 100, 1024).unwrap(), format!("{first}second attempt\n"));
        assert_eq!(read_log_tail(&path, 3, 1024).unwrap(), format!("{}second attempt\n", &first[3..]));
    }
}

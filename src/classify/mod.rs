//! Failure classification and retry policy for finished workers.
//!
//! A failed worker leaves two signals behind: the tail of its log and, when
//! the daemon launched it in this process, its exit code. The classifier maps
//! those to a [`FailureClass`], and the [`RetryPolicy`] bounds how many times
//! an issue failing that way is re-queued.
//!
//! - `auth_error` has a ceiling of 0: bad credentials do not fix themselves,
//!   so the first occurrence is terminal.
//! - Transient classes (`rate_limited`, `api_error`, `infrastructure`) get
//!   several attempts.
//! - Code problems (`build_failure`, `test_failure`, `merge_conflict`) get a
//!   small number, since a fresh workspace occasionally helps.

pub mod outcome;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use outcome::{ExitContext, Outcome, RESULT_TRAILER_PREFIX, detect_outcome, read_log_tail};

/// Category of a worker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureClass {
    /// Tracker or forge credentials rejected.
    AuthError,
    /// An upstream API told the worker to back off.
    RateLimited,
    /// Upstream API failures other than rate limits (5xx, resets).
    ApiError,
    MergeConflict,
    BuildFailure,
    TestFailure,
    Timeout,
    /// The host ran out of something (disk, memory) or killed the worker.
    Infrastructure,
    Unknown,
}

impl FailureClass {
    pub const ALL: [FailureClass; 9] = [
        FailureClass::AuthError,
        FailureClass::RateLimited,
        FailureClass::ApiError,
        FailureClass::MergeConflict,
        FailureClass::BuildFailure,
        FailureClass::TestFailure,
        FailureClass::Timeout,
        FailureClass::Infrastructure,
        FailureClass::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::AuthError => "auth_error",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::ApiError => "api_error",
            FailureClass::MergeConflict => "merge_conflict",
            FailureClass::BuildFailure => "build_failure",
            FailureClass::TestFailure => "test_failure",
            FailureClass::Timeout => "timeout",
            FailureClass::Infrastructure => "infrastructure",
            FailureClass::Unknown => "unknown",
        }
    }

    /// Ceiling used when no override is configured.
    pub fn default_max_retries(&self) -> u32 {
        match self {
            FailureClass::AuthError => 0,
            FailureClass::RateLimited => 5,
            FailureClass::ApiError => 4,
            FailureClass::MergeConflict => 1,
            FailureClass::BuildFailure => 2,
            FailureClass::TestFailure => 2,
            FailureClass::Timeout => 2,
            FailureClass::Infrastructure => 3,
            FailureClass::Unknown => 1,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a failure class name that is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown failure class {0:?}")]
pub struct UnknownFailureClass(pub String);

impl FromStr for FailureClass {
    type Err = UnknownFailureClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        FailureClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| UnknownFailureClass(s.to_string()))
    }
}

impl Serialize for FailureClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FailureClass {
    /// Classes written by a newer daemon read back as `Unknown` rather than
    /// failing the whole document.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or(FailureClass::Unknown))
    }
}

/// Error parsing a `class=ceiling,...` override list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyParseError {
    #[error("expected class=count, got {0:?}")]
    MissingEquals(String),

    #[error(transparent)]
    UnknownClass(#[from] UnknownFailureClass),

    #[error("invalid retry count {value:?} for {class}")]
    InvalidCount { class: FailureClass, value: String },
}

/// What the reaper should do with a failed issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue; `attempt` is the retry count after incrementing.
    Retry { attempt: u32, max: u32 },
    /// Record a terminal failure and drop the issue.
    Terminal { max: u32 },
}

impl RetryDecision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryDecision::Terminal { .. })
    }
}

/// Maximum retry count per failure class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    ceilings: BTreeMap<FailureClass, u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            ceilings: FailureClass::ALL
                .into_iter()
                .map(|class| (class, class.default_max_retries()))
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn max_retries_for(&self, class: FailureClass) -> u32 {
        self.ceilings
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_max_retries())
    }

    pub fn with_ceiling(mut self, class: FailureClass, max: u32) -> Self {
        self.ceilings.insert(class, max);
        self
    }

    /// Applies overrides of the form `build_failure=3, api_error=5` on top of
    /// the defaults. An empty string leaves the defaults untouched.
    pub fn parse_overrides(spec: &str) -> Result<Self, PolicyParseError> {
        let mut policy = RetryPolicy::default();
        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, value) = item
                .split_once('=')
                .ok_or_else(|| PolicyParseError::MissingEquals(item.to_string()))?;
            let class: FailureClass = name.parse()?;
            let max = value
                .trim()
                .parse::<u32>()
                .map_err(|_| PolicyParseError::InvalidCount {
                    class,
                    value: value.trim().to_string(),
                })?;
            policy = policy.with_ceiling(class, max);
        }
        Ok(policy)
    }

    /// Compares the retries already spent on an issue with the class ceiling.
    pub fn decide(&self, class: FailureClass, retries_so_far: u32) -> RetryDecision {
        let max = self.max_retries_for(class);
        if retries_so_far < max {
            RetryDecision::Retry {
                attempt: retries_so_far + 1,
                max,
            }
        } else {
            RetryDecision::Terminal { max }
        }
    }
}

/// Maps a failed worker's log tail and exit status to a [`FailureClass`].
///
/// Phrase tables are checked in a fixed order so that, for example, a build
/// that failed because a token was revoked is classed as `auth_error`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureClassifier;

impl FailureClassifier {
    pub fn classify(&self, log_tail: &str, exit: &ExitContext) -> FailureClass {
        let tail = log_tail.to_lowercase();

        if is_auth_failure(&tail) {
            return FailureClass::AuthError;
        }
        if is_rate_limit_error(&tail) {
            return FailureClass::RateLimited;
        }
        match exit.code {
            Some(124) => return FailureClass::Timeout,
            Some(137) | Some(143) => return FailureClass::Infrastructure,
            _ => {}
        }
        if is_infrastructure_error(&tail) {
            return FailureClass::Infrastructure;
        }
        if is_merge_conflict(&tail) {
            return FailureClass::MergeConflict;
        }
        if is_test_failure(&tail) {
            return FailureClass::TestFailure;
        }
        if is_build_failure(&tail) {
            return FailureClass::BuildFailure;
        }
        if is_api_error(&tail) {
            return FailureClass::ApiError;
        }
        if is_timeout(&tail) {
            return FailureClass::Timeout;
        }
        FailureClass::Unknown
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn is_auth_failure(tail: &str) -> bool {
    contains_any(
        tail,
        &[
            "bad credentials",
            "authentication failed",
            "authentication required",
            "401 unauthorized",
            "http 401",
            "permission denied (publickey)",
            "gh auth login",
            "token has expired",
            "invalid api key",
        ],
    )
}

fn is_rate_limit_error(tail: &str) -> bool {
    contains_any(
        tail,
        &[
            "rate limit",
            "api rate",
            "secondary rate",
            "abuse detection",
            "http 429",
            "429 too many requests",
        ],
    )
}

fn is_infrastructure_error(tail: &str) -> bool {
    contains_any(
        tail,
        &[
            "no space left on device",
            "out of memory",
            "cannot allocate memory",
            "oom-kill",
            "disk quota exceeded",
        ],
    )
}

fn is_merge_conflict(tail: &str) -> bool {
    contains_any(
        tail,
        &["merge conflict", "conflict (content)", "automatic merge failed"],
    )
}

fn is_test_failure(tail: &str) -> bool {
    contains_any(
        tail,
        &[
            "test result: failed",
            "tests failed",
            "test failed",
            "failing tests",
            "assertion failed",
        ],
    )
}

fn is_build_failure(tail: &str) -> bool {
    contains_any(
        tail,
        &[
            "could not compile",
            "compilation failed",
            "build failed",
            "error[e",
            "linker failed",
        ],
    )
}

fn is_api_error(tail: &str) -> bool {
    contains_any(
        tail,
        &[
            "api error",
            "http 500",
            "http 502",
            "http 503",
            "502 bad gateway",
            "503 service unavailable",
            "connection reset",
            "connection refused",
            "could not resolve host",
        ],
    )
}

fn is_timeout(tail: &str) -> bool {
    contains_any(tail, &["timed out", "timeout", "deadline exceeded"])
}

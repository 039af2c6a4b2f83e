//! Newtype wrappers for domain identifiers.
//!
//! These keep issue numbers, process ids and repository slugs from being mixed
//! up in function signatures and give each a stable serialized form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A tracker issue number. Unique across the whole fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueNumber(pub u64);

impl fmt::Display for IssueNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for IssueNumber {
    fn from(n: u64) -> Self {
        IssueNumber(n)
    }
}

impl FromStr for IssueNumber {
    type Err = std::num::ParseIntError;

    /// Accepts `42` and `#42`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches('#');
        digits.parse::<u64>().map(IssueNumber)
    }
}

/// Error returned when a repository slug is not of the form `org/repo`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository slug {0:?}: expected org/repo")]
pub struct InvalidRepoSlug(pub String);

/// A repository in fleet mode, serialized as `"org/repo"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoSlug {
    pub org: String,
    pub repo: String,
}

impl RepoSlug {
    pub fn new(org: impl Into<String>, repo: impl Into<String>) -> Self {
        RepoSlug {
            org: org.into(),
            repo: repo.into(),
        }
    }

    /// Parses `org/repo`. Both halves must be non-empty path-safe names.
    pub fn parse(s: &str) -> Result<Self, InvalidRepoSlug> {
        let invalid = || InvalidRepoSlug(s.to_string());
        let (org, repo) = s.trim().split_once('/').ok_or_else(invalid)?;
        if !is_path_component(org) || !is_path_component(repo) {
            return Err(invalid());
        }
        Ok(RepoSlug::new(org, repo))
    }
}

/// Slugs are joined onto filesystem paths, so reject anything that could
/// escape the workspace root.
fn is_path_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.org, self.repo)
    }
}

impl FromStr for RepoSlug {
    type Err = InvalidRepoSlug;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RepoSlug::parse(s)
    }
}

impl TryFrom<String> for RepoSlug {
    type Error = InvalidRepoSlug;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        RepoSlug::parse(&s)
    }
}

impl From<RepoSlug> for String {
    fn from(slug: RepoSlug) -> Self {
        slug.to_string()
    }
}

//! Build records and the build lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{BuildId, Error, RepoId, Result};

/// What caused a build to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Push,
    PullRequest,
    Tag,
    Deployment,
    Comment,
    Schedule,
}

impl Event {
    pub const ALL: [Event; 6] = [
        Event::Push,
        Event::PullRequest,
        Event::Tag,
        Event::Deployment,
        Event::Comment,
        Event::Schedule,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Push => "push",
            Event::PullRequest => "pull_request",
            Event::Tag => "tag",
            Event::Deployment => "deployment",
            Event::Comment => "comment",
            Event::Schedule => "schedule",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Event::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown event: {}", s)))
    }
}

/// Lifecycle state of a build.
///
/// `pending -> running -> {success | failure | error}`, with `canceled`
/// reachable from `pending` or `running` only. Every state except `pending`
/// and `running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Canceled,
}

impl BuildStatus {
    pub const ALL: [BuildStatus; 6] = [
        BuildStatus::Pending,
        BuildStatus::Running,
        BuildStatus::Success,
        BuildStatus::Failure,
        BuildStatus::Error,
        BuildStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Error => "error",
            BuildStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Pending | BuildStatus::Running)
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Forward skips out of `pending` are accepted so that a worker which
    /// only reports completion is not rejected.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        use BuildStatus::*;

        match (self, next) {
            (Pending, Running | Success | Failure | Error | Canceled) => true,
            (Running, Success | Failure | Error | Canceled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BuildStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown build status: {}", s)))
    }
}

/// A persisted build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Store-assigned surrogate key.
    pub id: BuildId,
    /// Owning repository.
    pub repo_id: RepoId,
    /// Per-repository build number, starting at 1.
    pub number: i64,
    pub event: Event,
    /// Empty for tag and schedule events.
    pub branch: String,
    pub status: BuildStatus,
    /// Worker queue the build was dispatched on; empty until resolved.
    pub route: String,
    /// Reason recorded when the build ends in `error`.
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Fields supplied by the trigger when a build is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBuild {
    pub repo_id: RepoId,
    pub event: Event,
    pub branch: String,
}

impl NewBuild {
    pub fn new(repo_id: RepoId, event: Event, branch: impl Into<String>) -> Self {
        Self {
            repo_id,
            event,
            branch: branch.into(),
        }
    }
}

/// Validated, 1-indexed page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    page: i64,
    per_page: i64,
}

impl Pagination {
    pub fn new(page: i64, per_page: i64) -> Result<Self> {
        if page < 1 {
            return Err(Error::InvalidArgument(format!(
                "page must be positive, got {}",
                page
            )));
        }
        if per_page < 1 {
            return Err(Error::InvalidArgument(format!(
                "per_page must be positive, got {}",
                per_page
            )));
        }
        Ok(Self { page, per_page })
    }

    pub fn page(&self) -> i64 {
        self.page
    }

    pub fn per_page(&self) -> i64 {
        self.per_page
    }

    pub fn limit(&self) -> i64 {
        self.per_page
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.per_page)
    }
}

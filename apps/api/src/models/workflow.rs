use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// One optimization session. Immutable after creation apart from its jobs and versions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub workspace_id: String,
    pub job_description: String,
    pub template_filename: String,
    pub profile_filename: Option<String>,
    /// Highest version number assigned so far. Advanced only while a version is published.
    pub version_counter: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRow {
    /// Equal to the task id on the queue.
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub kind: String,
    pub status: String,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn status(&self) -> JobStatus {
        self.status.parse().unwrap_or(JobStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VersionRow {
    pub workflow_id: Uuid,
    pub version: i32,
    pub label: String,
    /// Absent for manually compiled versions.
    pub job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A workflow together with its jobs and recorded versions.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub workflow: WorkflowRow,
    pub jobs: Vec<JobRow>,
    pub versions: Vec<VersionRow>,
}

/// Fields required to open a new workflow.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub user_id: Uuid,
    pub workspace_id: String,
    pub job_description: String,
    pub template_filename: String,
    pub profile_filename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Optimize,
    Refine,
    Analyze,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Optimize => "optimize",
            JobKind::Refine => "refine",
            JobKind::Analyze => "analyze",
        }
    }
}

/// Outcome of a terminal write attempt on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The job was already terminal; nothing was written.
    AlreadyTerminal(JobStatus),
}

/// Success payload for a job plus the staged render awaiting a version number.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub payload: Value,
    pub staged: Option<StagedVersion>,
}

/// A render sitting in its staging directory. The version number is assigned
/// when the job completes, so numbers follow completion order under the
/// workflow lock and a failed job never burns one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedVersion {
    pub workspace: String,
    pub token: Uuid,
    pub claim: VersionClaim,
}

/// How a pipeline asks the ledger for its version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionClaim {
    /// `max(counter + 1, floor)`.
    Next { floor: u32 },
    /// Exactly this number; rejected unless it is above the counter.
    Exact(u32),
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: default_limit(),
        }
    }
}

impl Pagination {
    pub fn clamped(self) -> Self {
        Self {
            skip: self.skip.max(0),
            limit: self.limit.clamp(1, 100),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Version labels
// ────────────────────────────────────────────────────────────────────────────

/// An ordinal snapshot label within a workflow: `v1`, `v2`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionLabel(u32);

impl VersionLabel {
    pub const FIRST: VersionLabel = VersionLabel(1);

    pub fn new(number: u32) -> Option<Self> {
        (number > 0).then_some(Self(number))
    }

    pub fn number(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VersionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VersionLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('v')
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u32>().ok())
            .and_then(VersionLabel::new)
            .ok_or_else(|| format!("'{s}' is not a version label (expected v<N>)"))
    }
}

impl Serialize for VersionLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Legacy next-label rule: increment the trailing integer of `current`,
/// falling back to `v2` when there is none.
pub fn derive_next_label(current: &str) -> VersionLabel {
    let digits_start = current
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);

    digits_start
        .and_then(|i| current[i..].parse::<u32>().ok())
        .and_then(|n| n.checked_add(1))
        .and_then(VersionLabel::new)
        .unwrap_or(VersionLabel(2))
}

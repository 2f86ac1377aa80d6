use crate::{failure::ErrorClass, ParseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Pipeline stages, executed in order for a job.
///
/// Each stage carries its own attempt budget; exhausting one stage does not
/// consume the budget of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Llm,
    Notify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Llm => "llm",
            Stage::Notify => "notify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(Stage::Fetch),
            "llm" => Ok(Stage::Llm),
            "notify" => Ok(Stage::Notify),
            other => Err(ParseError::Stage(other.to_owned())),
        }
    }
}

/// Work item states. `Completed` and `Failed` are terminal and immutable;
/// `Running -> Queued` happens only through the expired-lease sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Queued => "queued",
            WorkStatus::Running => "running",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(WorkStatus::Queued),
            "running" => Ok(WorkStatus::Running),
            "completed" => Ok(WorkStatus::Completed),
            "failed" => Ok(WorkStatus::Failed),
            other => Err(ParseError::WorkStatus(other.to_owned())),
        }
    }
}

/// A durable unit of stage work.
///
/// Invariants: `claimed_by` is non-null iff `status = running`;
/// `lease_expires_at` is set iff `status = running`; `attempt_count` never
/// decreases.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub work_id: Uuid,
    pub job_id: Uuid,
    pub stage: Stage,

    /// Opaque stage payload; the worker deserializes per stage.
    pub payload: Value,

    pub status: WorkStatus,
    pub priority: i32,

    /// Earliest eligible claim time.
    pub run_at: DateTime<Utc>,

    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub last_error_class: Option<ErrorClass>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for a new work item.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub job_id: Uuid,
    pub stage: Stage,
    pub payload: Value,
    pub priority: i32,
    pub run_at: Option<DateTime<Utc>>,
}

impl NewWorkItem {
    /// Immediately eligible work at the given priority.
    pub fn now(job_id: Uuid, stage: Stage, payload: Value, priority: i32) -> Self {
        Self {
            job_id,
            stage,
            payload,
            priority,
            run_at: None,
        }
    }
}

use crate::ParseError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Lifecycle states of a review job.
///
/// `Succeeded` and `Failed` are terminal. A `Succeeded` job is immutable
/// except through a new job with a strictly greater `review_version` for the
/// same changelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    RetryableFailed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::RetryableFailed => "retryable_failed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "succeeded" => Ok(JobStatus::Succeeded),
            "retryable_failed" => Ok(JobStatus::RetryableFailed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ParseError::JobStatus(other.to_owned())),
        }
    }
}

/// A durable review job, one row per `idempotency_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub idempotency_key: String,
    pub changelist_id: i64,

    /// Monotonic per-changelist review attempt number.
    pub review_version: i64,

    pub status: JobStatus,
    pub result_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for a new job. `job_id` is assigned by the caller so the
/// initial work item can reference it inside the same transaction.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Uuid,
    pub idempotency_key: String,
    pub changelist_id: i64,
    pub review_version: i64,
}

impl NewJob {
    pub fn new(idempotency_key: impl Into<String>, changelist_id: i64, review_version: i64) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            idempotency_key: idempotency_key.into(),
            changelist_id,
            review_version,
        }
    }
}

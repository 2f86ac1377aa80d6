use crate::{failure::ErrorClass, work::Stage, ParseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Open,
    Replaying,
    Resolved,
    Reopened,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Open => "open",
            DeadLetterStatus::Replaying => "replaying",
            DeadLetterStatus::Resolved => "resolved",
            DeadLetterStatus::Reopened => "reopened",
        }
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(DeadLetterStatus::Open),
            "replaying" => Ok(DeadLetterStatus::Replaying),
            "resolved" => Ok(DeadLetterStatus::Resolved),
            "reopened" => Ok(DeadLetterStatus::Reopened),
            other => Err(ParseError::DeadLetterStatus(other.to_owned())),
        }
    }
}

/// Where a replay re-enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    ResumeAtFailedStage,
    FullRestart,
}

/// Durable record of a job's terminal failure. Never silently deleted.
///
/// `last_stack` and every string in `sanitized_context` have passed the
/// redaction scrubber before reaching the store.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub dl_id: Uuid,
    pub job_id: Uuid,
    pub stage: Stage,
    pub error_class: ErrorClass,
    pub last_stack: String,
    pub sanitized_context: Value,
    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub status: DeadLetterStatus,
    pub remediation_evidence_ref: Option<String>,
}

/// Insert-or-reopen request, keyed by `(job_id, stage)` in the store.
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub job_id: Uuid,
    pub stage: Stage,
    pub error_class: ErrorClass,
    pub last_stack: String,
    pub sanitized_context: Value,
    pub attempt_count: i32,
}

/// Operator triage filter; failures are indexed by `(error_class, stage)`.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub error_class: Option<ErrorClass>,
    pub stage: Option<Stage>,
    pub status: Option<DeadLetterStatus>,
}

//! Shared core for the review pipeline.
//!
//! This crate defines the contracts the dispatcher and store crates agree on:
//! durable state types (jobs, work items, outbox entries, dead letters), the
//! store traits that hide the persistence backend, the external-collaborator
//! traits (fetcher, model client, notification provider), the output-contract
//! validator, and failure classification with retry policy.
//!
//! # API notes
//! `review-core` is an internal crate (`publish = false`). Its public API uses
//! a few third-party types (`uuid::Uuid`, `chrono::DateTime<Utc>`,
//! `serde_json::Value`) as part of the pipeline contract.

use thiserror::Error;

pub mod dead_letter;
pub mod external;
pub mod failure;
pub mod job;
pub mod outbox;
pub mod prompt;
pub mod redact;
pub mod store;
pub mod validator;
pub mod work;

pub use dead_letter::{DeadLetter, DeadLetterFilter, DeadLetterStatus, NewDeadLetter, RestartMode};
pub use external::{
    ChangeSet, Fetcher, FileDiff, LookupOutcome, ModelClient, NotificationPayload,
    NotificationProvider, SendReceipt,
};
pub use failure::{classify, retry_after_of, ClassifiedError, ErrorClass, RetryPolicy};
pub use job::{Job, JobStatus, NewJob};
pub use outbox::{idempotency_token, NewOutboxBatch, OutboxEntry, OutboxKey, OutboxStatus};
pub use store::{
    AuditKind, AuditLog, DeadLetterStore, InsertOutcome, JobStore, NewAuditEvent, OutboxStore,
    QueueCounts, Store, WorkQueue,
};
pub use validator::{
    validate, Category, Confidence, Diagnostic, DiagnosticCode, Finding, ReviewResult, Severity,
    ValidationOutcome, ValidatorConfig,
};
pub use work::{NewWorkItem, Stage, WorkItem, WorkStatus};

/// Errors from parsing persisted enum representations back into typed values.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0} is not a valid job status")]
    JobStatus(String),
    #[error("{0} is not a valid work status")]
    WorkStatus(String),
    #[error("{0} is not a valid stage")]
    Stage(String),
    #[error("{0} is not a valid outbox status")]
    OutboxStatus(String),
    #[error("{0} is not a valid dead letter status")]
    DeadLetterStatus(String),
    #[error("{0} is not a valid error class")]
    ErrorClass(String),
}

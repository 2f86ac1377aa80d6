//! Contracts for the pipeline's external collaborators.
//!
//! The fetcher, model client, and notification provider are consumed through
//! these traits; production implementations live outside this workspace. They
//! return [`ClassifiedError`] so the failure pipeline can apply retry policy
//! without re-interpreting transport details.
//!
//! Contract notes for implementers: the fetcher must enforce its allow-list
//! at both the listing and per-file stages and run any subprocess with an
//! argumentized invocation (fixed executable path, no shell) under an
//! explicit timeout. The model client must only be handed content that has
//! passed the redaction pipeline. The provider's `lookup` is required; it is
//! what makes send-then-mark recoverable.

use crate::failure::ClassifiedError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One changed file's diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub patch: String,
}

/// The expansion of a changelist into reviewable content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changed_files: Vec<String>,
    pub diffs: Vec<FileDiff>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        changelist_id: i64,
        allow_list: &[String],
    ) -> Result<ChangeSet, ClassifiedError>;
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Submit a diff for review; returns the raw response payload. Deadline
    /// expiry must surface as `NETWORK_TIMEOUT`.
    async fn review(
        &self,
        prompt: &str,
        diff: &str,
        deadline: Duration,
    ) -> Result<Vec<u8>, ClassifiedError>;
}

/// What gets delivered to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub recipient: String,
    pub changelist_id: i64,
    pub review_version: i64,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Delivered { message_id: String },
    NotFound,
}

#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Idempotent send: replaying the same token yields the same message id.
    async fn send(
        &self,
        payload: &NotificationPayload,
        idempotency_token: &str,
        deadline: Duration,
    ) -> Result<SendReceipt, ClassifiedError>;

    /// Provider-side truth for a token, used by reconciliation.
    async fn lookup(&self, idempotency_token: &str) -> Result<LookupOutcome, ClassifiedError>;
}

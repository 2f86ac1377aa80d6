//! Store contracts.
//!
//! The store is the single source of truth and the only coordination medium
//! between workers. Every mutating operation is expressed as a conditional
//! write (owner, lease, status, or unique-key predicate) so that correctness
//! survives process restart; none of these traits may be substituted by an
//! in-process lock.
//!
//! Guarded updates return `Ok(false)` when the predicate matched no row.
//! That is a signal of lost ownership or a lost race, not an error.

use crate::{
    dead_letter::{DeadLetter, DeadLetterFilter, NewDeadLetter},
    failure::ErrorClass,
    job::{Job, NewJob},
    outbox::{NewOutboxBatch, OutboxEntry, OutboxKey},
    work::{NewWorkItem, Stage, WorkItem},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Result of an insert against a unique index: either the new row or the row
/// that already owned the key.
#[derive(Debug, Clone)]
pub enum InsertOutcome<T> {
    Inserted(T),
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            InsertOutcome::Inserted(v) | InsertOutcome::Existing(v) => v,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job with unique-key semantics and, iff the row is new,
    /// atomically enqueue its initial work item. A duplicate key returns the
    /// existing job untouched.
    async fn create_job(
        &self,
        new: NewJob,
        initial_work: NewWorkItem,
    ) -> anyhow::Result<InsertOutcome<Job>>;

    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>>;

    async fn job_by_idempotency_key(&self, idempotency_key: &str)
        -> anyhow::Result<Option<Job>>;

    /// The job with the highest `review_version` for the changelist.
    async fn latest_job_for_changelist(&self, changelist_id: i64)
        -> anyhow::Result<Option<Job>>;

    /// `pending | retryable_failed -> in_progress`.
    async fn mark_in_progress(&self, job_id: Uuid) -> anyhow::Result<bool>;

    /// `in_progress -> retryable_failed` (a retry has been scheduled).
    async fn mark_retryable_failed(&self, job_id: Uuid) -> anyhow::Result<bool>;

    /// Terminal failure. Callers must have written the dead letter first.
    async fn mark_job_failed(&self, job_id: Uuid) -> anyhow::Result<bool>;

    /// `failed -> pending`, used only by operator replay.
    async fn mark_pending_for_replay(&self, job_id: Uuid) -> anyhow::Result<bool>;

    async fn set_result_ref(&self, job_id: Uuid, result_ref: &str) -> anyhow::Result<bool>;

    /// `in_progress -> succeeded`, but only when every outbox row for the
    /// job's `(changelist_id, review_version)` has `notified_at` set. Returns
    /// false when unsent rows remain or the job is not `in_progress`.
    async fn finalize_succeeded(&self, job_id: Uuid) -> anyhow::Result<bool>;
}

/// Work-queue status counts, for operator visibility.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounts {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, new: NewWorkItem) -> anyhow::Result<Uuid>;

    /// Atomically claim the highest-priority, earliest eligible queued item:
    /// `status = running`, `claimed_by = worker_id`,
    /// `lease_expires_at = now() + lease`, `attempt_count + 1`. Concurrent
    /// claimers never observe the same row (I1).
    async fn claim(&self, worker_id: &str, lease: Duration) -> anyhow::Result<Option<WorkItem>>;

    /// Renew the lease. False means the lease is lost: the worker must stop
    /// all ownership-requiring side effects (I2).
    async fn heartbeat(
        &self,
        work_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> anyhow::Result<bool>;

    /// Owner-guarded terminal success.
    async fn complete(&self, work_id: Uuid, worker_id: &str) -> anyhow::Result<bool>;

    /// Owner-guarded success plus atomic enqueue of the next stage's work.
    async fn complete_and_enqueue(
        &self,
        work_id: Uuid,
        worker_id: &str,
        next: NewWorkItem,
    ) -> anyhow::Result<bool>;

    /// Owner-guarded failure. With `requeue_at` the item returns to `queued`
    /// for another attempt at that time; without it the item is terminally
    /// `failed`. `error_class` is recorded either way.
    async fn fail(
        &self,
        work_id: Uuid,
        worker_id: &str,
        error_class: ErrorClass,
        requeue_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool>;

    /// Sweep expired leases back to `queued`, clearing ownership. Idempotent
    /// and safe under concurrent invocation; returns the rows recovered.
    async fn requeue_expired(&self) -> anyhow::Result<u64>;

    async fn get_work(&self, work_id: Uuid) -> anyhow::Result<Option<WorkItem>>;

    /// Most recent work item for a job stage regardless of status; replay
    /// uses this to recover the stage payload.
    async fn latest_for_job_stage(
        &self,
        job_id: Uuid,
        stage: Stage,
    ) -> anyhow::Result<Option<WorkItem>>;

    async fn queue_counts(&self) -> anyhow::Result<QueueCounts>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert one `pending` row per recipient; rows whose unique key already
    /// exists are left untouched. Returns the number inserted.
    async fn materialize(&self, batch: NewOutboxBatch) -> anyhow::Result<u64>;

    async fn outbox_entry(&self, key: &OutboxKey) -> anyhow::Result<Option<OutboxEntry>>;

    async fn pending_for_job(&self, job_id: Uuid) -> anyhow::Result<Vec<OutboxEntry>>;

    /// Rows without `notified_at`, any status; empty means the job's
    /// notification work is fully delivered.
    async fn unresolved_for_job(&self, job_id: Uuid) -> anyhow::Result<Vec<OutboxEntry>>;

    /// Record that a provider send is starting: bumps `attempt_count` and
    /// sets the send-started sentinel. Guarded on `pending` + not notified.
    async fn begin_send_attempt(&self, key: &OutboxKey) -> anyhow::Result<bool>;

    /// The success write: `notification_id`, `notified_at = now()`,
    /// `status = sent` in one statement, guarded on not-yet-notified.
    async fn mark_sent(&self, key: &OutboxKey, notification_id: &str) -> anyhow::Result<bool>;

    /// Fallback when `mark_sent` fails after a provider ack: persist the
    /// message id alone so provider truth is never lost. Never touches
    /// `notified_at`.
    async fn record_notification_id(
        &self,
        key: &OutboxKey,
        notification_id: &str,
    ) -> anyhow::Result<bool>;

    /// Reconciliation write: set `notified_at` (and the id, if the row lacks
    /// one) for a row the provider confirms was delivered. No resend happens.
    async fn backfill_notified(
        &self,
        key: &OutboxKey,
        notification_id: &str,
    ) -> anyhow::Result<bool>;

    /// Clear a dangling send sentinel after the provider reports `NotFound`;
    /// the row stays `pending` and will be re-sent.
    async fn clear_send_sentinel(
        &self,
        key: &OutboxKey,
        last_error: Option<&str>,
    ) -> anyhow::Result<bool>;

    async fn mark_failed_permanent(
        &self,
        key: &OutboxKey,
        last_error: &str,
    ) -> anyhow::Result<bool>;

    /// Rows needing provider reconciliation: `notified_at` null with a
    /// message id or a send sentinel present.
    async fn ambiguous_entries(&self, limit: i64) -> anyhow::Result<Vec<OutboxEntry>>;

    /// `sent` rows whose delivery marker has not yet been checked against
    /// provider-side truth (`provider_verified_at` null), oldest first.
    async fn sent_for_reconciliation(&self, limit: i64) -> anyhow::Result<Vec<OutboxEntry>>;

    /// Record that provider truth confirmed a `sent` row's delivery.
    async fn mark_provider_verified(&self, key: &OutboxKey) -> anyhow::Result<bool>;

    /// Record that the provider has no evidence for a `sent` row. The row
    /// keeps its delivery marker (it is never un-sent); the check is stamped
    /// so the violation is surfaced once, through the audit trail, rather
    /// than on every scan.
    async fn mark_provider_evidence_missing(
        &self,
        key: &OutboxKey,
        detail: &str,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert a dead letter, or update the existing one for `(job_id, stage)`.
    /// A record that arrives while the previous one is `replaying` with the
    /// same class reopens it (`status = reopened`).
    async fn record_dead_letter(&self, new: NewDeadLetter) -> anyhow::Result<DeadLetter>;

    async fn get_dead_letter(&self, dl_id: Uuid) -> anyhow::Result<Option<DeadLetter>>;

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> anyhow::Result<Vec<DeadLetter>>;

    /// `open | reopened -> replaying`, recording the operator's remediation
    /// evidence. False when the record is not in a replayable state.
    async fn mark_replaying(&self, dl_id: Uuid, evidence_ref: &str) -> anyhow::Result<bool>;

    async fn mark_resolved(&self, dl_id: Uuid) -> anyhow::Result<bool>;
}

/// Append-only audit trail kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    JobCreated,
    JobSucceeded,
    JobFailed,
    DeadLettered,
    ReplayRequested,
    OutboxContractViolation,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::JobCreated => "job_created",
            AuditKind::JobSucceeded => "job_succeeded",
            AuditKind::JobFailed => "job_failed",
            AuditKind::DeadLettered => "dead_lettered",
            AuditKind::ReplayRequested => "replay_requested",
            AuditKind::OutboxContractViolation => "outbox_contract_violation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub kind: AuditKind,
    pub job_id: Option<Uuid>,
    pub detail: Value,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record_audit(&self, event: NewAuditEvent) -> anyhow::Result<()>;
}

/// The full persistence contract the dispatcher operates against.
pub trait Store: JobStore + WorkQueue + OutboxStore + DeadLetterStore + AuditLog {}

impl<T: JobStore + WorkQueue + OutboxStore + DeadLetterStore + AuditLog> Store for T {}

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use review_core::{
    store::{
        AuditLog, DeadLetterStore, InsertOutcome, JobStore, NewAuditEvent, OutboxStore,
        QueueCounts, WorkQueue,
    },
    DeadLetter, DeadLetterFilter, DeadLetterStatus, ErrorClass, Job, JobStatus, NewDeadLetter,
    NewJob, NewOutboxBatch, NewWorkItem, OutboxEntry, OutboxKey, OutboxStatus, Stage, WorkItem,
    WorkStatus,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub kind: &'static str,
    pub job_id: Option<Uuid>,
    pub detail: serde_json::Value,
}

#[derive(Default)]
struct State {
    jobs: Vec<Job>,
    work: Vec<WorkItem>,
    outbox: Vec<OutboxEntry>,
    dead_letters: Vec<DeadLetter>,
    audit: Vec<AuditRecord>,

    /// Fault injection: make the next `mark_sent` fail as if the DB write
    /// were lost after the provider acknowledged the send.
    fail_next_mark_sent: bool,
}

/// In-memory store; every operation is one critical section.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for the next `mark_sent` to fail once.
    pub async fn fail_next_mark_sent(&self) {
        self.inner.lock().await.fail_next_mark_sent = true;
    }

    pub async fn audit_events(&self) -> Vec<AuditRecord> {
        self.inner.lock().await.audit.clone()
    }

    pub async fn job_count(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn work_items(&self) -> Vec<WorkItem> {
        self.inner.lock().await.work.clone()
    }

    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.inner.lock().await.outbox.clone()
    }

    /// Force a work item's lease into the past so sweeper behavior can be
    /// exercised without real waiting.
    pub async fn expire_lease(&self, work_id: Uuid) {
        let mut state = self.inner.lock().await;
        if let Some(item) = state.work.iter_mut().find(|w| w.work_id == work_id) {
            item.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }
}

fn insert_work_locked(state: &mut State, new: &NewWorkItem) -> Uuid {
    let now = Utc::now();
    let work_id = Uuid::new_v4();
    state.work.push(WorkItem {
        work_id,
        job_id: new.job_id,
        stage: new.stage,
        payload: new.payload.clone(),
        status: WorkStatus::Queued,
        priority: new.priority,
        run_at: new.run_at.unwrap_or(now),
        claimed_by: None,
        lease_expires_at: None,
        attempt_count: 0,
        last_error_class: None,
        created_at: now,
        started_at: None,
        updated_at: now,
    });
    work_id
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(
        &self,
        new: NewJob,
        initial_work: NewWorkItem,
    ) -> anyhow::Result<InsertOutcome<Job>> {
        let mut state = self.inner.lock().await;
        if let Some(existing) = state
            .jobs
            .iter()
            .find(|j| j.idempotency_key == new.idempotency_key)
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        let now = Utc::now();
        let job = Job {
            job_id: new.job_id,
            idempotency_key: new.idempotency_key,
            changelist_id: new.changelist_id,
            review_version: new.review_version,
            status: JobStatus::Pending,
            result_ref: None,
            created_at: now,
            updated_at: now,
        };
        state.jobs.push(job.clone());
        insert_work_locked(&mut state, &initial_work);
        Ok(InsertOutcome::Inserted(job))
    }

    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        let state = self.inner.lock().await;
        Ok(state.jobs.iter().find(|j| j.job_id == job_id).cloned())
    }

    async fn job_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> anyhow::Result<Option<Job>> {
        let state = self.inner.lock().await;
        Ok(state
            .jobs
            .iter()
            .find(|j| j.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn latest_job_for_changelist(
        &self,
        changelist_id: i64,
    ) -> anyhow::Result<Option<Job>> {
        let state = self.inner.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|j| j.changelist_id == changelist_id)
            .max_by_key(|j| j.review_version)
            .cloned())
    }

    async fn mark_in_progress(&self, job_id: Uuid) -> anyhow::Result<bool> {
        self.transition_job(
            job_id,
            &[JobStatus::Pending, JobStatus::RetryableFailed],
            JobStatus::InProgress,
        )
        .await
    }

    async fn mark_retryable_failed(&self, job_id: Uuid) -> anyhow::Result<bool> {
        self.transition_job(job_id, &[JobStatus::InProgress], JobStatus::RetryableFailed)
            .await
    }

    async fn mark_job_failed(&self, job_id: Uuid) -> anyhow::Result<bool> {
        self.transition_job(
            job_id,
            &[
                JobStatus::Pending,
                JobStatus::InProgress,
                JobStatus::RetryableFailed,
            ],
            JobStatus::Failed,
        )
        .await
    }

    async fn mark_pending_for_replay(&self, job_id: Uuid) -> anyhow::Result<bool> {
        self.transition_job(job_id, &[JobStatus::Failed], JobStatus::Pending)
            .await
    }

    async fn set_result_ref(&self, job_id: Uuid, result_ref: &str) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state.jobs.iter_mut().find(|j| j.job_id == job_id) {
            Some(job) => {
                job.result_ref = Some(result_ref.to_string());
                job.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finalize_succeeded(&self, job_id: Uuid) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        let unsent = state
            .outbox
            .iter()
            .any(|o| o.job_id == job_id && o.notified_at.is_none());
        if unsent {
            return Ok(false);
        }
        match state.jobs.iter_mut().find(|j| j.job_id == job_id) {
            Some(job) if job.status == JobStatus::InProgress => {
                job.status = JobStatus::Succeeded;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl MemoryStore {
    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state.jobs.iter_mut().find(|j| j.job_id == job_id) {
            Some(job) if from.contains(&job.status) => {
                job.status = to;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryStore {
    async fn enqueue(&self, new: NewWorkItem) -> anyhow::Result<Uuid> {
        let mut state = self.inner.lock().await;
        Ok(insert_work_locked(&mut state, &new))
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> anyhow::Result<Option<WorkItem>> {
        let mut state = self.inner.lock().await;
        let now = Utc::now();
        let candidate = state
            .work
            .iter_mut()
            .filter(|w| w.status == WorkStatus::Queued && w.run_at <= now)
            .max_by(|a, b| {
                // priority DESC, created_at ASC
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            });
        let Some(item) = candidate else {
            return Ok(None);
        };
        item.status = WorkStatus::Running;
        item.claimed_by = Some(worker_id.to_string());
        item.lease_expires_at =
            Some(now + chrono::Duration::milliseconds(lease.as_millis() as i64));
        item.attempt_count += 1;
        item.started_at.get_or_insert(now);
        item.updated_at = now;
        Ok(Some(item.clone()))
    }

    async fn heartbeat(
        &self,
        work_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state.work.iter_mut().find(|w| {
            w.work_id == work_id
                && w.claimed_by.as_deref() == Some(worker_id)
                && w.status == WorkStatus::Running
        }) {
            Some(item) => {
                let now = Utc::now();
                item.lease_expires_at =
                    Some(now + chrono::Duration::milliseconds(lease.as_millis() as i64));
                item.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(&self, work_id: Uuid, worker_id: &str) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        Ok(finish_locked(&mut state, work_id, worker_id, WorkStatus::Completed, None))
    }

    async fn complete_and_enqueue(
        &self,
        work_id: Uuid,
        worker_id: &str,
        next: NewWorkItem,
    ) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        if !finish_locked(&mut state, work_id, worker_id, WorkStatus::Completed, None) {
            return Ok(false);
        }
        insert_work_locked(&mut state, &next);
        Ok(true)
    }

    async fn fail(
        &self,
        work_id: Uuid,
        worker_id: &str,
        error_class: ErrorClass,
        requeue_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match requeue_at {
            Some(run_at) => {
                match state.work.iter_mut().find(|w| {
                    w.work_id == work_id
                        && w.claimed_by.as_deref() == Some(worker_id)
                        && w.status == WorkStatus::Running
                }) {
                    Some(item) => {
                        item.status = WorkStatus::Queued;
                        item.run_at = run_at;
                        item.claimed_by = None;
                        item.lease_expires_at = None;
                        item.last_error_class = Some(error_class);
                        item.updated_at = Utc::now();
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            None => Ok(finish_locked(
                &mut state,
                work_id,
                worker_id,
                WorkStatus::Failed,
                Some(error_class),
            )),
        }
    }

    async fn requeue_expired(&self) -> anyhow::Result<u64> {
        let mut state = self.inner.lock().await;
        let now = Utc::now();
        let mut swept = 0u64;
        for item in state.work.iter_mut() {
            if item.status == WorkStatus::Running
                && item.lease_expires_at.is_some_and(|t| t <= now)
            {
                item.status = WorkStatus::Queued;
                item.claimed_by = None;
                item.lease_expires_at = None;
                item.updated_at = now;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn get_work(&self, work_id: Uuid) -> anyhow::Result<Option<WorkItem>> {
        let state = self.inner.lock().await;
        Ok(state.work.iter().find(|w| w.work_id == work_id).cloned())
    }

    async fn latest_for_job_stage(
        &self,
        job_id: Uuid,
        stage: Stage,
    ) -> anyhow::Result<Option<WorkItem>> {
        let state = self.inner.lock().await;
        Ok(state
            .work
            .iter()
            .filter(|w| w.job_id == job_id && w.stage == stage)
            .max_by_key(|w| w.created_at)
            .cloned())
    }

    async fn queue_counts(&self) -> anyhow::Result<QueueCounts> {
        let state = self.inner.lock().await;
        let mut counts = QueueCounts::default();
        for item in &state.work {
            match item.status {
                WorkStatus::Queued => counts.queued += 1,
                WorkStatus::Running => counts.running += 1,
                WorkStatus::Completed => counts.completed += 1,
                WorkStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

fn finish_locked(
    state: &mut State,
    work_id: Uuid,
    worker_id: &str,
    status: WorkStatus,
    error_class: Option<ErrorClass>,
) -> bool {
    match state.work.iter_mut().find(|w| {
        w.work_id == work_id
            && w.claimed_by.as_deref() == Some(worker_id)
            && w.status == WorkStatus::Running
    }) {
        Some(item) => {
            item.status = status;
            item.claimed_by = None;
            item.lease_expires_at = None;
            if let Some(class) = error_class {
                item.last_error_class = Some(class);
            }
            item.updated_at = Utc::now();
            true
        }
        None => false,
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn materialize(&self, batch: NewOutboxBatch) -> anyhow::Result<u64> {
        let mut state = self.inner.lock().await;
        let now = Utc::now();
        let mut inserted = 0u64;
        for recipient in &batch.recipients {
            let key = OutboxKey::new(batch.changelist_id, recipient.clone(), batch.review_version);
            if state.outbox.iter().any(|o| o.key == key) {
                continue;
            }
            state.outbox.push(OutboxEntry {
                key,
                job_id: batch.job_id,
                status: OutboxStatus::Pending,
                notification_id: None,
                notified_at: None,
                send_started_at: None,
                provider_verified_at: None,
                attempt_count: 0,
                last_error: None,
                updated_at: now,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn outbox_entry(&self, key: &OutboxKey) -> anyhow::Result<Option<OutboxEntry>> {
        let state = self.inner.lock().await;
        Ok(state.outbox.iter().find(|o| o.key == *key).cloned())
    }

    async fn pending_for_job(&self, job_id: Uuid) -> anyhow::Result<Vec<OutboxEntry>> {
        let state = self.inner.lock().await;
        let mut rows: Vec<OutboxEntry> = state
            .outbox
            .iter()
            .filter(|o| o.job_id == job_id && o.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.key.recipient.cmp(&b.key.recipient));
        Ok(rows)
    }

    async fn unresolved_for_job(&self, job_id: Uuid) -> anyhow::Result<Vec<OutboxEntry>> {
        let state = self.inner.lock().await;
        let mut rows: Vec<OutboxEntry> = state
            .outbox
            .iter()
            .filter(|o| o.job_id == job_id && o.notified_at.is_none())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.key.recipient.cmp(&b.key.recipient));
        Ok(rows)
    }

    async fn begin_send_attempt(&self, key: &OutboxKey) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state.outbox.iter_mut().find(|o| {
            o.key == *key && o.status == OutboxStatus::Pending && o.notified_at.is_none()
        }) {
            Some(entry) => {
                entry.attempt_count += 1;
                entry.send_started_at = Some(Utc::now());
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_sent(&self, key: &OutboxKey, notification_id: &str) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        if state.fail_next_mark_sent {
            state.fail_next_mark_sent = false;
            return Err(anyhow!("injected: mark_sent write lost"));
        }
        match state
            .outbox
            .iter_mut()
            .find(|o| o.key == *key && o.notified_at.is_none())
        {
            Some(entry) => {
                entry.notification_id = Some(notification_id.to_string());
                entry.notified_at = Some(Utc::now());
                entry.status = OutboxStatus::Sent;
                entry.send_started_at = None;
                entry.last_error = None;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_notification_id(
        &self,
        key: &OutboxKey,
        notification_id: &str,
    ) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state
            .outbox
            .iter_mut()
            .find(|o| o.key == *key && o.notified_at.is_none())
        {
            Some(entry) => {
                entry.notification_id = Some(notification_id.to_string());
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn backfill_notified(
        &self,
        key: &OutboxKey,
        notification_id: &str,
    ) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state
            .outbox
            .iter_mut()
            .find(|o| o.key == *key && o.notified_at.is_none())
        {
            Some(entry) => {
                if entry.notification_id.is_none() {
                    entry.notification_id = Some(notification_id.to_string());
                }
                entry.notified_at = Some(Utc::now());
                entry.status = OutboxStatus::Sent;
                entry.send_started_at = None;
                // Backfill comes from a provider lookup: already verified.
                entry.provider_verified_at = Some(Utc::now());
                entry.last_error = None;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear_send_sentinel(
        &self,
        key: &OutboxKey,
        last_error: Option<&str>,
    ) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state
            .outbox
            .iter_mut()
            .find(|o| o.key == *key && o.notified_at.is_none())
        {
            Some(entry) => {
                entry.send_started_at = None;
                if let Some(err) = last_error {
                    entry.last_error = Some(err.to_string());
                }
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed_permanent(
        &self,
        key: &OutboxKey,
        last_error: &str,
    ) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state
            .outbox
            .iter_mut()
            .find(|o| o.key == *key && o.notified_at.is_none())
        {
            Some(entry) => {
                entry.status = OutboxStatus::FailedPermanent;
                entry.last_error = Some(last_error.to_string());
                entry.send_started_at = None;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ambiguous_entries(&self, limit: i64) -> anyhow::Result<Vec<OutboxEntry>> {
        let state = self.inner.lock().await;
        let mut rows: Vec<OutboxEntry> = state
            .outbox
            .iter()
            .filter(|o| o.is_ambiguous())
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.updated_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn sent_for_reconciliation(&self, limit: i64) -> anyhow::Result<Vec<OutboxEntry>> {
        let state = self.inner.lock().await;
        let mut rows: Vec<OutboxEntry> = state
            .outbox
            .iter()
            .filter(|o| o.status == OutboxStatus::Sent && o.provider_verified_at.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.updated_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn mark_provider_verified(&self, key: &OutboxKey) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state
            .outbox
            .iter_mut()
            .find(|o| o.key == *key && o.status == OutboxStatus::Sent)
        {
            Some(entry) => {
                entry.provider_verified_at = Some(Utc::now());
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_provider_evidence_missing(
        &self,
        key: &OutboxKey,
        detail: &str,
    ) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state
            .outbox
            .iter_mut()
            .find(|o| o.key == *key && o.status == OutboxStatus::Sent)
        {
            Some(entry) => {
                entry.provider_verified_at = Some(Utc::now());
                entry.last_error = Some(detail.to_string());
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStore {
    async fn record_dead_letter(&self, new: NewDeadLetter) -> anyhow::Result<DeadLetter> {
        let mut state = self.inner.lock().await;
        let now = Utc::now();
        if let Some(existing) = state
            .dead_letters
            .iter_mut()
            .find(|dl| dl.job_id == new.job_id && dl.stage == new.stage)
        {
            existing.status = if existing.status == DeadLetterStatus::Replaying
                && existing.error_class == new.error_class
            {
                DeadLetterStatus::Reopened
            } else {
                DeadLetterStatus::Open
            };
            existing.error_class = new.error_class;
            existing.last_stack = new.last_stack;
            existing.sanitized_context = new.sanitized_context;
            existing.last_failure_at = now;
            existing.attempt_count = new.attempt_count;
            return Ok(existing.clone());
        }
        let dead_letter = DeadLetter {
            dl_id: Uuid::new_v4(),
            job_id: new.job_id,
            stage: new.stage,
            error_class: new.error_class,
            last_stack: new.last_stack,
            sanitized_context: new.sanitized_context,
            first_failure_at: now,
            last_failure_at: now,
            attempt_count: new.attempt_count,
            status: DeadLetterStatus::Open,
            remediation_evidence_ref: None,
        };
        state.dead_letters.push(dead_letter.clone());
        Ok(dead_letter)
    }

    async fn get_dead_letter(&self, dl_id: Uuid) -> anyhow::Result<Option<DeadLetter>> {
        let state = self.inner.lock().await;
        Ok(state.dead_letters.iter().find(|dl| dl.dl_id == dl_id).cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> anyhow::Result<Vec<DeadLetter>> {
        let state = self.inner.lock().await;
        let mut rows: Vec<DeadLetter> = state
            .dead_letters
            .iter()
            .filter(|dl| {
                filter.error_class.map_or(true, |c| dl.error_class == c)
                    && filter.stage.map_or(true, |s| dl.stage == s)
                    && filter.status.map_or(true, |s| dl.status == s)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.last_failure_at.cmp(&a.last_failure_at));
        Ok(rows)
    }

    async fn mark_replaying(&self, dl_id: Uuid, evidence_ref: &str) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state.dead_letters.iter_mut().find(|dl| {
            dl.dl_id == dl_id
                && matches!(
                    dl.status,
                    DeadLetterStatus::Open | DeadLetterStatus::Reopened
                )
        }) {
            Some(dl) => {
                dl.status = DeadLetterStatus::Replaying;
                dl.remediation_evidence_ref = Some(evidence_ref.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_resolved(&self, dl_id: Uuid) -> anyhow::Result<bool> {
        let mut state = self.inner.lock().await;
        match state.dead_letters.iter_mut().find(|dl| {
            dl.dl_id == dl_id && dl.status != DeadLetterStatus::Resolved
        }) {
            Some(dl) => {
                dl.status = DeadLetterStatus::Resolved;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn record_audit(&self, event: NewAuditEvent) -> anyhow::Result<()> {
        let mut state = self.inner.lock().await;
        state.audit.push(AuditRecord {
            kind: event.kind.as_str(),
            job_id: event.job_id,
            detail: event.detail,
        });
        Ok(())
    }
}

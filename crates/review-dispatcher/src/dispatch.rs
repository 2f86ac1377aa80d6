//! Job creation, idempotency-key dedupe, and versioned rerun gating.

use crate::{config::DispatcherConfig, payloads::FetchPayload};
use anyhow::Context;
use review_core::{
    store::{AuditKind, AuditLog, JobStore, NewAuditEvent, Store},
    Job, JobStatus, NewJob, NewWorkItem, Stage,
};
use std::sync::Arc;

/// Outcome of a rerun request. `Allowed` carries either the newly created job
/// or, for a same-version re-request on a succeeded job, the prior job.
#[derive(Debug)]
pub enum RerunOutcome {
    Allowed(Job),
    Blocked(String),
}

#[derive(Clone)]
pub struct JobDispatch {
    store: Arc<dyn Store>,
    default_priority: i32,
}

impl JobDispatch {
    pub fn new(store: Arc<dyn Store>, cfg: &DispatcherConfig) -> Self {
        Self {
            store,
            default_priority: cfg.default_priority,
        }
    }

    /// Create a job and enqueue its fetch stage; a duplicate idempotency key
    /// returns the existing job with nothing enqueued.
    pub async fn create_job(
        &self,
        idempotency_key: &str,
        changelist_id: i64,
        review_version: i64,
        recipients: &[String],
    ) -> anyhow::Result<Job> {
        let new = NewJob::new(idempotency_key, changelist_id, review_version);
        let payload = serde_json::to_value(FetchPayload {
            changelist_id,
            review_version,
            recipients: recipients.to_vec(),
        })
        .context("encode fetch payload")?;
        let work = NewWorkItem::now(new.job_id, Stage::Fetch, payload, self.default_priority);

        let outcome = self.store.create_job(new, work).await?;
        if outcome.was_inserted() {
            let job = outcome.into_inner();
            tracing::info!(
                event = "review.dispatch.job_created",
                job_id = %job.job_id,
                changelist_id,
                review_version,
                "job created"
            );
            self.store
                .record_audit(NewAuditEvent {
                    kind: AuditKind::JobCreated,
                    job_id: Some(job.job_id),
                    detail: serde_json::json!({
                        "changelist_id": changelist_id,
                        "review_version": review_version,
                        "recipients": recipients.len(),
                    }),
                })
                .await?;
            return Ok(job);
        }

        let job = outcome.into_inner();
        tracing::info!(
            event = "review.dispatch.job_deduped",
            job_id = %job.job_id,
            idempotency_key,
            "duplicate idempotency key returned existing job"
        );
        Ok(job)
    }

    /// Gate a versioned rerun against the changelist's most recent job.
    ///
    /// A rerun is allowed when the latest job `succeeded` and the requested
    /// version is strictly greater. The same version on a succeeded job is a
    /// no-op returning the prior job. A rerun of a `failed` latest job needs a
    /// caller-supplied idempotency key distinct from every prior one, and
    /// still a strictly greater version. Non-terminal jobs block reruns.
    pub async fn request_rerun(
        &self,
        changelist_id: i64,
        new_review_version: i64,
        idempotency_key: Option<&str>,
        recipients: &[String],
    ) -> anyhow::Result<RerunOutcome> {
        let Some(latest) = self.store.latest_job_for_changelist(changelist_id).await? else {
            return Ok(RerunOutcome::Blocked(format!(
                "no prior job for changelist {changelist_id}"
            )));
        };

        match latest.status {
            JobStatus::Succeeded => {
                if new_review_version == latest.review_version {
                    return Ok(RerunOutcome::Allowed(latest));
                }
                if new_review_version < latest.review_version {
                    return Ok(RerunOutcome::Blocked(format!(
                        "review_version must exceed {} (got {new_review_version})",
                        latest.review_version
                    )));
                }
                let key = match idempotency_key {
                    Some(key) => key.to_string(),
                    None => format!("rerun:{changelist_id}:{new_review_version}"),
                };
                let job = self
                    .create_job(&key, changelist_id, new_review_version, recipients)
                    .await?;
                Ok(RerunOutcome::Allowed(job))
            }
            JobStatus::Failed => {
                let Some(key) = idempotency_key else {
                    return Ok(RerunOutcome::Blocked(
                        "rerun of a failed job requires a fresh idempotency key".to_string(),
                    ));
                };
                if new_review_version <= latest.review_version {
                    return Ok(RerunOutcome::Blocked(format!(
                        "review_version must exceed {} (got {new_review_version})",
                        latest.review_version
                    )));
                }
                if self.key_in_use(key).await? {
                    return Ok(RerunOutcome::Blocked(format!(
                        "idempotency key {key:?} was already used"
                    )));
                }
                let job = self
                    .create_job(key, changelist_id, new_review_version, recipients)
                    .await?;
                Ok(RerunOutcome::Allowed(job))
            }
            JobStatus::Pending | JobStatus::InProgress | JobStatus::RetryableFailed => {
                Ok(RerunOutcome::Blocked(format!(
                    "latest job {} is still {}",
                    latest.job_id, latest.status
                )))
            }
        }
    }

    async fn key_in_use(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.store.job_by_idempotency_key(key).await?.is_some())
    }
}

/// Where a job's validated result payload is addressed.
pub fn result_ref(changelist_id: i64, review_version: i64) -> String {
    format!("reviews/{changelist_id}/v{review_version}.json")
}

//! Stage-failure handling: classification, retry budgeting, dead-lettering,
//! and operator replay.

use anyhow::{bail, Context};
use chrono::Utc;
use review_core::{
    classify, redact, retry_after_of,
    store::{AuditKind, AuditLog, DeadLetterStore, JobStore, NewAuditEvent, Store, WorkQueue},
    DeadLetter, DeadLetterFilter, ErrorClass, NewDeadLetter, NewWorkItem, RestartMode,
    RetryPolicy, Stage, WorkItem,
};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct FailurePipeline {
    store: Arc<dyn Store>,
    policy: RetryPolicy,
}

impl FailurePipeline {
    pub fn new(store: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Route a stage failure: retryable classes with budget remaining are
    /// requeued with full-jitter backoff; everything else dead-letters the
    /// job. A lost lease makes every write here a no-op and the sweeper owns
    /// recovery.
    pub async fn handle_stage_failure(
        &self,
        item: &WorkItem,
        worker_id: &str,
        err: anyhow::Error,
    ) -> anyhow::Result<()> {
        let class = classify(&err);
        let retry_after = retry_after_of(&err);

        if class.is_retryable() && !self.policy.budget_exhausted(item.attempt_count) {
            let delay = self.policy.next_delay(item.attempt_count, retry_after);
            let run_at = Utc::now()
                + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64);
            let owned = self
                .store
                .fail(item.work_id, worker_id, class, Some(run_at))
                .await?;
            if !owned {
                return Ok(());
            }
            self.store.mark_retryable_failed(item.job_id).await?;
            tracing::warn!(
                event = "review.failure.retry_scheduled",
                job_id = %item.job_id,
                stage = %item.stage,
                error_class = %class,
                attempt = item.attempt_count,
                delay_ms = delay.as_millis() as u64,
                "stage failed; retry scheduled"
            );
            return Ok(());
        }

        let owned = self.store.fail(item.work_id, worker_id, class, None).await?;
        if !owned {
            return Ok(());
        }
        self.dead_letter(item, class, &err).await
    }

    async fn dead_letter(
        &self,
        item: &WorkItem,
        class: ErrorClass,
        err: &anyhow::Error,
    ) -> anyhow::Result<()> {
        let payload_bytes = serde_json::to_vec(&item.payload).unwrap_or_default();
        let context = serde_json::json!({
            "work_id": item.work_id,
            "stage": item.stage.as_str(),
            "attempt_count": item.attempt_count,
            "error_class": class.as_str(),
            "payload_sha": redact::payload_fingerprint(&payload_bytes),
        });
        let dl = self
            .store
            .record_dead_letter(NewDeadLetter {
                job_id: item.job_id,
                stage: item.stage,
                error_class: class,
                last_stack: redact::scrub(&format!("{err:#}")),
                sanitized_context: context,
                attempt_count: item.attempt_count,
            })
            .await?;
        self.store.mark_job_failed(item.job_id).await?;
        self.store
            .record_audit(NewAuditEvent {
                kind: AuditKind::DeadLettered,
                job_id: Some(item.job_id),
                detail: serde_json::json!({
                    "dl_id": dl.dl_id,
                    "stage": item.stage.as_str(),
                    "error_class": class.as_str(),
                    "status": dl.status.as_str(),
                }),
            })
            .await?;
        self.store
            .record_audit(NewAuditEvent {
                kind: AuditKind::JobFailed,
                job_id: Some(item.job_id),
                detail: serde_json::json!({ "error_class": class.as_str() }),
            })
            .await?;
        tracing::error!(
            event = "review.failure.dead_lettered",
            job_id = %item.job_id,
            dl_id = %dl.dl_id,
            stage = %item.stage,
            error_class = %class,
            dl_status = %dl.status,
            attempt_count = item.attempt_count,
            "job dead-lettered"
        );
        Ok(())
    }

    pub async fn list(&self, filter: &DeadLetterFilter) -> anyhow::Result<Vec<DeadLetter>> {
        self.store.list_dead_letters(filter).await
    }

    /// Re-enter the pipeline for a dead-lettered job. Requires non-empty
    /// remediation evidence; re-enters at the failed stage unless a full
    /// restart is requested. The new work item starts with a fresh attempt
    /// budget.
    pub async fn replay(
        &self,
        dl_id: Uuid,
        restart_mode: RestartMode,
        remediation_evidence_ref: &str,
    ) -> anyhow::Result<()> {
        if remediation_evidence_ref.trim().is_empty() {
            bail!("replay requires a remediation evidence reference");
        }
        let dl = self
            .store
            .get_dead_letter(dl_id)
            .await?
            .with_context(|| format!("unknown dead letter {dl_id}"))?;
        if !self.store.mark_replaying(dl_id, remediation_evidence_ref).await? {
            bail!("dead letter {dl_id} is not in a replayable state ({})", dl.status);
        }

        let stage = match restart_mode {
            RestartMode::ResumeAtFailedStage => dl.stage,
            RestartMode::FullRestart => Stage::Fetch,
        };
        let prior = self
            .store
            .latest_for_job_stage(dl.job_id, stage)
            .await?
            .with_context(|| format!("no prior {stage} work for job {}", dl.job_id))?;

        self.store.mark_pending_for_replay(dl.job_id).await?;
        self.store
            .enqueue(NewWorkItem::now(
                dl.job_id,
                stage,
                prior.payload.clone(),
                prior.priority,
            ))
            .await?;
        self.store
            .record_audit(NewAuditEvent {
                kind: AuditKind::ReplayRequested,
                job_id: Some(dl.job_id),
                detail: serde_json::json!({
                    "dl_id": dl_id,
                    "stage": stage.as_str(),
                    "restart_mode": match restart_mode {
                        RestartMode::ResumeAtFailedStage => "resume_at_failed_stage",
                        RestartMode::FullRestart => "full_restart",
                    },
                    "evidence_ref": remediation_evidence_ref,
                }),
            })
            .await?;
        tracing::info!(
            event = "review.failure.replay",
            job_id = %dl.job_id,
            dl_id = %dl_id,
            stage = %stage,
            "dead letter replay enqueued"
        );
        Ok(())
    }
}

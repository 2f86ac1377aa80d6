//! The worker loop: claim under lease, process the stage, finalize.
//!
//! Ownership is cooperative: a heartbeat task renews the lease and flips a
//! watch flag the moment a renewal affects zero rows. Stage code checks that
//! flag before every ownership-requiring side effect and exits silently on
//! loss; the expired-lease sweeper owns recovery from there. Owner predicates
//! in the store make any late write from a dispossessed worker a no-op.

use crate::{
    config::DispatcherConfig,
    delivery::OutboxDelivery,
    dispatch::result_ref,
    failure::FailurePipeline,
    payloads::{FetchPayload, LlmPayload, NotifyPayload},
};
use review_core::{
    prompt::build_review_request,
    store::{AuditKind, AuditLog, JobStore, NewAuditEvent, OutboxStore, Store, WorkQueue},
    validator::{validate, DiagnosticCode, ValidationOutcome},
    ChangeSet, ClassifiedError, ErrorClass, Fetcher, JobStatus, ModelClient, NewOutboxBatch,
    NewWorkItem, NotificationProvider, Stage, WorkItem,
};
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use uuid::Uuid;

/// Why a stage stopped without completing.
enum StageError {
    /// The lease was observed lost; exit silently, the sweeper recovers.
    LeaseLost,
    /// A real failure for the failure pipeline to classify.
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        StageError::Failed(err)
    }
}

impl From<ClassifiedError> for StageError {
    fn from(err: ClassifiedError) -> Self {
        StageError::Failed(err.into())
    }
}

type StageResult = Result<(), StageError>;

#[derive(Clone)]
pub struct Worker {
    worker_id: String,
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetcher>,
    model: Arc<dyn ModelClient>,
    delivery: OutboxDelivery,
    failures: FailurePipeline,
    cfg: DispatcherConfig,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn Store>,
        fetcher: Arc<dyn Fetcher>,
        model: Arc<dyn ModelClient>,
        provider: Arc<dyn NotificationProvider>,
        cfg: DispatcherConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            delivery: OutboxDelivery::new(store.clone(), provider, cfg.external_timeout()),
            failures: FailurePipeline::new(store.clone(), cfg.retry_policy()),
            store,
            fetcher,
            model,
            cfg,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            event = "review.worker.started",
            worker_id = %self.worker_id,
            "worker started"
        );
        loop {
            if *shutdown.borrow() {
                tracing::info!(
                    event = "review.worker.stopped",
                    worker_id = %self.worker_id,
                    "worker shutting down"
                );
                return Ok(());
            }
            match self.store.claim(&self.worker_id, self.cfg.lease()).await {
                Ok(Some(item)) => {
                    if let Err(err) = self.process(item).await {
                        tracing::warn!(
                            event = "review.worker.process_error",
                            worker_id = %self.worker_id,
                            error = %err,
                            "work processing failed"
                        );
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.poll_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        event = "review.worker.claim_error",
                        worker_id = %self.worker_id,
                        error = %err,
                        "claim failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.poll_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Process eligible work until the queue is momentarily empty. Returns
    /// the number of items processed; retries scheduled in the future are not
    /// waited for.
    pub async fn run_until_idle(&self) -> anyhow::Result<u32> {
        let mut processed = 0u32;
        while let Some(item) = self.store.claim(&self.worker_id, self.cfg.lease()).await? {
            self.process(item).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process(&self, item: WorkItem) -> anyhow::Result<()> {
        tracing::info!(
            event = "review.worker.claimed",
            worker_id = %self.worker_id,
            work_id = %item.work_id,
            job_id = %item.job_id,
            stage = %item.stage,
            attempt = item.attempt_count,
            "claimed work"
        );
        self.store.mark_in_progress(item.job_id).await?;

        let (lease_lost_tx, lease_lost_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            item.work_id,
            self.worker_id.clone(),
            self.cfg.lease(),
            self.cfg.heartbeat_interval(),
            lease_lost_tx,
        ));

        let result = self.run_stage(&item, &lease_lost_rx).await;
        heartbeat.abort();

        match result {
            Ok(()) => Ok(()),
            Err(StageError::LeaseLost) => {
                tracing::warn!(
                    event = "review.worker.lease_lost",
                    worker_id = %self.worker_id,
                    work_id = %item.work_id,
                    "lease lost; abandoning without further side effects"
                );
                Ok(())
            }
            Err(StageError::Failed(err)) => {
                self.failures
                    .handle_stage_failure(&item, &self.worker_id, err)
                    .await
            }
        }
    }

    async fn run_stage(&self, item: &WorkItem, lease: &watch::Receiver<bool>) -> StageResult {
        match item.stage {
            Stage::Fetch => self.run_fetch(item, lease).await,
            Stage::Llm => self.run_llm(item, lease).await,
            Stage::Notify => self.run_notify(item, lease).await,
        }
    }

    async fn run_fetch(&self, item: &WorkItem, lease: &watch::Receiver<bool>) -> StageResult {
        let payload: FetchPayload = decode_payload(&item.payload)?;

        let change_set = self.fetch_with_deadline(payload.changelist_id).await?;
        ensure_owned(lease)?;

        let next = LlmPayload {
            changelist_id: payload.changelist_id,
            review_version: payload.review_version,
            recipients: payload.recipients,
            change_set,
        };
        self.hand_off(item, Stage::Llm, serde_json::to_value(next))
            .await
    }

    async fn fetch_with_deadline(&self, changelist_id: i64) -> Result<ChangeSet, StageError> {
        let fetched = tokio::time::timeout(
            self.cfg.external_timeout(),
            self.fetcher.fetch(changelist_id, &self.cfg.fetch_allow_list),
        )
        .await;
        match fetched {
            Err(_) => Err(ClassifiedError::timeout(format!(
                "fetch of changelist {changelist_id} exceeded deadline"
            ))
            .into()),
            Ok(Err(cerr)) => Err(cerr.into()),
            Ok(Ok(change_set)) => Ok(change_set),
        }
    }

    async fn run_llm(&self, item: &WorkItem, lease: &watch::Receiver<bool>) -> StageResult {
        let payload: LlmPayload = decode_payload(&item.payload)?;
        let (prompt, diff) = build_review_request(
            payload.changelist_id,
            &payload.change_set,
            &self.cfg.schema_version(),
            &self.cfg.prompt_version(),
        );
        let raw = self
            .model
            .review(&prompt, &diff, self.cfg.external_timeout())
            .await
            .map_err(StageError::from)?;
        ensure_owned(lease)?;

        let outcome = validate(
            &raw,
            &payload.change_set.changed_files,
            &self.cfg.validator_config(),
        );
        for diagnostic in outcome.diagnostics() {
            tracing::debug!(
                event = "review.validator.diagnostic",
                job_id = %item.job_id,
                code = diagnostic.code.as_str(),
                finding_id = diagnostic.finding_id.as_deref().unwrap_or(""),
                field = diagnostic.field.as_deref().unwrap_or(""),
                detail = %diagnostic.detail,
                "validator diagnostic"
            );
        }

        let result = match outcome {
            ValidationOutcome::Rejected { diagnostics } => {
                let class = rejection_class(diagnostics.iter().map(|d| d.code));
                tracing::warn!(
                    event = "review.validator.rejected",
                    job_id = %item.job_id,
                    error_class = %class,
                    diagnostics = diagnostics.len(),
                    "model response rejected"
                );
                return Err(ClassifiedError::new(
                    class,
                    "model response rejected by output contract",
                )
                .into());
            }
            ValidationOutcome::Accepted { result, .. } => result,
        };

        self.store
            .set_result_ref(
                item.job_id,
                &result_ref(payload.changelist_id, payload.review_version),
            )
            .await?;
        self.store
            .materialize(NewOutboxBatch {
                job_id: item.job_id,
                changelist_id: payload.changelist_id,
                review_version: payload.review_version,
                recipients: payload.recipients.clone(),
            })
            .await?;
        ensure_owned(lease)?;

        let next = NotifyPayload {
            changelist_id: payload.changelist_id,
            review_version: payload.review_version,
            recipients: payload.recipients,
            finding_count: result.findings.len(),
            summary: result.summary,
        };
        self.hand_off(item, Stage::Notify, serde_json::to_value(next))
            .await
    }

    async fn run_notify(&self, item: &WorkItem, lease: &watch::Receiver<bool>) -> StageResult {
        let payload: NotifyPayload = decode_payload(&item.payload)?;
        let mut report = self.delivery.deliver_pending(item.job_id, &payload).await?;
        ensure_owned(lease)?;

        if !report.retryable.is_empty() {
            return Err(report.retryable.remove(0).into());
        }
        if !report.permanent.is_empty() {
            return Err(report.permanent.remove(0).into());
        }

        if self.store.finalize_succeeded(item.job_id).await? {
            self.store
                .record_audit(NewAuditEvent {
                    kind: AuditKind::JobSucceeded,
                    job_id: Some(item.job_id),
                    detail: serde_json::json!({ "sent": report.sent }),
                })
                .await?;
            tracing::info!(
                event = "review.worker.job_succeeded",
                job_id = %item.job_id,
                sent = report.sent,
                "job finalized"
            );
        } else {
            let already_done = self
                .store
                .get_job(item.job_id)
                .await?
                .is_some_and(|job| job.status == JobStatus::Succeeded);
            if !already_done {
                return Err(ClassifiedError::invariant(format!(
                    "job {} not finalizable after full delivery",
                    item.job_id
                ))
                .into());
            }
        }

        if !self.store.complete(item.work_id, &self.worker_id).await? {
            return Err(StageError::LeaseLost);
        }
        Ok(())
    }

    /// Owner-guarded stage hand-off; a zero-row completion means the lease is
    /// gone and nothing was enqueued.
    async fn hand_off(
        &self,
        item: &WorkItem,
        next_stage: Stage,
        payload: serde_json::Result<serde_json::Value>,
    ) -> StageResult {
        let payload = payload.map_err(|err| {
            StageError::from(ClassifiedError::invariant(format!(
                "encode {next_stage} payload: {err}"
            )))
        })?;
        let next = NewWorkItem::now(item.job_id, next_stage, payload, item.priority);
        if !self
            .store
            .complete_and_enqueue(item.work_id, &self.worker_id, next)
            .await?
        {
            return Err(StageError::LeaseLost);
        }
        tracing::info!(
            event = "review.worker.stage_complete",
            worker_id = %self.worker_id,
            job_id = %item.job_id,
            stage = %item.stage,
            next_stage = %next_stage,
            "stage complete"
        );
        Ok(())
    }
}

fn ensure_owned(lease: &watch::Receiver<bool>) -> StageResult {
    if *lease.borrow() {
        Err(StageError::LeaseLost)
    } else {
        Ok(())
    }
}

fn decode_payload<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, StageError> {
    serde_json::from_value(payload.clone()).map_err(|err| {
        StageError::from(ClassifiedError::invariant(format!(
            "malformed stage payload: {err}"
        )))
    })
}

/// Map a rejected payload's primary diagnostic to its failure class.
fn rejection_class(codes: impl Iterator<Item = DiagnosticCode>) -> ErrorClass {
    for code in codes {
        match code {
            DiagnosticCode::InvalidJson => return ErrorClass::InvalidJson,
            DiagnosticCode::MissingRequiredField => return ErrorClass::MissingField,
            DiagnosticCode::SchemaMismatch | DiagnosticCode::IncompatibleVersion => {
                return ErrorClass::SchemaInvalid
            }
            _ => continue,
        }
    }
    ErrorClass::SchemaInvalid
}

async fn heartbeat_loop(
    store: Arc<dyn Store>,
    work_id: Uuid,
    worker_id: String,
    lease: Duration,
    interval: Duration,
    lease_lost: watch::Sender<bool>,
) {
    loop {
        tokio::time::sleep(interval).await;
        match store.heartbeat(work_id, &worker_id, lease).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    event = "review.worker.heartbeat_rejected",
                    worker_id = %worker_id,
                    work_id = %work_id,
                    "heartbeat affected 0 rows; lease lost"
                );
                let _ = lease_lost.send(true);
                return;
            }
            Err(err) => {
                tracing::warn!(
                    event = "review.worker.heartbeat_error",
                    worker_id = %worker_id,
                    work_id = %work_id,
                    error = %err,
                    "heartbeat failed; will retry"
                );
            }
        }
    }
}

//! The in-process service surface and the runtime that hosts workers and
//! maintenance loops.

use crate::{
    config::DispatcherConfig,
    delivery::OutboxDelivery,
    dispatch::{JobDispatch, RerunOutcome},
    failure::FailurePipeline,
    sweeper::{reconcile_loop, sweeper_loop},
    worker::Worker,
};
use anyhow::Context;
use review_core::{
    store::{JobStore, QueueCounts, Store, WorkQueue},
    DeadLetter, DeadLetterFilter, Fetcher, Job, ModelClient, NotificationProvider, RestartMode,
};
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

/// The service contract exposed to callers: submission, inspection, reruns,
/// and dead-letter triage/replay.
#[derive(Clone)]
pub struct ReviewService {
    store: Arc<dyn Store>,
    dispatch: JobDispatch,
    failures: FailurePipeline,
}

impl ReviewService {
    pub fn new(store: Arc<dyn Store>, cfg: &DispatcherConfig) -> Self {
        Self {
            dispatch: JobDispatch::new(store.clone(), cfg),
            failures: FailurePipeline::new(store.clone(), cfg.retry_policy()),
            store,
        }
    }

    pub async fn submit_review(
        &self,
        idempotency_key: &str,
        changelist_id: i64,
        review_version: i64,
        recipients: &[String],
    ) -> anyhow::Result<Job> {
        self.dispatch
            .create_job(idempotency_key, changelist_id, review_version, recipients)
            .await
    }

    pub async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        self.store.get_job(job_id).await
    }

    pub async fn request_rerun(
        &self,
        changelist_id: i64,
        new_review_version: i64,
        idempotency_key: Option<&str>,
        recipients: &[String],
    ) -> anyhow::Result<RerunOutcome> {
        self.dispatch
            .request_rerun(changelist_id, new_review_version, idempotency_key, recipients)
            .await
    }

    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> anyhow::Result<Vec<DeadLetter>> {
        self.failures.list(filter).await
    }

    pub async fn replay(
        &self,
        dl_id: Uuid,
        restart_mode: RestartMode,
        remediation_evidence_ref: &str,
    ) -> anyhow::Result<()> {
        self.failures
            .replay(dl_id, restart_mode, remediation_evidence_ref)
            .await
    }

    /// Work-queue status counts, for operator dashboards.
    pub async fn queue_counts(&self) -> anyhow::Result<QueueCounts> {
        self.store.queue_counts().await
    }
}

/// A running pipeline: worker loops plus the sweeper and reconciler.
pub struct Pipeline {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl Pipeline {
    pub fn start(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn Fetcher>,
        model: Arc<dyn ModelClient>,
        provider: Arc<dyn NotificationProvider>,
        cfg: DispatcherConfig,
        worker_count: usize,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        for i in 0..worker_count.max(1) {
            let worker = Worker::new(
                format!("worker-{i}"),
                store.clone(),
                fetcher.clone(),
                model.clone(),
                provider.clone(),
                cfg.clone(),
            );
            let shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
        }

        handles.push(tokio::spawn(sweeper_loop(
            store.clone(),
            std::time::Duration::from_millis(cfg.sweep_ms),
            shutdown_rx.clone(),
        )));

        let delivery = OutboxDelivery::new(store, provider, cfg.external_timeout());
        handles.push(tokio::spawn(reconcile_loop(
            delivery,
            std::time::Duration::from_millis(cfg.reconcile_ms),
            cfg.reconcile_batch,
            shutdown_rx,
        )));

        Self {
            shutdown_tx,
            handles,
        }
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            handle.await.context("join pipeline task")??;
        }
        Ok(())
    }
}

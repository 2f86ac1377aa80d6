//! Background maintenance loops: the expired-lease sweeper and the outbox
//! reconciler. Both are idempotent and safe to run on several hosts at once;
//! the store's predicates do the coordination.

use crate::delivery::OutboxDelivery;
use review_core::store::{Store, WorkQueue};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

pub async fn sweeper_loop(
    store: Arc<dyn Store>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        match store.requeue_expired().await {
            Ok(0) => {}
            Ok(swept) => {
                tracing::info!(
                    event = "review.sweeper.requeued",
                    swept,
                    "requeued expired leases"
                );
            }
            Err(err) => {
                tracing::warn!(
                    event = "review.sweeper.error",
                    error = %err,
                    "sweep failed"
                );
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

pub async fn reconcile_loop(
    delivery: OutboxDelivery,
    interval: Duration,
    batch: i64,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        match delivery.reconcile_ambiguous(batch).await {
            Ok(0) => {}
            Ok(repaired) => {
                tracing::info!(
                    event = "review.reconciler.repaired",
                    repaired,
                    "backfilled ambiguous outbox rows"
                );
            }
            Err(err) => {
                tracing::warn!(
                    event = "review.reconciler.error",
                    error = %err,
                    "reconciliation failed"
                );
            }
        }
        match delivery.verify_sent(batch).await {
            Ok(0) => {}
            Ok(confirmed) => {
                tracing::info!(
                    event = "review.reconciler.verified",
                    confirmed,
                    "confirmed sent rows against provider truth"
                );
            }
            Err(err) => {
                tracing::warn!(
                    event = "review.reconciler.verify_error",
                    error = %err,
                    "sent-row verification failed"
                );
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

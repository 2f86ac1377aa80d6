//! Postgres-backed smoke tests for the store's concurrency contract.
//!
//! These run only when `REVIEW_TEST_DATABASE_URL` points at a disposable
//! Postgres database; without it each test is a no-op so the suite stays
//! green on machines without a database.

use anyhow::Context;
use review_core::{
    store::{JobStore, OutboxStore, WorkQueue},
    ErrorClass, NewJob, NewOutboxBatch, NewWorkItem, OutboxKey, Stage, WorkStatus,
};
use review_store::{migrate, PgStore};
use std::{
    sync::{Once, OnceLock},
    time::Duration,
};
use uuid::Uuid;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

async fn integration_lock() -> tokio::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
        .lock()
        .await
}

/// Connect and reset state, or `None` when no test database is configured.
async fn test_store() -> anyhow::Result<Option<PgStore>> {
    init_tracing();
    let Ok(url) = std::env::var("REVIEW_TEST_DATABASE_URL") else {
        tracing::warn!("REVIEW_TEST_DATABASE_URL unset; skipping postgres test");
        return Ok(None);
    };

    let store = PgStore::connect(&url, 5).await?;
    migrate::run(store.pool()).await.context("run migrations")?;
    sqlx::query("TRUNCATE jobs, work_queue, outbox, dead_letters, audit RESTART IDENTITY CASCADE")
        .execute(store.pool())
        .await
        .context("truncate state tables")?;
    Ok(Some(store))
}

fn new_job(changelist_id: i64, version: i64) -> NewJob {
    NewJob::new(format!("key-{}", Uuid::new_v4()), changelist_id, version)
}

fn fetch_work(job_id: Uuid) -> NewWorkItem {
    NewWorkItem::now(job_id, Stage::Fetch, serde_json::json!({}), 0)
}

#[tokio::test]
async fn duplicate_job_insert_returns_existing_row() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };

    let new = new_job(42, 1);
    let key = new.idempotency_key.clone();
    let first = store.create_job(new, fetch_work(Uuid::new_v4())).await?;
    anyhow::ensure!(first.was_inserted(), "first insert should create the row");
    let first = first.into_inner();

    let mut dup = NewJob::new(key, 42, 1);
    dup.job_id = Uuid::new_v4();
    let second = store.create_job(dup, fetch_work(Uuid::new_v4())).await?;
    anyhow::ensure!(!second.was_inserted(), "duplicate insert must not create");
    anyhow::ensure!(second.into_inner().job_id == first.job_id, "same row returned");

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(store.pool())
        .await?;
    anyhow::ensure!(count == 1, "expected exactly one job row, got {count}");

    // The duplicate must not have enqueued a second fetch item either.
    let work: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_queue")
        .fetch_one(store.pool())
        .await?;
    anyhow::ensure!(work == 1, "expected exactly one work row, got {work}");
    Ok(())
}

#[tokio::test]
async fn concurrent_claims_never_observe_the_same_item() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };

    let job = store
        .create_job(new_job(7, 1), fetch_work(Uuid::new_v4()))
        .await?
        .into_inner();
    for _ in 0..4 {
        store.enqueue(fetch_work(job.job_id)).await?;
    }

    let lease = Duration::from_secs(30);
    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("w{i}");
            let mut claimed = Vec::new();
            while let Some(item) = store.claim(&worker, lease).await? {
                claimed.push(item.work_id);
            }
            Ok::<_, anyhow::Error>(claimed)
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut total = 0usize;
    for handle in handles {
        for work_id in handle.await?? {
            total += 1;
            anyhow::ensure!(seen.insert(work_id), "work {work_id} claimed twice");
        }
    }
    anyhow::ensure!(total == 5, "expected 5 claims, got {total}");
    Ok(())
}

#[tokio::test]
async fn non_owner_heartbeat_and_finalize_affect_nothing() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };

    store
        .create_job(new_job(9, 1), fetch_work(Uuid::new_v4()))
        .await?;
    let item = store
        .claim("owner", Duration::from_secs(30))
        .await?
        .context("claim should succeed")?;

    anyhow::ensure!(
        !store.heartbeat(item.work_id, "intruder", Duration::from_secs(30)).await?,
        "non-owner heartbeat must affect 0 rows"
    );
    anyhow::ensure!(
        !store.complete(item.work_id, "intruder").await?,
        "non-owner complete must affect 0 rows"
    );
    anyhow::ensure!(
        !store
            .fail(item.work_id, "intruder", ErrorClass::Upstream5xx, None)
            .await?,
        "non-owner fail must affect 0 rows"
    );

    let unchanged = store.get_work(item.work_id).await?.context("row exists")?;
    anyhow::ensure!(unchanged.status == WorkStatus::Running, "still running");
    anyhow::ensure!(
        unchanged.claimed_by.as_deref() == Some("owner"),
        "ownership unchanged"
    );

    anyhow::ensure!(store.complete(item.work_id, "owner").await?, "owner completes");
    Ok(())
}

#[tokio::test]
async fn expired_lease_is_swept_back_to_queued() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };

    store
        .create_job(new_job(11, 1), fetch_work(Uuid::new_v4()))
        .await?;
    let item = store
        .claim("w1", Duration::from_millis(100))
        .await?
        .context("claim should succeed")?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let swept = store.requeue_expired().await?;
    anyhow::ensure!(swept == 1, "expected 1 swept row, got {swept}");

    let requeued = store.get_work(item.work_id).await?.context("row exists")?;
    anyhow::ensure!(requeued.status == WorkStatus::Queued, "back to queued");
    anyhow::ensure!(requeued.claimed_by.is_none(), "ownership cleared");
    anyhow::ensure!(requeued.lease_expires_at.is_none(), "lease cleared");

    // The crashed worker's finalize is now a no-op; the next claim succeeds.
    anyhow::ensure!(!store.complete(item.work_id, "w1").await?);
    let reclaimed = store
        .claim("w2", Duration::from_secs(30))
        .await?
        .context("reclaim should succeed")?;
    anyhow::ensure!(reclaimed.work_id == item.work_id);
    anyhow::ensure!(reclaimed.attempt_count == 2, "attempt count grows on claim");
    Ok(())
}

#[tokio::test]
async fn outbox_unique_key_and_sent_marking() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };

    let job = store
        .create_job(new_job(42, 3), fetch_work(Uuid::new_v4()))
        .await?
        .into_inner();

    let batch = NewOutboxBatch {
        job_id: job.job_id,
        changelist_id: 42,
        review_version: 3,
        recipients: vec!["alice@example.com".to_string(), "bob@example.com".to_string()],
    };
    anyhow::ensure!(store.materialize(batch.clone()).await? == 2);
    anyhow::ensure!(store.materialize(batch).await? == 0, "collisions leave rows untouched");

    let key = OutboxKey::new(42, "alice@example.com", 3);
    anyhow::ensure!(store.begin_send_attempt(&key).await?);
    anyhow::ensure!(store.mark_sent(&key, "m-1").await?);
    anyhow::ensure!(!store.mark_sent(&key, "m-2").await?, "second mark is a no-op");

    let entry = store.outbox_entry(&key).await?.context("entry exists")?;
    anyhow::ensure!(entry.notification_id.as_deref() == Some("m-1"));
    anyhow::ensure!(entry.notified_at.is_some());
    anyhow::ensure!(entry.send_started_at.is_none());
    Ok(())
}

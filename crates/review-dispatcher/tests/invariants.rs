//! End-to-end pipeline invariants over the in-memory store and fakes:
//! claim exclusivity, owner-guarded finalization, idempotent job creation,
//! send-then-mark with provider reconciliation, retry budgets, dead-letter
//! replay, and versioned reruns.

use anyhow::Context;
use review_core::{
    idempotency_token,
    store::{JobStore, OutboxStore, Store, WorkQueue},
    ClassifiedError, DeadLetterFilter, DeadLetterStatus, ErrorClass, JobStatus, NewJob,
    NewWorkItem, OutboxKey, OutboxStatus, RestartMode, Stage, WorkStatus,
};
use review_dispatcher::{DispatcherConfig, ReviewService, Worker};
use review_testing::{FakeFetcher, FakeModelClient, MemoryStore, RecordingProvider};
use serde_json::json;
use std::{sync::Arc, sync::Once, time::Duration};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

fn test_config() -> DispatcherConfig {
    let mut cfg = DispatcherConfig::from_env().expect("default config");
    cfg.lease_secs = 5;
    cfg.poll_ms = 10;
    cfg.retry_initial_ms = 1;
    cfg.retry_max_delay_secs = 1;
    cfg.external_timeout_secs = 5;
    cfg
}

fn good_model_response() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schema_version": "1.0",
        "prompt_version": "1.0",
        "summary": "one real problem",
        "findings": [{
            "id": "F1",
            "severity": "high",
            "category": "correctness",
            "title": "off-by-one",
            "file": "src/a.py",
            "line": 5,
            "message": "loop bound excludes the last element"
        }]
    }))
    .unwrap()
}

struct Harness {
    mem: MemoryStore,
    store: Arc<dyn Store>,
    fetcher: Arc<FakeFetcher>,
    model: Arc<FakeModelClient>,
    provider: Arc<RecordingProvider>,
    worker: Worker,
    service: ReviewService,
}

fn harness() -> Harness {
    init_tracing();
    let cfg = test_config();
    let mem = MemoryStore::new();
    let store: Arc<dyn Store> = Arc::new(mem.clone());
    let fetcher = Arc::new(FakeFetcher::single_file("src/a.py", "+print('hello')\n"));
    let model = Arc::new(FakeModelClient::new(good_model_response()));
    let provider = Arc::new(RecordingProvider::new());
    let worker = Worker::new(
        "w1",
        store.clone(),
        fetcher.clone(),
        model.clone(),
        provider.clone(),
        cfg.clone(),
    );
    let service = ReviewService::new(store.clone(), &cfg);
    Harness {
        mem,
        store,
        fetcher,
        model,
        provider,
        worker,
        service,
    }
}

/// Drain the queue repeatedly, sleeping past scheduled retries in between.
async fn drive(worker: &Worker, rounds: u32) -> anyhow::Result<()> {
    for _ in 0..rounds {
        worker.run_until_idle().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

fn recipients(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// Every claimed work id is observed by exactly one worker.
#[tokio::test]
async fn concurrent_claims_are_exclusive() -> anyhow::Result<()> {
    let h = harness();
    let new = NewJob::new("p1", 1, 1);
    let work = NewWorkItem::now(new.job_id, Stage::Fetch, json!({}), 0);
    let job = h.store.create_job(new, work).await?.into_inner();
    for _ in 0..19 {
        h.store
            .enqueue(NewWorkItem::now(job.job_id, Stage::Fetch, json!({}), 0))
            .await?;
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = h.store.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("w{i}");
            let mut claimed = Vec::new();
            while let Some(item) = store.claim(&worker, Duration::from_secs(30)).await? {
                claimed.push(item.work_id);
            }
            Ok::<_, anyhow::Error>(claimed)
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut total = 0;
    for handle in handles {
        for work_id in handle.await?? {
            total += 1;
            anyhow::ensure!(seen.insert(work_id), "work {work_id} claimed twice");
        }
    }
    anyhow::ensure!(total == 20, "expected 20 claims, got {total}");
    Ok(())
}

// Non-owner heartbeat/complete/fail affect nothing.
#[tokio::test]
async fn non_owner_operations_are_noops() -> anyhow::Result<()> {
    let h = harness();
    let new = NewJob::new("p2", 2, 1);
    let work = NewWorkItem::now(new.job_id, Stage::Fetch, json!({}), 0);
    h.store.create_job(new, work).await?;
    let item = h
        .store
        .claim("owner", Duration::from_secs(30))
        .await?
        .context("claim")?;

    anyhow::ensure!(!h.store.heartbeat(item.work_id, "thief", Duration::from_secs(30)).await?);
    anyhow::ensure!(!h.store.complete(item.work_id, "thief").await?);
    anyhow::ensure!(
        !h.store
            .fail(item.work_id, "thief", ErrorClass::TcpReset, None)
            .await?
    );

    let unchanged = h.store.get_work(item.work_id).await?.context("row")?;
    anyhow::ensure!(unchanged.status == WorkStatus::Running);
    anyhow::ensure!(unchanged.claimed_by.as_deref() == Some("owner"));
    Ok(())
}

// A duplicate submission returns the first job; exactly one row exists.
#[tokio::test]
async fn duplicate_submission_is_deduplicated() -> anyhow::Result<()> {
    let h = harness();
    let first = h
        .service
        .submit_review("key-A", 42, 1, &recipients(&["alice@example.com"]))
        .await?;
    let second = h
        .service
        .submit_review("key-A", 42, 1, &recipients(&["alice@example.com"]))
        .await?;
    anyhow::ensure!(first.job_id == second.job_id, "same job returned");
    anyhow::ensure!(h.mem.job_count().await == 1, "exactly one job row");

    // Only one fetch item was enqueued for the pair.
    let items = h.mem.work_items().await;
    anyhow::ensure!(items.len() == 1, "expected 1 work item, got {}", items.len());
    Ok(())
}

// Lease expiry hands the work to another worker exactly once.
#[tokio::test]
async fn expired_lease_recovers_to_a_second_worker() -> anyhow::Result<()> {
    let h = harness();
    let new = NewJob::new("lease", 7, 1);
    let work = NewWorkItem::now(new.job_id, Stage::Fetch, json!({}), 0);
    h.store.create_job(new, work).await?;

    let item = h
        .store
        .claim("w1", Duration::from_secs(10))
        .await?
        .context("w1 claims")?;
    // w1 crashes; force the lease past expiry instead of waiting.
    h.mem.expire_lease(item.work_id).await;

    let swept = h.store.requeue_expired().await?;
    anyhow::ensure!(swept == 1, "sweeper recovers the row");

    let reclaimed = h
        .store
        .claim("w2", Duration::from_secs(10))
        .await?
        .context("w2 claims")?;
    anyhow::ensure!(reclaimed.work_id == item.work_id);

    // w1's finalize is now a silent no-op; only w2 completes.
    anyhow::ensure!(!h.store.complete(item.work_id, "w1").await?);
    anyhow::ensure!(h.store.complete(item.work_id, "w2").await?);
    let done = h.store.get_work(item.work_id).await?.context("row")?;
    anyhow::ensure!(done.status == WorkStatus::Completed);
    Ok(())
}

// Happy path: fetch -> llm -> notify -> succeeded, exactly one provider send
// per recipient token, and notified_at never precedes the message id.
#[tokio::test]
async fn pipeline_happy_path_delivers_and_finalizes() -> anyhow::Result<()> {
    let h = harness();
    let job = h
        .service
        .submit_review(
            "happy",
            42,
            1,
            &recipients(&["alice@example.com", "bob@example.com"]),
        )
        .await?;

    drive(&h.worker, 3).await?;

    let job = h.store.get_job(job.job_id).await?.context("job")?;
    anyhow::ensure!(job.status == JobStatus::Succeeded, "job is {}", job.status);
    anyhow::ensure!(job.result_ref.as_deref() == Some("reviews/42/v1.json"));

    for name in ["alice@example.com", "bob@example.com"] {
        let key = OutboxKey::new(42, name, 1);
        let entry = h.store.outbox_entry(&key).await?.context("entry")?;
        anyhow::ensure!(entry.status == OutboxStatus::Sent);
        anyhow::ensure!(entry.notification_id.is_some() && entry.notified_at.is_some());
        let sends = h.provider.send_count(&idempotency_token(42, name, 1)).await;
        anyhow::ensure!(sends == 1, "expected 1 send for {name}, got {sends}");
    }

    // No row the pipeline ever produced has a delivery marker without an id.
    for entry in h.mem.outbox_entries().await {
        anyhow::ensure!(
            entry.notified_at.is_none() || entry.notification_id.is_some(),
            "notified_at set without a notification id on {}",
            entry.key
        );
    }

    let counts = h.service.queue_counts().await?;
    anyhow::ensure!(counts.completed == 3, "three stages completed: {counts:?}");
    anyhow::ensure!(counts.queued == 0 && counts.running == 0 && counts.failed == 0);
    Ok(())
}

// A provider ack survives a lost mark-sent write; the retry
// consults provider truth and backfills without resending.
#[tokio::test]
async fn outbox_reconciles_after_lost_mark_sent_write() -> anyhow::Result<()> {
    let h = harness();
    let new = NewJob::new("reconcile", 42, 1);
    let job_id = new.job_id;
    h.store
        .create_job(new, NewWorkItem::now(job_id, Stage::Fetch, json!({}), 0))
        .await?;
    h.store.mark_in_progress(job_id).await?;
    h.store
        .materialize(review_core::NewOutboxBatch {
            job_id,
            changelist_id: 42,
            review_version: 1,
            recipients: recipients(&["alice@example.com"]),
        })
        .await?;

    let delivery = review_dispatcher::OutboxDelivery::new(
        h.store.clone(),
        h.provider.clone(),
        Duration::from_secs(5),
    );
    let payload = review_dispatcher::payloads::NotifyPayload {
        changelist_id: 42,
        review_version: 1,
        recipients: recipients(&["alice@example.com"]),
        finding_count: 1,
        summary: None,
    };

    h.provider.preset_message_id("m-99").await;
    h.mem.fail_next_mark_sent().await;

    // First attempt: send succeeds, the combined write is lost, the fallback
    // preserves the provider's message id.
    let report = delivery.deliver_pending(job_id, &payload).await?;
    anyhow::ensure!(report.sent == 0 && report.retryable.len() == 1);

    let key = OutboxKey::new(42, "alice@example.com", 1);
    let token = key.idempotency_token();
    let entry = h.store.outbox_entry(&key).await?.context("entry")?;
    anyhow::ensure!(entry.notification_id.as_deref() == Some("m-99"));
    anyhow::ensure!(entry.notified_at.is_none());
    anyhow::ensure!(h.provider.send_count(&token).await == 1);

    // Retry: lookup confirms delivery and the marker is backfilled.
    let report = delivery.deliver_pending(job_id, &payload).await?;
    anyhow::ensure!(report.sent == 1 && report.retryable.is_empty());

    let entry = h.store.outbox_entry(&key).await?.context("entry")?;
    anyhow::ensure!(entry.status == OutboxStatus::Sent);
    anyhow::ensure!(entry.notification_id.as_deref() == Some("m-99"));
    anyhow::ensure!(entry.notified_at.is_some());
    anyhow::ensure!(
        h.provider.send_count(&token).await == 1,
        "reconciliation must not resend"
    );
    Ok(())
}

// A send sentinel with no provider-side record is released by the background
// reconciler; the row stays pending for a fresh send.
#[tokio::test]
async fn reconciler_releases_dangling_send_sentinel() -> anyhow::Result<()> {
    let h = harness();
    let new = NewJob::new("sentinel", 43, 1);
    let job_id = new.job_id;
    h.store
        .create_job(new, NewWorkItem::now(job_id, Stage::Fetch, json!({}), 0))
        .await?;
    h.store
        .materialize(review_core::NewOutboxBatch {
            job_id,
            changelist_id: 43,
            review_version: 1,
            recipients: recipients(&["alice@example.com"]),
        })
        .await?;

    // A worker began a send and died before calling the provider.
    let key = OutboxKey::new(43, "alice@example.com", 1);
    anyhow::ensure!(h.store.begin_send_attempt(&key).await?);
    let entry = h.store.outbox_entry(&key).await?.context("entry")?;
    anyhow::ensure!(entry.send_started_at.is_some());

    let delivery = review_dispatcher::OutboxDelivery::new(
        h.store.clone(),
        h.provider.clone(),
        Duration::from_secs(5),
    );
    delivery.reconcile_ambiguous(10).await?;

    let entry = h.store.outbox_entry(&key).await?.context("entry")?;
    anyhow::ensure!(entry.send_started_at.is_none(), "sentinel released");
    anyhow::ensure!(entry.status == OutboxStatus::Pending, "row stays pending");
    anyhow::ensure!(entry.notified_at.is_none());
    Ok(())
}

// A sent row the provider has no record of is a contract violation: audited
// and alerted once, with the delivery marker left intact.
#[tokio::test]
async fn sent_row_without_provider_evidence_is_flagged() -> anyhow::Result<()> {
    let h = harness();
    let job = h
        .service
        .submit_review("verify-lost", 90, 1, &recipients(&["alice@example.com"]))
        .await?;
    drive(&h.worker, 3).await?;
    let job = h.store.get_job(job.job_id).await?.context("job")?;
    anyhow::ensure!(job.status == JobStatus::Succeeded);

    let key = OutboxKey::new(90, "alice@example.com", 1);
    let token = key.idempotency_token();
    anyhow::ensure!(h.provider.send_count(&token).await == 1);

    let delivery = review_dispatcher::OutboxDelivery::new(
        h.store.clone(),
        h.provider.clone(),
        Duration::from_secs(5),
    );

    // The provider loses the record before the verification scan runs.
    h.provider.forget(&token).await;
    let confirmed = delivery.verify_sent(10).await?;
    anyhow::ensure!(confirmed == 0, "nothing confirmed, got {confirmed}");

    let entry = h.store.outbox_entry(&key).await?.context("entry")?;
    anyhow::ensure!(entry.status == OutboxStatus::Sent, "row is never un-sent");
    anyhow::ensure!(entry.notified_at.is_some());
    anyhow::ensure!(entry.provider_verified_at.is_some(), "check is stamped");
    anyhow::ensure!(
        entry.last_error.as_deref() == Some("provider evidence missing for sent row")
    );

    let audits = h.mem.audit_events().await;
    anyhow::ensure!(
        audits
            .iter()
            .any(|a| a.kind == "outbox_contract_violation" && a.job_id == Some(job.job_id)),
        "contract violation must be audited"
    );

    // Surfaced once: a second scan raises no further alert.
    delivery.verify_sent(10).await?;
    let violations = h
        .mem
        .audit_events()
        .await
        .iter()
        .filter(|a| a.kind == "outbox_contract_violation")
        .count();
    anyhow::ensure!(violations == 1, "alerted once, got {violations}");
    Ok(())
}

// A healthy sent row is confirmed against provider truth with no alert.
#[tokio::test]
async fn sent_row_with_provider_evidence_is_confirmed() -> anyhow::Result<()> {
    let h = harness();
    h.service
        .submit_review("verify-ok", 91, 1, &recipients(&["alice@example.com"]))
        .await?;
    drive(&h.worker, 3).await?;

    let delivery = review_dispatcher::OutboxDelivery::new(
        h.store.clone(),
        h.provider.clone(),
        Duration::from_secs(5),
    );
    let confirmed = delivery.verify_sent(10).await?;
    anyhow::ensure!(confirmed == 1, "expected 1 confirmed row, got {confirmed}");

    let entry = h
        .store
        .outbox_entry(&OutboxKey::new(91, "alice@example.com", 1))
        .await?
        .context("entry")?;
    anyhow::ensure!(entry.provider_verified_at.is_some());
    anyhow::ensure!(h
        .mem
        .audit_events()
        .await
        .iter()
        .all(|a| a.kind != "outbox_contract_violation"));

    // Verified rows leave the scan set.
    anyhow::ensure!(delivery.verify_sent(10).await? == 0);
    Ok(())
}

// Five UPSTREAM_5XX failures exhaust the llm attempt budget and
// dead-letter the job; the fetch stage's budget is untouched.
#[tokio::test]
async fn llm_retry_budget_exhaustion_dead_letters() -> anyhow::Result<()> {
    let h = harness();
    for _ in 0..5 {
        h.model
            .push_outcome(Err(ClassifiedError::new(
                ErrorClass::Upstream5xx,
                "upstream returned 502",
            )))
            .await;
    }

    let job = h
        .service
        .submit_review("exhaust", 50, 1, &recipients(&["alice@example.com"]))
        .await?;

    drive(&h.worker, 20).await?;

    let dead = h
        .service
        .list_dead_letters(&DeadLetterFilter {
            stage: Some(Stage::Llm),
            ..Default::default()
        })
        .await?;
    anyhow::ensure!(dead.len() == 1, "expected 1 dead letter, got {}", dead.len());
    let dl = &dead[0];
    anyhow::ensure!(dl.error_class == ErrorClass::Upstream5xx);
    anyhow::ensure!(dl.attempt_count == 5, "attempts recorded: {}", dl.attempt_count);
    anyhow::ensure!(dl.status == DeadLetterStatus::Open);

    let job = h.store.get_job(job.job_id).await?.context("job")?;
    anyhow::ensure!(job.status == JobStatus::Failed);
    anyhow::ensure!(h.model.calls().await == 5, "model called once per attempt");

    // The fetch stage completed on its single attempt.
    let fetch = h
        .store
        .latest_for_job_stage(job.job_id, Stage::Fetch)
        .await?
        .context("fetch item")?;
    anyhow::ensure!(fetch.status == WorkStatus::Completed);
    anyhow::ensure!(fetch.attempt_count == 1);
    anyhow::ensure!(h.fetcher.calls().await == 1);
    Ok(())
}

// Non-retryable validator rejection dead-letters immediately, replay is
// guarded by evidence, and a replay failing the same way reopens the letter.
#[tokio::test]
async fn rejected_response_dead_letters_and_replay_reopens() -> anyhow::Result<()> {
    let h = harness();
    h.model.push_outcome(Ok(b"not json {".to_vec())).await;

    let job = h
        .service
        .submit_review("reject", 60, 1, &recipients(&["alice@example.com"]))
        .await?;
    drive(&h.worker, 2).await?;

    let dead = h.service.list_dead_letters(&DeadLetterFilter::default()).await?;
    anyhow::ensure!(dead.len() == 1);
    let dl = &dead[0];
    anyhow::ensure!(dl.error_class == ErrorClass::InvalidJson);
    anyhow::ensure!(dl.stage == Stage::Llm);
    anyhow::ensure!(dl.attempt_count == 1, "non-retryable fails on first attempt");

    let job_row = h.store.get_job(job.job_id).await?.context("job")?;
    anyhow::ensure!(job_row.status == JobStatus::Failed);

    // Replay without evidence is refused.
    anyhow::ensure!(h
        .service
        .replay(dl.dl_id, RestartMode::ResumeAtFailedStage, "  ")
        .await
        .is_err());

    // Replay that fails the same way reopens the dead letter.
    h.model.push_outcome(Ok(b"not json {".to_vec())).await;
    h.service
        .replay(dl.dl_id, RestartMode::ResumeAtFailedStage, "ticket-123")
        .await?;
    drive(&h.worker, 2).await?;

    let dl = h
        .service
        .list_dead_letters(&DeadLetterFilter::default())
        .await?
        .into_iter()
        .next()
        .context("dead letter")?;
    anyhow::ensure!(dl.status == DeadLetterStatus::Reopened, "got {}", dl.status);

    // Remediated replay completes the job.
    h.service
        .replay(dl.dl_id, RestartMode::ResumeAtFailedStage, "ticket-124")
        .await?;
    drive(&h.worker, 3).await?;
    let job_row = h.store.get_job(job.job_id).await?.context("job")?;
    anyhow::ensure!(job_row.status == JobStatus::Succeeded, "got {}", job_row.status);
    Ok(())
}

// Versioned rerun gating.
#[tokio::test]
async fn versioned_rerun_gating() -> anyhow::Result<()> {
    let h = harness();
    let job_v3 = h
        .service
        .submit_review("v3", 42, 3, &recipients(&["alice@example.com"]))
        .await?;
    drive(&h.worker, 3).await?;
    let job_v3 = h.store.get_job(job_v3.job_id).await?.context("job")?;
    anyhow::ensure!(job_v3.status == JobStatus::Succeeded);

    // Same version: no-op, prior job returned.
    let outcome = h
        .service
        .request_rerun(42, 3, None, &recipients(&["alice@example.com"]))
        .await?;
    match outcome {
        review_dispatcher::RerunOutcome::Allowed(job) => {
            anyhow::ensure!(job.job_id == job_v3.job_id, "prior job returned");
        }
        review_dispatcher::RerunOutcome::Blocked(reason) => {
            anyhow::bail!("same-version rerun should be a no-op, got blocked: {reason}")
        }
    }
    anyhow::ensure!(h.mem.job_count().await == 1);

    // Lower version: blocked.
    let outcome = h
        .service
        .request_rerun(42, 2, None, &recipients(&["alice@example.com"]))
        .await?;
    anyhow::ensure!(matches!(outcome, review_dispatcher::RerunOutcome::Blocked(_)));

    // Greater version: a new job with disjoint outbox keys.
    let outcome = h
        .service
        .request_rerun(42, 4, None, &recipients(&["alice@example.com"]))
        .await?;
    let job_v4 = match outcome {
        review_dispatcher::RerunOutcome::Allowed(job) => job,
        review_dispatcher::RerunOutcome::Blocked(reason) => {
            anyhow::bail!("v4 rerun should be allowed: {reason}")
        }
    };
    anyhow::ensure!(job_v4.job_id != job_v3.job_id);

    drive(&h.worker, 3).await?;
    let job_v4 = h.store.get_job(job_v4.job_id).await?.context("job")?;
    anyhow::ensure!(job_v4.status == JobStatus::Succeeded);

    let v3_entry = h
        .store
        .outbox_entry(&OutboxKey::new(42, "alice@example.com", 3))
        .await?
        .context("v3 entry")?;
    let v4_entry = h
        .store
        .outbox_entry(&OutboxKey::new(42, "alice@example.com", 4))
        .await?
        .context("v4 entry")?;
    anyhow::ensure!(v3_entry.job_id == job_v3.job_id);
    anyhow::ensure!(v4_entry.job_id == job_v4.job_id);
    anyhow::ensure!(
        h.provider.send_count(&idempotency_token(42, "alice@example.com", 3)).await == 1
    );
    anyhow::ensure!(
        h.provider.send_count(&idempotency_token(42, "alice@example.com", 4)).await == 1
    );

    // A rerun while v4 is the latest and succeeded, with a version rollback,
    // stays blocked; an in-flight job blocks as well.
    let blocked = h
        .service
        .request_rerun(42, 4, None, &recipients(&["alice@example.com"]))
        .await?;
    match blocked {
        review_dispatcher::RerunOutcome::Allowed(job) => {
            anyhow::ensure!(job.job_id == job_v4.job_id, "same-version no-op again");
        }
        review_dispatcher::RerunOutcome::Blocked(reason) => {
            anyhow::bail!("unexpected block: {reason}")
        }
    }
    Ok(())
}

// A permanently rejected recipient blocks success and fails the job with a
// notify-stage dead letter; the deliverable recipient still got exactly one
// send.
#[tokio::test]
async fn permanent_recipient_failure_fails_the_job() -> anyhow::Result<()> {
    let h = harness();
    h.provider.reject_recipient("bad@example.com").await;

    let job = h
        .service
        .submit_review(
            "perm",
            70,
            1,
            &recipients(&["alice@example.com", "bad@example.com"]),
        )
        .await?;
    drive(&h.worker, 3).await?;

    let alice = h
        .store
        .outbox_entry(&OutboxKey::new(70, "alice@example.com", 1))
        .await?
        .context("alice entry")?;
    anyhow::ensure!(alice.status == OutboxStatus::Sent);

    let bad = h
        .store
        .outbox_entry(&OutboxKey::new(70, "bad@example.com", 1))
        .await?
        .context("bad entry")?;
    anyhow::ensure!(bad.status == OutboxStatus::FailedPermanent);
    anyhow::ensure!(bad.notified_at.is_none());

    let dead = h
        .service
        .list_dead_letters(&DeadLetterFilter {
            stage: Some(Stage::Notify),
            ..Default::default()
        })
        .await?;
    anyhow::ensure!(dead.len() == 1);
    anyhow::ensure!(dead[0].error_class == ErrorClass::NotFoundPermanent);

    let job = h.store.get_job(job.job_id).await?.context("job")?;
    anyhow::ensure!(job.status == JobStatus::Failed);
    Ok(())
}

// Transient provider failures retry and converge with exactly one effective
// send per token.
#[tokio::test]
async fn transient_send_failures_retry_to_success() -> anyhow::Result<()> {
    let h = harness();
    h.provider
        .push_send_failure(ClassifiedError::new(ErrorClass::NetworkTimeout, "send timed out"))
        .await;
    h.provider
        .push_send_failure(
            ClassifiedError::new(ErrorClass::RateLimited, "429")
                .with_retry_after(Duration::from_millis(5)),
        )
        .await;

    let job = h
        .service
        .submit_review("transient", 80, 1, &recipients(&["alice@example.com"]))
        .await?;
    drive(&h.worker, 10).await?;

    let job = h.store.get_job(job.job_id).await?.context("job")?;
    anyhow::ensure!(job.status == JobStatus::Succeeded, "got {}", job.status);
    anyhow::ensure!(
        h.provider
            .send_count(&idempotency_token(80, "alice@example.com", 1))
            .await
            == 1
    );
    Ok(())
}

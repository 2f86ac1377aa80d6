//! Outbox delivery: send-then-mark with provider reconciliation.
//!
//! The ordering contract is absolute: a row never moves to `sent` before the
//! provider acknowledged the send. The deterministic idempotency token (a
//! hash of the outbox key) makes a resend after an ambiguous crash safe: a
//! compliant provider dedupes it and returns the original message id.

use crate::payloads::NotifyPayload;
use anyhow::Context;
use review_core::{
    redact,
    store::{AuditKind, AuditLog, NewAuditEvent, OutboxStore, Store},
    ClassifiedError, ErrorClass, LookupOutcome, NotificationPayload, NotificationProvider,
    OutboxEntry, OutboxKey,
};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// What a delivery pass observed, per failure disposition.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub sent: usize,

    /// Transient provider failures; the notify stage retries under budget.
    pub retryable: Vec<ClassifiedError>,

    /// Rows now `failed_permanent`; they block job success until resolved.
    pub permanent: Vec<ClassifiedError>,
}

#[derive(Clone)]
pub struct OutboxDelivery {
    store: Arc<dyn Store>,
    provider: Arc<dyn NotificationProvider>,
    send_deadline: Duration,
}

impl OutboxDelivery {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn NotificationProvider>,
        send_deadline: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            send_deadline,
        }
    }

    /// Deliver every `pending` row for a job.
    pub async fn deliver_pending(
        &self,
        job_id: Uuid,
        payload: &NotifyPayload,
    ) -> anyhow::Result<DeliveryReport> {
        let mut report = DeliveryReport::default();
        let rows = self.store.pending_for_job(job_id).await?;
        for row in rows {
            // Re-read for current truth; another worker may have resolved it.
            let Some(entry) = self.store.outbox_entry(&row.key).await? else {
                continue;
            };
            if entry.notified_at.is_some() {
                continue;
            }
            if entry.notification_id.is_some() {
                if self.reconcile_entry(&entry).await? {
                    report.sent += 1;
                } else {
                    // Provider has no record for the token: resend.
                    let _ = self.store.begin_send_attempt(&entry.key).await?;
                    self.send_and_mark(&entry, payload, &mut report).await?;
                }
                continue;
            }
            if !self.store.begin_send_attempt(&entry.key).await? {
                // Lost the race to another delivery pass.
                continue;
            }
            self.send_and_mark(&entry, payload, &mut report).await?;
        }
        Ok(report)
    }

    async fn send_and_mark(
        &self,
        entry: &OutboxEntry,
        payload: &NotifyPayload,
        report: &mut DeliveryReport,
    ) -> anyhow::Result<()> {
        let key = &entry.key;
        let token = key.idempotency_token();
        let notification = notification_payload(key, payload);

        match self
            .provider
            .send(&notification, &token, self.send_deadline)
            .await
        {
            Ok(receipt) => {
                match self.store.mark_sent(key, &receipt.message_id).await {
                    Ok(true) => {
                        tracing::info!(
                            event = "review.outbox.sent",
                            key = %key,
                            notification_id = %receipt.message_id,
                            "notification delivered"
                        );
                        report.sent += 1;
                    }
                    Ok(false) => {
                        // Already resolved by a concurrent pass.
                        report.sent += 1;
                    }
                    Err(err) => {
                        // The provider ack must survive even though the
                        // combined write did not; reconciliation backfills
                        // `notified_at` from this id without resending.
                        tracing::warn!(
                            event = "review.outbox.mark_sent_failed",
                            key = %key,
                            notification_id = %receipt.message_id,
                            error = %err,
                            "mark-sent write failed after provider ack"
                        );
                        let _ = self
                            .store
                            .record_notification_id(key, &receipt.message_id)
                            .await;
                        report
                            .retryable
                            .push(ClassifiedError::new(ErrorClass::Conflict, err.to_string()));
                    }
                }
            }
            Err(cerr) if cerr.class.is_retryable() => {
                self.store
                    .clear_send_sentinel(key, Some(&redact::scrub(&cerr.to_string())))
                    .await?;
                tracing::warn!(
                    event = "review.outbox.send_retryable",
                    key = %key,
                    error_class = %cerr.class,
                    "send failed; will retry"
                );
                report.retryable.push(cerr);
            }
            Err(cerr) => {
                self.store
                    .mark_failed_permanent(key, &redact::scrub(&cerr.to_string()))
                    .await?;
                tracing::error!(
                    event = "review.outbox.send_permanent",
                    key = %key,
                    error_class = %cerr.class,
                    "send failed permanently"
                );
                report.permanent.push(cerr);
            }
        }
        Ok(())
    }

    /// Resolve a row whose message id is recorded without a delivery marker.
    /// Returns true when provider truth confirmed delivery and the marker was
    /// backfilled; false means the provider has no record and the caller must
    /// resend.
    async fn reconcile_entry(&self, entry: &OutboxEntry) -> anyhow::Result<bool> {
        let token = entry.key.idempotency_token();
        match self
            .provider
            .lookup(&token)
            .await
            .context("provider lookup")?
        {
            LookupOutcome::Delivered { message_id } => {
                if let Some(recorded) = &entry.notification_id {
                    if recorded != &message_id {
                        // Same token, different id: the provider broke its
                        // idempotency contract.
                        self.audit_contract_violation(
                            entry,
                            "provider returned a different message id for the same token",
                            Some(&message_id),
                        )
                        .await?;
                    }
                }
                self.store
                    .backfill_notified(&entry.key, &message_id)
                    .await?;
                tracing::info!(
                    event = "review.outbox.reconciled",
                    key = %entry.key,
                    notification_id = %message_id,
                    "backfilled delivery marker from provider truth"
                );
                Ok(true)
            }
            LookupOutcome::NotFound => Ok(false),
        }
    }

    /// Background pass over ambiguous rows: backfill delivered ones, release
    /// dangling send sentinels so delivery can retry the rest.
    pub async fn reconcile_ambiguous(&self, limit: i64) -> anyhow::Result<u64> {
        let mut repaired = 0u64;
        for entry in self.store.ambiguous_entries(limit).await? {
            let token = entry.key.idempotency_token();
            match self.provider.lookup(&token).await {
                Ok(LookupOutcome::Delivered { message_id }) => {
                    if self
                        .store
                        .backfill_notified(&entry.key, &message_id)
                        .await?
                    {
                        repaired += 1;
                    }
                }
                Ok(LookupOutcome::NotFound) => {
                    if entry.notification_id.is_none() {
                        // Send never reached the provider; clear the sentinel
                        // so the row is delivered afresh.
                        self.store.clear_send_sentinel(&entry.key, None).await?;
                    }
                    // With an id recorded, the delivery path resolves it; a
                    // deterministic token makes that resend safe.
                }
                Err(err) => {
                    tracing::warn!(
                        event = "review.outbox.reconcile_lookup_failed",
                        key = %entry.key,
                        error = %err,
                        "provider lookup failed during reconciliation"
                    );
                }
            }
        }
        Ok(repaired)
    }

    /// Verify `sent` rows against provider-side truth. A row the provider
    /// confirms is stamped verified; a row the provider has no record of is a
    /// contract violation: the delivery marker stays (the row is never
    /// un-sent), the violation is audited and alerted, and the check is
    /// stamped so operators work from the audit trail rather than a re-alert
    /// on every scan. Returns the number of rows confirmed.
    pub async fn verify_sent(&self, limit: i64) -> anyhow::Result<u64> {
        let mut confirmed = 0u64;
        for entry in self.store.sent_for_reconciliation(limit).await? {
            let token = entry.key.idempotency_token();
            match self.provider.lookup(&token).await {
                Ok(LookupOutcome::Delivered { message_id }) => {
                    if entry.notification_id.as_deref() != Some(message_id.as_str()) {
                        self.audit_contract_violation(
                            &entry,
                            "provider returned a different message id for the same token",
                            Some(&message_id),
                        )
                        .await?;
                    }
                    if self.store.mark_provider_verified(&entry.key).await? {
                        confirmed += 1;
                    }
                }
                Ok(LookupOutcome::NotFound) => {
                    self.audit_contract_violation(
                        &entry,
                        "row is sent but the provider has no record for its token",
                        None,
                    )
                    .await?;
                    self.store
                        .mark_provider_evidence_missing(
                            &entry.key,
                            "provider evidence missing for sent row",
                        )
                        .await?;
                }
                Err(err) => {
                    tracing::warn!(
                        event = "review.outbox.verify_lookup_failed",
                        key = %entry.key,
                        error = %err,
                        "provider lookup failed while verifying sent row"
                    );
                }
            }
        }
        Ok(confirmed)
    }

    async fn audit_contract_violation(
        &self,
        entry: &OutboxEntry,
        detail: &str,
        provider_message_id: Option<&str>,
    ) -> anyhow::Result<()> {
        tracing::error!(
            event = "review.outbox.contract_violation",
            key = %entry.key,
            recorded = entry.notification_id.as_deref().unwrap_or(""),
            provider = provider_message_id.unwrap_or(""),
            "{detail}"
        );
        self.store
            .record_audit(NewAuditEvent {
                kind: AuditKind::OutboxContractViolation,
                job_id: Some(entry.job_id),
                detail: serde_json::json!({
                    "key": entry.key.to_string(),
                    "detail": detail,
                    "recorded_id": entry.notification_id,
                    "provider_id": provider_message_id,
                }),
            })
            .await
    }
}

fn notification_payload(key: &OutboxKey, payload: &NotifyPayload) -> NotificationPayload {
    let body = match (&payload.summary, payload.finding_count) {
        (Some(summary), n) => format!("{n} finding(s). {summary}"),
        (None, n) => format!("{n} finding(s)."),
    };
    NotificationPayload {
        recipient: key.recipient.clone(),
        changelist_id: key.changelist_id,
        review_version: key.review_version,
        subject: format!(
            "Review of changelist {} (v{})",
            key.changelist_id, key.review_version
        ),
        body,
    }
}

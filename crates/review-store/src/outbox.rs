use crate::PgStore;
use anyhow::Context;
use async_trait::async_trait;
use review_core::{
    store::OutboxStore, NewOutboxBatch, OutboxEntry, OutboxKey, OutboxStatus,
};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

const OUTBOX_COLUMNS: &str =
    "changelist_id, recipient, review_version, job_id, status, notification_id, notified_at, \
     send_started_at, provider_verified_at, attempt_count, last_error, updated_at";

pub(crate) fn map_outbox(row: &PgRow) -> anyhow::Result<OutboxEntry> {
    let status: String = row.try_get("status")?;
    Ok(OutboxEntry {
        key: OutboxKey {
            changelist_id: row.try_get("changelist_id")?,
            recipient: row.try_get("recipient")?,
            review_version: row.try_get("review_version")?,
        },
        job_id: row.try_get("job_id")?,
        status: status.parse::<OutboxStatus>()?,
        notification_id: row.try_get("notification_id")?,
        notified_at: row.try_get("notified_at")?,
        send_started_at: row.try_get("send_started_at")?,
        provider_verified_at: row.try_get("provider_verified_at")?,
        attempt_count: row.try_get("attempt_count")?,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn materialize(&self, batch: NewOutboxBatch) -> anyhow::Result<u64> {
        let mut tx = self.pool().begin().await.context("begin materialize tx")?;
        let mut inserted = 0u64;
        for recipient in &batch.recipients {
            let res = sqlx::query(
                r#"
                INSERT INTO outbox (changelist_id, recipient, review_version, job_id)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (changelist_id, recipient, review_version) DO NOTHING
                "#,
            )
            .bind(batch.changelist_id)
            .bind(recipient)
            .bind(batch.review_version)
            .bind(batch.job_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("materialize outbox row for {recipient}"))?;
            inserted += res.rows_affected();
        }
        tx.commit().await.context("commit materialize tx")?;
        Ok(inserted)
    }

    async fn outbox_entry(&self, key: &OutboxKey) -> anyhow::Result<Option<OutboxEntry>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE changelist_id = $1 AND recipient = $2 AND review_version = $3
            "#
        ))
        .bind(key.changelist_id)
        .bind(&key.recipient)
        .bind(key.review_version)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("get outbox entry {key}"))?;
        row.as_ref().map(map_outbox).transpose()
    }

    async fn pending_for_job(&self, job_id: Uuid) -> anyhow::Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE job_id = $1 AND status = 'pending'
            ORDER BY recipient
            "#
        ))
        .bind(job_id)
        .fetch_all(self.pool())
        .await
        .with_context(|| format!("pending outbox rows for job {job_id}"))?;
        rows.iter().map(map_outbox).collect()
    }

    async fn unresolved_for_job(&self, job_id: Uuid) -> anyhow::Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE job_id = $1 AND notified_at IS NULL
            ORDER BY recipient
            "#
        ))
        .bind(job_id)
        .fetch_all(self.pool())
        .await
        .with_context(|| format!("unresolved outbox rows for job {job_id}"))?;
        rows.iter().map(map_outbox).collect()
    }

    async fn begin_send_attempt(&self, key: &OutboxKey) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox
            SET attempt_count = attempt_count + 1,
                send_started_at = now(),
                updated_at = now()
            WHERE changelist_id = $1 AND recipient = $2 AND review_version = $3
              AND status = 'pending'
              AND notified_at IS NULL
            "#,
        )
        .bind(key.changelist_id)
        .bind(&key.recipient)
        .bind(key.review_version)
        .execute(self.pool())
        .await
        .with_context(|| format!("begin send attempt {key}"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn mark_sent(&self, key: &OutboxKey, notification_id: &str) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox
            SET notification_id = $4,
                notified_at = now(),
                status = 'sent',
                send_started_at = NULL,
                last_error = NULL,
                updated_at = now()
            WHERE changelist_id = $1 AND recipient = $2 AND review_version = $3
              AND notified_at IS NULL
            "#,
        )
        .bind(key.changelist_id)
        .bind(&key.recipient)
        .bind(key.review_version)
        .bind(notification_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("mark sent {key}"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn record_notification_id(
        &self,
        key: &OutboxKey,
        notification_id: &str,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox
            SET notification_id = $4,
                updated_at = now()
            WHERE changelist_id = $1 AND recipient = $2 AND review_version = $3
              AND notified_at IS NULL
            "#,
        )
        .bind(key.changelist_id)
        .bind(&key.recipient)
        .bind(key.review_version)
        .bind(notification_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("record notification id {key}"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn backfill_notified(
        &self,
        key: &OutboxKey,
        notification_id: &str,
    ) -> anyhow::Result<bool> {
        // Backfill is driven by a provider lookup, so the row arrives
        // already verified against provider truth.
        let updated = sqlx::query(
            r#"
            UPDATE outbox
            SET notification_id = COALESCE(notification_id, $4),
                notified_at = now(),
                status = 'sent',
                send_started_at = NULL,
                provider_verified_at = now(),
                last_error = NULL,
                updated_at = now()
            WHERE changelist_id = $1 AND recipient = $2 AND review_version = $3
              AND notified_at IS NULL
            "#,
        )
        .bind(key.changelist_id)
        .bind(&key.recipient)
        .bind(key.review_version)
        .bind(notification_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("backfill notified {key}"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn clear_send_sentinel(
        &self,
        key: &OutboxKey,
        last_error: Option<&str>,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox
            SET send_started_at = NULL,
                last_error = COALESCE($4, last_error),
                updated_at = now()
            WHERE changelist_id = $1 AND recipient = $2 AND review_version = $3
              AND notified_at IS NULL
            "#,
        )
        .bind(key.changelist_id)
        .bind(&key.recipient)
        .bind(key.review_version)
        .bind(last_error)
        .execute(self.pool())
        .await
        .with_context(|| format!("clear send sentinel {key}"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn mark_failed_permanent(
        &self,
        key: &OutboxKey,
        last_error: &str,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'failed_permanent',
                last_error = $4,
                send_started_at = NULL,
                updated_at = now()
            WHERE changelist_id = $1 AND recipient = $2 AND review_version = $3
              AND notified_at IS NULL
            "#,
        )
        .bind(key.changelist_id)
        .bind(&key.recipient)
        .bind(key.review_version)
        .bind(last_error)
        .execute(self.pool())
        .await
        .with_context(|| format!("mark failed permanent {key}"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn ambiguous_entries(&self, limit: i64) -> anyhow::Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE notified_at IS NULL
              AND (notification_id IS NOT NULL OR send_started_at IS NOT NULL)
            ORDER BY updated_at
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("scan ambiguous outbox rows")?;
        rows.iter().map(map_outbox).collect()
    }

    async fn sent_for_reconciliation(&self, limit: i64) -> anyhow::Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE status = 'sent'
              AND provider_verified_at IS NULL
            ORDER BY updated_at
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("scan unverified sent outbox rows")?;
        rows.iter().map(map_outbox).collect()
    }

    async fn mark_provider_verified(&self, key: &OutboxKey) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox
            SET provider_verified_at = now(),
                updated_at = now()
            WHERE changelist_id = $1 AND recipient = $2 AND review_version = $3
              AND status = 'sent'
            "#,
        )
        .bind(key.changelist_id)
        .bind(&key.recipient)
        .bind(key.review_version)
        .execute(self.pool())
        .await
        .with_context(|| format!("mark provider verified {key}"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn mark_provider_evidence_missing(
        &self,
        key: &OutboxKey,
        detail: &str,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox
            SET provider_verified_at = now(),
                last_error = $4,
                updated_at = now()
            WHERE changelist_id = $1 AND recipient = $2 AND review_version = $3
              AND status = 'sent'
            "#,
        )
        .bind(key.changelist_id)
        .bind(&key.recipient)
        .bind(key.review_version)
        .bind(detail)
        .execute(self.pool())
        .await
        .with_context(|| format!("mark provider evidence missing {key}"))?;
        Ok(updated.rows_affected() == 1)
    }
}

use crate::PgStore;
use anyhow::Context;
use async_trait::async_trait;
use review_core::{
    store::DeadLetterStore, DeadLetter, DeadLetterFilter, DeadLetterStatus, ErrorClass,
    NewDeadLetter, Stage,
};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

const DL_COLUMNS: &str =
    "dl_id, job_id, stage, error_class, last_stack, sanitized_context, first_failure_at, \
     last_failure_at, attempt_count, status, remediation_evidence_ref";

fn map_dead_letter(row: &PgRow) -> anyhow::Result<DeadLetter> {
    let stage: String = row.try_get("stage")?;
    let error_class: String = row.try_get("error_class")?;
    let status: String = row.try_get("status")?;
    Ok(DeadLetter {
        dl_id: row.try_get("dl_id")?,
        job_id: row.try_get("job_id")?,
        stage: stage.parse::<Stage>()?,
        error_class: error_class.parse::<ErrorClass>()?,
        last_stack: row.try_get("last_stack")?,
        sanitized_context: row.try_get("sanitized_context")?,
        first_failure_at: row.try_get("first_failure_at")?,
        last_failure_at: row.try_get("last_failure_at")?,
        attempt_count: row.try_get("attempt_count")?,
        status: status.parse::<DeadLetterStatus>()?,
        remediation_evidence_ref: row.try_get("remediation_evidence_ref")?,
    })
}

#[async_trait]
impl DeadLetterStore for PgStore {
    async fn record_dead_letter(&self, new: NewDeadLetter) -> anyhow::Result<DeadLetter> {
        let mut tx = self.pool().begin().await.context("begin dead letter tx")?;

        let existing = sqlx::query(&format!(
            r#"
            SELECT {DL_COLUMNS}
            FROM dead_letters
            WHERE job_id = $1 AND stage = $2
            FOR UPDATE
            "#
        ))
        .bind(new.job_id)
        .bind(new.stage.as_str())
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("lock dead letter for job {} {}", new.job_id, new.stage))?;

        let dl_id = match existing {
            None => {
                let dl_id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO dead_letters
                      (dl_id, job_id, stage, error_class, last_stack, sanitized_context,
                       attempt_count, status)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, 'open')
                    "#,
                )
                .bind(dl_id)
                .bind(new.job_id)
                .bind(new.stage.as_str())
                .bind(new.error_class.as_str())
                .bind(&new.last_stack)
                .bind(&new.sanitized_context)
                .bind(new.attempt_count)
                .execute(&mut *tx)
                .await
                .context("insert dead letter")?;
                dl_id
            }
            Some(row) => {
                let prior = map_dead_letter(&row)?;
                // A failure arriving during replay with the same class means
                // the remediation did not hold: reopen and escalate.
                let next_status = if prior.status == DeadLetterStatus::Replaying
                    && prior.error_class == new.error_class
                {
                    DeadLetterStatus::Reopened
                } else {
                    DeadLetterStatus::Open
                };
                sqlx::query(
                    r#"
                    UPDATE dead_letters
                    SET error_class = $2,
                        last_stack = $3,
                        sanitized_context = $4,
                        last_failure_at = now(),
                        attempt_count = $5,
                        status = $6
                    WHERE dl_id = $1
                    "#,
                )
                .bind(prior.dl_id)
                .bind(new.error_class.as_str())
                .bind(&new.last_stack)
                .bind(&new.sanitized_context)
                .bind(new.attempt_count)
                .bind(next_status.as_str())
                .execute(&mut *tx)
                .await
                .context("update dead letter")?;
                prior.dl_id
            }
        };

        let row = sqlx::query(&format!(
            "SELECT {DL_COLUMNS} FROM dead_letters WHERE dl_id = $1"
        ))
        .bind(dl_id)
        .fetch_one(&mut *tx)
        .await
        .context("read back dead letter")?;
        let dead_letter = map_dead_letter(&row)?;

        tx.commit().await.context("commit dead letter tx")?;
        Ok(dead_letter)
    }

    async fn get_dead_letter(&self, dl_id: Uuid) -> anyhow::Result<Option<DeadLetter>> {
        let row = sqlx::query(&format!(
            "SELECT {DL_COLUMNS} FROM dead_letters WHERE dl_id = $1"
        ))
        .bind(dl_id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("get dead letter {dl_id}"))?;
        row.as_ref().map(map_dead_letter).transpose()
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> anyhow::Result<Vec<DeadLetter>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DL_COLUMNS}
            FROM dead_letters
            WHERE ($1::text IS NULL OR error_class = $1)
              AND ($2::text IS NULL OR stage = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY last_failure_at DESC
            "#
        ))
        .bind(filter.error_class.map(|c| c.as_str()))
        .bind(filter.stage.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(self.pool())
        .await
        .context("list dead letters")?;
        rows.iter().map(map_dead_letter).collect()
    }

    async fn mark_replaying(&self, dl_id: Uuid, evidence_ref: &str) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE dead_letters
            SET status = 'replaying',
                remediation_evidence_ref = $2
            WHERE dl_id = $1
              AND status IN ('open', 'reopened')
            "#,
        )
        .bind(dl_id)
        .bind(evidence_ref)
        .execute(self.pool())
        .await
        .with_context(|| format!("mark dead letter {dl_id} replaying"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn mark_resolved(&self, dl_id: Uuid) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE dead_letters
            SET status = 'resolved'
            WHERE dl_id = $1
              AND status IN ('open', 'replaying', 'reopened')
            "#,
        )
        .bind(dl_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("mark dead letter {dl_id} resolved"))?;
        Ok(updated.rows_affected() == 1)
    }
}

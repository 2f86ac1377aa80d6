use crate::{queue::insert_work, PgStore};
use anyhow::Context;
use async_trait::async_trait;
use review_core::{
    store::{InsertOutcome, JobStore},
    Job, JobStatus, NewJob, NewWorkItem,
};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

const JOB_COLUMNS: &str =
    "job_id, idempotency_key, changelist_id, review_version, status, result_ref, created_at, \
     updated_at";

pub(crate) fn map_job(row: &PgRow) -> anyhow::Result<Job> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        job_id: row.try_get("job_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        changelist_id: row.try_get("changelist_id")?,
        review_version: row.try_get("review_version")?,
        status: status.parse::<JobStatus>()?,
        result_ref: row.try_get("result_ref")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(
        &self,
        new: NewJob,
        initial_work: NewWorkItem,
    ) -> anyhow::Result<InsertOutcome<Job>> {
        let mut tx = self.pool().begin().await.context("begin create job tx")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (job_id, idempotency_key, changelist_id, review_version)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(new.job_id)
        .bind(&new.idempotency_key)
        .bind(new.changelist_id)
        .bind(new.review_version)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("insert job key={}", new.idempotency_key))?
        .rows_affected()
            == 1;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = $1"
        ))
        .bind(&new.idempotency_key)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("read back job key={}", new.idempotency_key))?;
        let job = map_job(&row)?;

        if !inserted {
            tx.commit().await.context("commit create job tx")?;
            return Ok(InsertOutcome::Existing(job));
        }

        insert_work(&mut *tx, &initial_work).await?;
        tx.commit().await.context("commit create job tx")?;
        Ok(InsertOutcome::Inserted(job))
    }

    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id)
            .fetch_optional(self.pool())
            .await
            .with_context(|| format!("get job {job_id}"))?;
        row.as_ref().map(map_job).transpose()
    }

    async fn job_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("get job by key {idempotency_key}"))?;
        row.as_ref().map(map_job).transpose()
    }

    async fn latest_job_for_changelist(
        &self,
        changelist_id: i64,
    ) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE changelist_id = $1
            ORDER BY review_version DESC
            LIMIT 1
            "#
        ))
        .bind(changelist_id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("latest job for changelist {changelist_id}"))?;
        row.as_ref().map(map_job).transpose()
    }

    async fn mark_in_progress(&self, job_id: Uuid) -> anyhow::Result<bool> {
        self.transition_job(job_id, &["pending", "retryable_failed"], "in_progress")
            .await
    }

    async fn mark_retryable_failed(&self, job_id: Uuid) -> anyhow::Result<bool> {
        self.transition_job(job_id, &["in_progress"], "retryable_failed")
            .await
    }

    async fn mark_job_failed(&self, job_id: Uuid) -> anyhow::Result<bool> {
        self.transition_job(job_id, &["pending", "in_progress", "retryable_failed"], "failed")
            .await
    }

    async fn mark_pending_for_replay(&self, job_id: Uuid) -> anyhow::Result<bool> {
        self.transition_job(job_id, &["failed"], "pending").await
    }

    async fn set_result_ref(&self, job_id: Uuid, result_ref: &str) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET result_ref = $2,
                updated_at = now()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(result_ref)
        .execute(self.pool())
        .await
        .with_context(|| format!("set result_ref for job {job_id}"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn finalize_succeeded(&self, job_id: Uuid) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                updated_at = now()
            WHERE job_id = $1
              AND status = 'in_progress'
              AND NOT EXISTS (
                SELECT 1 FROM outbox o
                WHERE o.job_id = $1
                  AND o.notified_at IS NULL
              )
            "#,
        )
        .bind(job_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("finalize job {job_id}"))?;
        Ok(updated.rows_affected() == 1)
    }
}

impl PgStore {
    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[&str],
        to: &str,
    ) -> anyhow::Result<bool> {
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3,
                updated_at = now()
            WHERE job_id = $1
              AND status = ANY($2)
            "#,
        )
        .bind(job_id)
        .bind(&from)
        .bind(to)
        .execute(self.pool())
        .await
        .with_context(|| format!("transition job {job_id} to {to}"))?;
        Ok(updated.rows_affected() == 1)
    }
}

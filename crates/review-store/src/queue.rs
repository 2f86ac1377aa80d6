use crate::{duration_millis, PgStore};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use review_core::{
    store::{QueueCounts, WorkQueue},
    ErrorClass, NewWorkItem, Stage, WorkItem, WorkStatus,
};
use sqlx::{postgres::PgRow, Row};
use std::time::Duration;
use uuid::Uuid;

const WORK_COLUMNS: &str = "work_id, job_id, stage, payload, status, priority, run_at, \
     claimed_by, lease_expires_at, attempt_count, last_error_class, created_at, started_at, \
     updated_at";

// Qualified flavor for the claim CTE, where unqualified names are ambiguous
// against the picked set.
const WORK_COLUMNS_W: &str = "w.work_id, w.job_id, w.stage, w.payload, w.status, w.priority, \
     w.run_at, w.claimed_by, w.lease_expires_at, w.attempt_count, w.last_error_class, \
     w.created_at, w.started_at, w.updated_at";

pub(crate) fn map_work(row: &PgRow) -> anyhow::Result<WorkItem> {
    let stage: String = row.try_get("stage")?;
    let status: String = row.try_get("status")?;
    let last_error_class: Option<String> = row.try_get("last_error_class")?;
    Ok(WorkItem {
        work_id: row.try_get("work_id")?,
        job_id: row.try_get("job_id")?,
        stage: stage.parse::<Stage>()?,
        payload: row.try_get("payload")?,
        status: status.parse::<WorkStatus>()?,
        priority: row.try_get("priority")?,
        run_at: row.try_get("run_at")?,
        claimed_by: row.try_get("claimed_by")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        attempt_count: row.try_get("attempt_count")?,
        last_error_class: last_error_class
            .map(|c| c.parse::<ErrorClass>())
            .transpose()?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) async fn insert_work<'e, E>(executor: E, new: &NewWorkItem) -> anyhow::Result<Uuid>
where
    E: sqlx::PgExecutor<'e>,
{
    let work_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO work_queue (work_id, job_id, stage, payload, priority, run_at)
        VALUES ($1, $2, $3, $4, $5, COALESCE($6, now()))
        "#,
    )
    .bind(work_id)
    .bind(new.job_id)
    .bind(new.stage.as_str())
    .bind(&new.payload)
    .bind(new.priority)
    .bind(new.run_at)
    .execute(executor)
    .await
    .with_context(|| format!("enqueue {} work for job {}", new.stage, new.job_id))?;
    Ok(work_id)
}

#[async_trait]
impl WorkQueue for PgStore {
    async fn enqueue(&self, new: NewWorkItem) -> anyhow::Result<Uuid> {
        insert_work(self.pool(), &new).await
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> anyhow::Result<Option<WorkItem>> {
        let lease_millis = duration_millis(lease);
        let row = sqlx::query(&format!(
            r#"
            WITH picked AS (
              SELECT work_id
              FROM work_queue
              WHERE status = 'queued'
                AND run_at <= now()
              ORDER BY priority DESC, created_at ASC
              LIMIT 1
              FOR UPDATE SKIP LOCKED
            )
            UPDATE work_queue AS w
            SET status = 'running',
                claimed_by = $1,
                lease_expires_at = now() + ($2::text || ' milliseconds')::interval,
                attempt_count = w.attempt_count + 1,
                started_at = COALESCE(w.started_at, now()),
                updated_at = now()
            FROM picked
            WHERE w.work_id = picked.work_id
            RETURNING {WORK_COLUMNS_W}
            "#
        ))
        .bind(worker_id)
        .bind(lease_millis)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("claim work for worker={worker_id}"))?;

        row.as_ref().map(map_work).transpose()
    }

    async fn heartbeat(
        &self,
        work_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> anyhow::Result<bool> {
        let lease_millis = duration_millis(lease);
        let updated = sqlx::query(
            r#"
            UPDATE work_queue
            SET lease_expires_at = now() + ($3::text || ' milliseconds')::interval,
                updated_at = now()
            WHERE work_id = $1
              AND claimed_by = $2
              AND status = 'running'
            "#,
        )
        .bind(work_id)
        .bind(worker_id)
        .bind(lease_millis)
        .execute(self.pool())
        .await
        .with_context(|| format!("heartbeat work_id={work_id}"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn complete(&self, work_id: Uuid, worker_id: &str) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'completed',
                claimed_by = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE work_id = $1
              AND claimed_by = $2
              AND status = 'running'
            "#,
        )
        .bind(work_id)
        .bind(worker_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("complete work_id={work_id}"))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn complete_and_enqueue(
        &self,
        work_id: Uuid,
        worker_id: &str,
        next: NewWorkItem,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool().begin().await.context("begin stage hand-off tx")?;

        let updated = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'completed',
                claimed_by = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE work_id = $1
              AND claimed_by = $2
              AND status = 'running'
            "#,
        )
        .bind(work_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("complete work_id={work_id}"))?;

        if updated.rows_affected() == 0 {
            // Lost the lease: the whole hand-off is abandoned.
            tx.rollback().await.context("rollback stage hand-off tx")?;
            return Ok(false);
        }

        insert_work(&mut *tx, &next).await?;
        tx.commit().await.context("commit stage hand-off tx")?;
        Ok(true)
    }

    async fn fail(
        &self,
        work_id: Uuid,
        worker_id: &str,
        error_class: ErrorClass,
        requeue_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool> {
        let updated = match requeue_at {
            Some(run_at) => sqlx::query(
                r#"
                UPDATE work_queue
                SET status = 'queued',
                    run_at = $4,
                    claimed_by = NULL,
                    lease_expires_at = NULL,
                    last_error_class = $3,
                    updated_at = now()
                WHERE work_id = $1
                  AND claimed_by = $2
                  AND status = 'running'
                "#,
            )
            .bind(work_id)
            .bind(worker_id)
            .bind(error_class.as_str())
            .bind(run_at)
            .execute(self.pool())
            .await
            .with_context(|| format!("requeue work_id={work_id}"))?,
            None => sqlx::query(
                r#"
                UPDATE work_queue
                SET status = 'failed',
                    claimed_by = NULL,
                    lease_expires_at = NULL,
                    last_error_class = $3,
                    updated_at = now()
                WHERE work_id = $1
                  AND claimed_by = $2
                  AND status = 'running'
                "#,
            )
            .bind(work_id)
            .bind(worker_id)
            .bind(error_class.as_str())
            .execute(self.pool())
            .await
            .with_context(|| format!("fail work_id={work_id}"))?,
        };
        Ok(updated.rows_affected() == 1)
    }

    async fn requeue_expired(&self) -> anyhow::Result<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'queued',
                claimed_by = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE status = 'running'
              AND lease_expires_at <= now()
            "#,
        )
        .execute(self.pool())
        .await
        .context("requeue expired leases")?;
        Ok(updated.rows_affected())
    }

    async fn get_work(&self, work_id: Uuid) -> anyhow::Result<Option<WorkItem>> {
        let row = sqlx::query(&format!(
            "SELECT {WORK_COLUMNS} FROM work_queue WHERE work_id = $1"
        ))
        .bind(work_id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("get work_id={work_id}"))?;
        row.as_ref().map(map_work).transpose()
    }

    async fn latest_for_job_stage(
        &self,
        job_id: Uuid,
        stage: Stage,
    ) -> anyhow::Result<Option<WorkItem>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {WORK_COLUMNS}
            FROM work_queue
            WHERE job_id = $1 AND stage = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(job_id)
        .bind(stage.as_str())
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("latest {stage} work for job {job_id}"))?;
        row.as_ref().map(map_work).transpose()
    }

    async fn queue_counts(&self) -> anyhow::Result<QueueCounts> {
        let row = sqlx::query(
            r#"
            SELECT
              COUNT(*) FILTER (WHERE status = 'queued') AS queued,
              COUNT(*) FILTER (WHERE status = 'running') AS running,
              COUNT(*) FILTER (WHERE status = 'completed') AS completed,
              COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM work_queue
            "#,
        )
        .fetch_one(self.pool())
        .await
        .context("queue counts")?;
        Ok(QueueCounts {
            queued: row.try_get("queued")?,
            running: row.try_get("running")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
        })
    }
}

use crate::PgStore;
use anyhow::Context;
use async_trait::async_trait;
use review_core::store::{AuditLog, NewAuditEvent};

#[async_trait]
impl AuditLog for PgStore {
    async fn record_audit(&self, event: NewAuditEvent) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit (kind, job_id, detail)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(event.kind.as_str())
        .bind(event.job_id)
        .bind(&event.detail)
        .execute(self.pool())
        .await
        .with_context(|| format!("record audit event {}", event.kind.as_str()))?;
        Ok(())
    }
}

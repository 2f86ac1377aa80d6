use anyhow::Context;
use sqlx::PgPool;

/// Run embedded migrations against the store database.
pub async fn run(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("migrate review store db")?;
    tracing::info!("migrations complete");
    Ok(())
}

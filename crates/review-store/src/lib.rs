//! PostgreSQL store for the review pipeline.
//!
//! All mutual exclusion is expressed in SQL: `FOR UPDATE SKIP LOCKED` for
//! claims, unique indexes for idempotent inserts, and owner/status predicates
//! on every guarded update. A stolen lease shows up as `rows_affected = 0`,
//! never as a race.

use anyhow::Context;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

mod audit;
mod dead_letters;
mod jobs;
mod outbox;
mod queue;

pub mod migrate;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connect review store db")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Millisecond count for SQL `('<n>'::text || ' milliseconds')::interval`
/// arithmetic, keeping the store clock authoritative for lease math.
pub(crate) fn duration_millis(d: Duration) -> i64 {
    let ms = d.as_millis();
    if ms > i64::MAX as u128 {
        i64::MAX
    } else {
        ms as i64
    }
}

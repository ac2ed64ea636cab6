//! Postgres persistence for articles, stories, links and the merge audit.

pub mod jobs;
pub mod models;

pub use models::*;

use sqlx::migrate::Migrator;
use sqlx::PgPool;

/// Embedded schema, applied with [`migrate`].
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn migrate(pool: &PgPool) -> storyline_common::Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| storyline_common::StorylineError::Anyhow(e.into()))
}

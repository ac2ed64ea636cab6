//! Centroid maintainer: rebuild aggregates of stale stories from their members.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use storyline_common::{ClusterConfig, Result};
use storyline_store::{Article, Story};

use crate::aggregate::from_members;

#[derive(Debug, Default, Clone, Serialize)]
pub struct CentroidStats {
    pub recomputed: u32,
    /// Stories with no embedded members, left without a centroid.
    pub without_embeddings: u32,
    /// The run stopped on its time budget or story cap.
    pub budget_exhausted: bool,
}

impl fmt::Display for CentroidStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Centroid Recompute ===")?;
        writeln!(f, "Recomputed:         {}", self.recomputed)?;
        writeln!(f, "Without embeddings: {}", self.without_embeddings)?;
        write!(f, "Budget exhausted:   {}", self.budget_exhausted)
    }
}

/// Recompute stale centroids of open stories, oldest first, one story per transaction, until
/// none remain or the run's time budget or story cap is reached.
pub async fn recompute_stale(cfg: &ClusterConfig, pool: &PgPool) -> Result<CentroidStats> {
    let budget = Duration::from_secs(cfg.centroid.time_budget_secs);
    let started = Instant::now();
    let mut stats = CentroidStats::default();
    let mut processed = 0usize;

    loop {
        if started.elapsed() >= budget || processed >= cfg.centroid.max_stories_per_run {
            stats.budget_exhausted = true;
            break;
        }
        let Some(story_id) = recompute_next(cfg, pool, &mut stats).await? else {
            break;
        };
        processed += 1;
        debug!(story_id = %story_id, "Centroid recomputed");
    }

    info!(
        recomputed = stats.recomputed,
        without_embeddings = stats.without_embeddings,
        budget_exhausted = stats.budget_exhausted,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Centroid recompute finished"
    );
    Ok(stats)
}

/// Claim and rebuild one stale story. Stories locked by an attachment or a
/// merge are skipped; their stale marker survives for the next run.
async fn recompute_next(cfg: &ClusterConfig, pool: &PgPool, stats: &mut CentroidStats) -> Result<Option<Uuid>> {
    let mut tx = pool.begin().await?;

    let story = sqlx::query_as::<_, Story>(
        r#"
        SELECT * FROM stories
        WHERE status IN ('active', 'dormant')
          AND (centroid_stale_since IS NOT NULL
               OR (centroid IS NULL AND centroid_computed_at IS NULL))
        ORDER BY centroid_stale_since ASC NULLS FIRST, id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(story) = story else {
        return Ok(None);
    };

    let members = Article::members_of(story.id, &mut *tx).await?;
    let aggregates = from_members(&members, &cfg.scoring, cfg.centroid.max_keyphrases);
    if aggregates.centroid.is_none() {
        stats.without_embeddings += 1;
    }
    Story::save_aggregates(story.id, &aggregates, &mut *tx).await?;
    tx.commit().await?;

    stats.recomputed += 1;
    Ok(Some(story.id))
}

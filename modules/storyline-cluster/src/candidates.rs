//! Candidate generation: a bounded set of open stories worth scoring.
//!
//! Three blocks are unioned: nearest centroids, stories sharing a top entity,
//! and stories updated close to the article's publish time. Closed and merged
//! stories never appear.

use pgvector::Vector;
use sqlx::PgConnection;
use tracing::debug;

use storyline_common::{CandidateConfig, Result, ScoringConfig};
use storyline_store::{Article, Story};

use crate::scorer::article_entity_set;

pub async fn fetch_candidates(
    article: &Article,
    candidates: &CandidateConfig,
    scoring: &ScoringConfig,
    conn: &mut PgConnection,
) -> Result<Vec<Story>> {
    let embedding = article.embedding.clone().map(Vector::from);
    let entity_ids: Vec<String> = article_entity_set(article, scoring)
        .into_iter()
        .map(str::to_string)
        .collect();

    let stories = sqlx::query_as::<_, Story>(
        r#"
        WITH ann AS (
            SELECT id FROM stories
            WHERE status IN ('active', 'dormant')
              AND centroid IS NOT NULL
              AND vector_dims(centroid) = vector_dims($1::vector)
            ORDER BY centroid <=> $1::vector, id
            LIMIT $2
        ),
        by_entity AS (
            SELECT id FROM stories
            WHERE status IN ('active', 'dormant')
              AND top_entities && $3::text[]
            ORDER BY last_updated_at DESC, id
            LIMIT $4
        ),
        recent AS (
            SELECT id FROM stories
            WHERE status IN ('active', 'dormant')
              AND last_updated_at BETWEEN $5 - make_interval(hours => $6::int)
                                      AND $5 + make_interval(hours => $6::int)
            ORDER BY last_updated_at DESC, id
            LIMIT $7
        ),
        ids AS (
            SELECT id FROM ann
            UNION
            SELECT id FROM by_entity
            UNION
            SELECT id FROM recent
        )
        SELECT s.* FROM stories s
        JOIN ids USING (id)
        ORDER BY s.last_updated_at DESC, s.id
        LIMIT $8
        "#,
    )
    .bind(embedding)
    .bind(candidates.ann_limit)
    .bind(&entity_ids)
    .bind(candidates.entity_limit)
    .bind(article.published_at)
    .bind(candidates.time_window_hours)
    .bind(candidates.time_limit)
    .bind(candidates.max_candidates)
    .fetch_all(conn)
    .await?;

    debug!(
        article_id = %article.id,
        candidates = stories.len(),
        entities = entity_ids.len(),
        "Candidates fetched"
    );
    Ok(stories)
}

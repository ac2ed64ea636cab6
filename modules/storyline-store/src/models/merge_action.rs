use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use storyline_common::Result;

/// Audit row written in the same transaction as a story merge.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MergeAction {
    pub id: i64,
    pub survivor_story_id: Uuid,
    pub merged_story_id: Uuid,
    pub centroid_similarity: f64,
    pub entity_similarity: f64,
    pub shared_entities: Vec<String>,
    pub articles_moved: i32,
    pub reason: String,
    pub performed_by: String,
    pub performed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMergeAction {
    pub survivor_story_id: Uuid,
    pub merged_story_id: Uuid,
    pub centroid_similarity: f64,
    pub entity_similarity: f64,
    pub shared_entities: Vec<String>,
    pub articles_moved: i32,
    pub reason: String,
    pub performed_by: String,
}

impl MergeAction {
    pub async fn record(action: &NewMergeAction, conn: &mut PgConnection) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO story_merge_actions (
                survivor_story_id, merged_story_id, centroid_similarity, entity_similarity,
                shared_entities, articles_moved, reason, performed_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(action.survivor_story_id)
        .bind(action.merged_story_id)
        .bind(action.centroid_similarity)
        .bind(action.entity_similarity)
        .bind(&action.shared_entities)
        .bind(action.articles_moved)
        .bind(&action.reason)
        .bind(&action.performed_by)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }

    pub async fn for_story<'e, E>(story_id: Uuid, executor: E) -> Result<Vec<Self>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM story_merge_actions
            WHERE survivor_story_id = $1 OR merged_story_id = $1
            ORDER BY performed_at, id
            "#,
        )
        .bind(story_id)
        .fetch_all(executor)
        .await
        .map_err(Into::into)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use storyline_common::Result;

/// Membership of one article in one story. Keyed by article: an article
/// belongs to at most one story.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArticleStory {
    pub article_id: Uuid,
    pub story_id: Uuid,
    /// `None` for the article that seeded the story.
    pub similarity_score: Option<f64>,
    pub is_primary_source: bool,
    pub attached_at: DateTime<Utc>,
}

impl ArticleStory {
    pub async fn find_by_article<'e, E>(article_id: Uuid, executor: E) -> Result<Option<Self>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_as::<_, Self>("SELECT * FROM article_stories WHERE article_id = $1")
            .bind(article_id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_story<'e, E>(story_id: Uuid, executor: E) -> Result<Vec<Self>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM article_stories WHERE story_id = $1 ORDER BY attached_at, article_id",
        )
        .bind(story_id)
        .fetch_all(executor)
        .await
        .map_err(Into::into)
    }

    /// Insert the link. A primary-source link demotes any previous primary
    /// link of the same story first.
    pub async fn insert(
        article_id: Uuid,
        story_id: Uuid,
        similarity_score: Option<f64>,
        is_primary_source: bool,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        if is_primary_source {
            sqlx::query("UPDATE article_stories SET is_primary_source = false WHERE story_id = $1 AND is_primary_source")
                .bind(story_id)
                .execute(&mut *conn)
                .await?;
        }
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO article_stories (article_id, story_id, similarity_score, is_primary_source)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(article_id)
        .bind(story_id)
        .bind(similarity_score)
        .bind(is_primary_source)
        .fetch_one(&mut *conn)
        .await
        .map_err(Into::into)
    }

    /// Move every link of `from_story` to `to_story`. Moved links lose their
    /// primary-source flag; the survivor keeps its own primary source.
    pub async fn relink(from_story: Uuid, to_story: Uuid, conn: &mut PgConnection) -> Result<u64> {
        let moved = sqlx::query(
            r#"
            UPDATE article_stories
            SET story_id = $2, is_primary_source = false
            WHERE story_id = $1
            "#,
        )
        .bind(from_story)
        .bind(to_story)
        .execute(conn)
        .await?
        .rows_affected();
        Ok(moved)
    }

    pub async fn count_for_story<'e, E>(story_id: Uuid, executor: E) -> Result<i64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM article_stories WHERE story_id = $1")
            .bind(story_id)
            .fetch_one(executor)
            .await
            .map_err(Into::into)
    }
}

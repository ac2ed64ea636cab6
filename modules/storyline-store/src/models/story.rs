use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use storyline_common::{Result, StoryStatus};

/// Entity id → number of member articles carrying it.
pub type EntityCounter = BTreeMap<String, i64>;

#[derive(Debug, Clone, Serialize)]
pub struct Story {
    pub id: Uuid,
    pub headline: String,
    pub headline_salience: f64,
    pub primary_source_domain: Option<String>,
    pub status: StoryStatus,
    #[serde(skip)]
    pub centroid: Option<Vec<f32>>,
    pub centroid_stale_since: Option<DateTime<Utc>>,
    pub centroid_computed_at: Option<DateTime<Utc>>,
    pub entity_counter: EntityCounter,
    pub top_entities: Vec<String>,
    pub keyphrases: Vec<String>,
    pub geography: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub member_count: i32,
    pub merged_into_story_id: Option<Uuid>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Seed values for a story created from a single article.
#[derive(Debug, Clone)]
pub struct NewStory {
    pub headline: String,
    pub headline_salience: f64,
    pub primary_source_domain: Option<String>,
    pub centroid: Option<Vec<f32>>,
    pub entity_counter: EntityCounter,
    pub top_entities: Vec<String>,
    pub keyphrases: Vec<String>,
    pub geography: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// Aggregate changes applied when one article joins a story.
#[derive(Debug, Clone)]
pub struct MemberUpdate {
    pub entity_counter: EntityCounter,
    pub top_entities: Vec<String>,
    pub keyphrases: Vec<String>,
    pub geography: Option<String>,
    pub last_updated_at: DateTime<Utc>,
    /// New headline, salience and source when the article outranks the current headline.
    pub headline: Option<(String, f64, Option<String>)>,
}

/// Values derived from the full member set by the centroid maintainer.
#[derive(Debug, Clone)]
pub struct StoryAggregates {
    pub centroid: Option<Vec<f32>>,
    pub entity_counter: EntityCounter,
    pub top_entities: Vec<String>,
    pub keyphrases: Vec<String>,
    pub geography: Option<String>,
    pub member_count: i32,
}

impl Story {
    pub async fn find_by_id<'e, E>(id: Uuid, executor: E) -> Result<Option<Self>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_as::<_, Self>("SELECT * FROM stories WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    /// Row-lock the story, waiting for any in-flight writer.
    pub async fn lock(id: Uuid, conn: &mut PgConnection) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM stories WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(Into::into)
    }

    /// Row-lock the story only if no one else holds it.
    pub async fn try_lock(id: Uuid, conn: &mut PgConnection) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM stories WHERE id = $1 FOR UPDATE SKIP LOCKED")
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(Into::into)
    }

    /// Insert a story with one member's worth of aggregates. The centroid is
    /// the seed embedding, so it starts fresh rather than stale.
    pub async fn create(new: &NewStory, conn: &mut PgConnection) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO stories (
                id, headline, headline_salience, primary_source_domain, status,
                centroid, centroid_computed_at, entity_counter, top_entities, keyphrases,
                geography, first_seen_at, last_updated_at, member_count
            )
            VALUES ($1, $2, $3, $4, 'active', $5, now(), $6, $7, $8, $9, $10, $10, 1)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.headline)
        .bind(new.headline_salience)
        .bind(&new.primary_source_domain)
        .bind(new.centroid.clone().map(Vector::from))
        .bind(Json(&new.entity_counter))
        .bind(&new.top_entities)
        .bind(&new.keyphrases)
        .bind(&new.geography)
        .bind(new.published_at)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }

    /// Apply one attachment: bump membership, refresh aggregates, reactivate,
    /// and mark the centroid stale for the next recompute.
    pub async fn record_member(id: Uuid, update: &MemberUpdate, conn: &mut PgConnection) -> Result<Self> {
        let (headline, salience, source) = match &update.headline {
            Some((h, s, d)) => (Some(h.as_str()), Some(*s), d.as_deref()),
            None => (None, None, None),
        };
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE stories
            SET member_count = member_count + 1,
                entity_counter = $2,
                top_entities = $3,
                keyphrases = $4,
                geography = COALESCE(geography, $5),
                last_updated_at = GREATEST(last_updated_at, $6),
                status = 'active',
                centroid_stale_since = COALESCE(centroid_stale_since, now()),
                headline = COALESCE($7, headline),
                headline_salience = COALESCE($8, headline_salience),
                primary_source_domain = CASE WHEN $7 IS NULL THEN primary_source_domain ELSE $9 END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Json(&update.entity_counter))
        .bind(&update.top_entities)
        .bind(&update.keyphrases)
        .bind(&update.geography)
        .bind(update.last_updated_at)
        .bind(headline)
        .bind(salience)
        .bind(source)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }

    /// Overwrite member-derived aggregates and clear the stale marker.
    pub async fn save_aggregates(id: Uuid, agg: &StoryAggregates, conn: &mut PgConnection) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE stories
            SET centroid = $2,
                entity_counter = $3,
                top_entities = $4,
                keyphrases = $5,
                geography = COALESCE($6, geography),
                member_count = $7,
                centroid_stale_since = NULL,
                centroid_computed_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(agg.centroid.clone().map(Vector::from))
        .bind(Json(&agg.entity_counter))
        .bind(&agg.top_entities)
        .bind(&agg.keyphrases)
        .bind(&agg.geography)
        .bind(agg.member_count)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }

    /// Widen the survivor's time span to cover an absorbed story and set the
    /// status the merged story carries forward.
    pub async fn extend_span(
        id: Uuid,
        first_seen_at: DateTime<Utc>,
        last_updated_at: DateTime<Utc>,
        status: StoryStatus,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE stories
            SET first_seen_at = LEAST(first_seen_at, $2),
                last_updated_at = GREATEST(last_updated_at, $3),
                status = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(first_seen_at)
        .bind(last_updated_at)
        .bind(status.as_str())
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }

    /// Turn a merged-away story into a tombstone pointing at its survivor.
    pub async fn tombstone(id: Uuid, survivor_id: Uuid, conn: &mut PgConnection) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE stories
            SET status = 'merged',
                merged_into_story_id = $2,
                member_count = 0,
                centroid_stale_since = NULL
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(survivor_id)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }

    /// Manual status change. Reactivation refreshes `last_updated_at` so the
    /// next lifecycle sweep does not immediately close the story again.
    pub async fn set_status(id: Uuid, status: StoryStatus, conn: &mut PgConnection) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE stories
            SET status = $2,
                closed_at = CASE WHEN $2 = 'closed' THEN now() ELSE NULL END,
                last_updated_at = CASE WHEN $2 = 'active' THEN GREATEST(last_updated_at, now())
                                       ELSE last_updated_at END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for Story
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, PgRow> for Story {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status.parse::<StoryStatus>().map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: Box::new(e),
        })?;
        let centroid: Option<Vector> = row.try_get("centroid")?;
        let counter: Json<EntityCounter> = row.try_get("entity_counter")?;
        Ok(Story {
            id: row.try_get("id")?,
            headline: row.try_get("headline")?,
            headline_salience: row.try_get("headline_salience")?,
            primary_source_domain: row.try_get("primary_source_domain")?,
            status,
            centroid: centroid.map(|v| v.to_vec()),
            centroid_stale_since: row.try_get("centroid_stale_since")?,
            centroid_computed_at: row.try_get("centroid_computed_at")?,
            entity_counter: counter.0,
            top_entities: row.try_get("top_entities")?,
            keyphrases: row.try_get("keyphrases")?,
            geography: row.try_get("geography")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_updated_at: row.try_get("last_updated_at")?,
            member_count: row.try_get("member_count")?,
            merged_into_story_id: row.try_get("merged_into_story_id")?,
            closed_at: row.try_get("closed_at")?,
        })
    }
}

use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use storyline_common::canonical::{canonicalize, source_domain, url_hash};
use storyline_common::text::extract_keyphrases;
use storyline_common::{EntityMap, Extraction, NewArticle, Result, StorylineError};

const KEYPHRASES_PER_ARTICLE: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct Article {
    pub id: Uuid,
    pub url: String,
    pub url_hash: String,
    pub title: String,
    pub excerpt: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_name: String,
    pub source_domain: Option<String>,
    /// `None` until extraction has run.
    pub entities: Option<EntityMap>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub keyphrases: Vec<String>,
    pub geography: Option<String>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Created(Article),
    /// Same canonical URL on the same publication day; the stored row is returned.
    Duplicate(Article),
}

impl IngestOutcome {
    pub fn article(&self) -> &Article {
        match self {
            IngestOutcome::Created(a) | IngestOutcome::Duplicate(a) => a,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, IngestOutcome::Created(_))
    }
}

impl Article {
    pub fn is_extracted(&self) -> bool {
        self.extracted_at.is_some()
    }

    /// Entity ids in sorted order, empty before extraction.
    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().flat_map(|m| m.keys().map(String::as_str))
    }

    /// Insert a normalized article. The `(url_hash, published_day)` constraint
    /// makes concurrent duplicate deliveries collapse onto one row.
    pub async fn ingest(new: &NewArticle, pool: &PgPool) -> Result<IngestOutcome> {
        new.validate()?;
        let url = canonicalize(&new.url)?;
        let hash = url_hash(&url);
        let domain = new.source_domain.clone().or_else(|| source_domain(&url));
        let text = match &new.excerpt {
            Some(excerpt) => format!("{} {}", new.title, excerpt),
            None => new.title.clone(),
        };
        let keyphrases = extract_keyphrases(&text, KEYPHRASES_PER_ARTICLE);

        let inserted = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO articles (id, url, url_hash, title, excerpt, published_at, source_name, source_domain, keyphrases)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (url_hash, published_day) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&url)
        .bind(&hash)
        .bind(new.title.trim())
        .bind(&new.excerpt)
        .bind(new.published_at)
        .bind(new.source_name.trim())
        .bind(&domain)
        .bind(&keyphrases)
        .fetch_optional(pool)
        .await?;

        if let Some(article) = inserted {
            info!(article_id = %article.id, url = %article.url, "Article ingested");
            return Ok(IngestOutcome::Created(article));
        }

        let existing = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM articles
            WHERE url_hash = $1 AND published_day = ($2 AT TIME ZONE 'UTC')::date
            "#,
        )
        .bind(&hash)
        .bind(new.published_at)
        .fetch_one(pool)
        .await?;

        debug!(article_id = %existing.id, url = %existing.url, "Duplicate article delivery");
        Ok(IngestOutcome::Duplicate(existing))
    }

    pub async fn find_by_id<'e, E>(id: Uuid, executor: E) -> Result<Option<Self>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_as::<_, Self>("SELECT * FROM articles WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    /// Row-lock the article for the rest of the transaction.
    pub async fn lock(id: Uuid, conn: &mut PgConnection) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM articles WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(Into::into)
    }

    /// Articles linked to a story, oldest first.
    pub async fn members_of<'e, E>(story_id: Uuid, executor: E) -> Result<Vec<Self>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT a.* FROM articles a
            JOIN article_stories l ON l.article_id = a.id
            WHERE l.story_id = $1
            ORDER BY a.published_at, a.id
            "#,
        )
        .bind(story_id)
        .fetch_all(executor)
        .await
        .map_err(Into::into)
    }

    /// Store extractor output. Re-delivery overwrites with the same values.
    /// If the article is already clustered its story's centroid is marked
    /// stale, since the member's embedding may have changed.
    pub async fn record_extraction(
        id: Uuid,
        extraction: &Extraction,
        expected_dim: Option<usize>,
        pool: &PgPool,
    ) -> Result<Self> {
        extraction.validate(expected_dim)?;
        let mut tx = pool.begin().await?;

        let article = sqlx::query_as::<_, Self>(
            r#"
            UPDATE articles
            SET embedding = $2, entities = $3, geography = $4, extracted_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Vector::from(extraction.embedding.clone()))
        .bind(Json(&extraction.entities))
        .bind(extraction.geography.as_deref().map(str::trim).filter(|g| !g.is_empty()))
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StorylineError::NotFound(format!("article {id}")))?;

        let touched = sqlx::query(
            r#"
            UPDATE stories
            SET centroid_stale_since = COALESCE(centroid_stale_since, now())
            WHERE id = (SELECT story_id FROM article_stories WHERE article_id = $1)
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        debug!(
            article_id = %id,
            entities = extraction.entities.len(),
            dims = extraction.embedding.len(),
            story_marked_stale = touched > 0,
            "Extraction recorded"
        );
        Ok(article)
    }
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for Article
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, PgRow> for Article {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let entities: Option<Json<EntityMap>> = row.try_get("entities")?;
        let embedding: Option<Vector> = row.try_get("embedding")?;
        Ok(Article {
            id: row.try_get("id")?,
            url: row.try_get("url")?,
            url_hash: row.try_get("url_hash")?,
            title: row.try_get("title")?,
            excerpt: row.try_get("excerpt")?,
            published_at: row.try_get("published_at")?,
            source_name: row.try_get("source_name")?,
            source_domain: row.try_get("source_domain")?,
            entities: entities.map(|j| j.0),
            embedding: embedding.map(|v| v.to_vec()),
            keyphrases: row.try_get("keyphrases")?,
            geography: row.try_get("geography")?,
            extracted_at: row.try_get("extracted_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

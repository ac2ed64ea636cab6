//! Shared setup for clustering integration tests.
//! Requires Postgres with pgvector. Set DATABASE_TEST_URL or tests are skipped.

#![allow(dead_code)]

use chrono::{DateTime, SubsecRound, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use storyline_common::{ClusterConfig, EntityMap, Extraction, NewArticle};
use storyline_store::{Article, Story};

static DB_LOCK: Mutex<()> = Mutex::const_new(());

pub struct TestDb {
    _guard: MutexGuard<'static, ()>,
    pub pool: PgPool,
}

/// Migrated, empty database, or `None` when no test database is configured.
pub async fn setup() -> Option<TestDb> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let guard = DB_LOCK.lock().await;
    let pool = PgPoolOptions::new().max_connections(16).connect(&url).await.ok()?;
    storyline_store::migrate(&pool).await.ok()?;
    sqlx::query("TRUNCATE story_merge_actions, article_stories, stories, articles, job_queue RESTART IDENTITY")
        .execute(&pool)
        .await
        .ok()?;
    Some(TestDb { _guard: guard, pool })
}

/// Wall clock at microsecond precision, so timestamps survive a Postgres round trip.
pub fn test_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn cluster_config() -> ClusterConfig {
    ClusterConfig::default()
}

/// Builder for an ingested and extracted article.
pub struct Fixture<'a> {
    title: &'a str,
    embedding: Vec<f32>,
    entities: Vec<&'a str>,
    geography: Option<&'a str>,
    published_at: DateTime<Utc>,
}

pub fn article<'a>(title: &'a str, embedding: &[f32], entities: &[&'a str], published_at: DateTime<Utc>) -> Fixture<'a> {
    Fixture {
        title,
        embedding: embedding.to_vec(),
        entities: entities.to_vec(),
        geography: None,
        published_at,
    }
}

impl<'a> Fixture<'a> {
    pub fn geography(mut self, geo: &'a str) -> Self {
        self.geography = Some(geo);
        self
    }

    /// Ingest only; the article stays unextracted.
    pub async fn ingest(&self, pool: &PgPool) -> Uuid {
        let new = NewArticle::builder()
            .url(format!("https://wire.example.com/{}", Uuid::new_v4()))
            .title(self.title)
            .published_at(self.published_at)
            .source_name("Example Wire")
            .build();
        Article::ingest(&new, pool).await.unwrap().article().id
    }

    pub async fn insert(&self, pool: &PgPool) -> Uuid {
        let id = self.ingest(pool).await;
        let extraction = Extraction {
            embedding: self.embedding.clone(),
            entities: self.entities.iter().map(|e| (e.to_string(), 0.9)).collect::<EntityMap>(),
            geography: self.geography.map(str::to_string),
        };
        Article::record_extraction(id, &extraction, None, pool).await.unwrap();
        id
    }
}

pub async fn story(pool: &PgPool, id: Uuid) -> Story {
    Story::find_by_id(id, pool).await.unwrap().unwrap()
}

pub async fn link_count(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM article_stories")
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Sum of member counts over stories that are not tombstones.
pub async fn live_member_total(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COALESCE(SUM(member_count), 0)::BIGINT FROM stories WHERE status <> 'merged'")
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn story_count(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM stories WHERE status <> 'merged'")
        .fetch_one(pool)
        .await
        .unwrap()
}

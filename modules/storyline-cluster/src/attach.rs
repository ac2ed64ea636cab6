//! Attach-or-create: place one extracted article into exactly one story.
//!
//! Everything happens in one transaction. The article row lock serializes
//! deliveries of the same article; candidate stories are re-scored after
//! their row lock is taken so a concurrent attachment is never overwritten.
//! Story creation runs under a transaction-scoped advisory lock and re-checks
//! candidates first, so two near-identical articles arriving together end up
//! in one story instead of two.
//!
//! Each candidate is locked inside a savepoint. A candidate that fails the
//! re-score is rolled back to the savepoint, which releases its row lock, so
//! the transaction never waits on a lock while holding a story it rejected.

use serde::Serialize;
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use storyline_common::{ClusterConfig, JobPayload, Result, StorylineError};
use storyline_store::{jobs, Article, ArticleStory, MemberUpdate, NewStory, Story};

use crate::aggregate::{add_entities, headline_salience, top_entities, union_keyphrases};
use crate::candidates::fetch_candidates;
use crate::scorer::{is_eligible, rank_candidates, score, threshold_for};

/// Advisory lock key guarding story creation.
pub const STORY_CREATE_LOCK: i64 = 0x5354_4f52_5943_5245;

#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub article_id: Uuid,
    pub story_id: Uuid,
    /// A new story was seeded by this article.
    pub created: bool,
    /// The article was already linked; nothing changed.
    pub already_linked: bool,
    /// Total similarity; `None` for a seeded story or a repeat delivery.
    pub score: Option<f64>,
}

pub async fn attach_or_create(article_id: Uuid, cfg: &ClusterConfig, pool: &PgPool) -> Result<Attachment> {
    let mut tx = pool.begin().await?;

    let article = Article::lock(article_id, &mut *tx)
        .await?
        .ok_or_else(|| StorylineError::NotFound(format!("article {article_id}")))?;

    if let Some(link) = ArticleStory::find_by_article(article_id, &mut *tx).await? {
        tx.commit().await?;
        debug!(article_id = %article_id, story_id = %link.story_id, "Article already clustered");
        return Ok(Attachment {
            article_id,
            story_id: link.story_id,
            created: false,
            already_linked: true,
            score: None,
        });
    }

    if !article.is_extracted() {
        return Err(StorylineError::MissingExtraction(article_id));
    }

    let attachment = match try_attach(&article, cfg, &mut *tx).await? {
        Some(attachment) => attachment,
        None => {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(STORY_CREATE_LOCK)
                .execute(&mut *tx)
                .await?;
            // Another worker may have created a matching story while we waited.
            match try_attach(&article, cfg, &mut *tx).await? {
                Some(attachment) => attachment,
                None => create_story(&article, cfg, &mut *tx).await?,
            }
        }
    };

    jobs::enqueue(&mut *tx, JobPayload::EnrichStory { story_id: attachment.story_id }).await?;
    tx.commit().await?;

    info!(
        article_id = %article_id,
        story_id = %attachment.story_id,
        created = attachment.created,
        score = attachment.score,
        "Article clustered"
    );
    Ok(attachment)
}

async fn try_attach(article: &Article, cfg: &ClusterConfig, conn: &mut PgConnection) -> Result<Option<Attachment>> {
    let scoring = &cfg.scoring;
    let now = article.published_at;
    let stories = fetch_candidates(article, &cfg.candidates, scoring, conn).await?;
    let ranked = rank_candidates(article, &stories, now, scoring);
    let threshold = threshold_for(article, scoring);

    for candidate in ranked {
        let mut savepoint = conn.begin().await?;
        let Some(story) = Story::lock(candidate.story_id, &mut *savepoint).await? else {
            savepoint.rollback().await?;
            continue;
        };
        // The snapshot score may be stale; only the locked row counts.
        let breakdown = score(article, &story, now, scoring);
        if !is_eligible(story.status, &breakdown, threshold, scoring) {
            savepoint.rollback().await?;
            debug!(
                article_id = %article.id,
                story_id = %story.id,
                snapshot = candidate.breakdown.total,
                locked = breakdown.total,
                "Candidate no longer eligible after lock"
            );
            continue;
        }

        let mut entity_counter = story.entity_counter.clone();
        add_entities(&mut entity_counter, article.entity_ids());

        let salience = headline_salience(article, scoring);
        let headline = (salience > story.headline_salience)
            .then(|| (article.title.clone(), salience, article.source_domain.clone()));
        let is_primary = headline.is_some();

        let update = MemberUpdate {
            top_entities: top_entities(&entity_counter, scoring),
            entity_counter,
            keyphrases: union_keyphrases(&story.keyphrases, &article.keyphrases, cfg.centroid.max_keyphrases),
            geography: article.geography.as_deref().map(str::to_lowercase),
            last_updated_at: article.published_at,
            headline,
        };
        Story::record_member(story.id, &update, &mut *savepoint).await?;
        ArticleStory::insert(article.id, story.id, Some(breakdown.total), is_primary, &mut *savepoint).await?;
        savepoint.commit().await?;

        return Ok(Some(Attachment {
            article_id: article.id,
            story_id: story.id,
            created: false,
            already_linked: false,
            score: Some(breakdown.total),
        }));
    }
    Ok(None)
}

async fn create_story(article: &Article, cfg: &ClusterConfig, conn: &mut PgConnection) -> Result<Attachment> {
    let scoring = &cfg.scoring;
    let mut entity_counter = Default::default();
    add_entities(&mut entity_counter, article.entity_ids());

    let new = NewStory {
        headline: article.title.clone(),
        headline_salience: headline_salience(article, scoring),
        primary_source_domain: article.source_domain.clone(),
        centroid: article.embedding.clone(),
        top_entities: top_entities(&entity_counter, scoring),
        entity_counter,
        keyphrases: union_keyphrases(&[], &article.keyphrases, cfg.centroid.max_keyphrases),
        geography: article.geography.as_deref().map(str::to_lowercase),
        published_at: article.published_at,
    };
    let story = Story::create(&new, conn).await?;
    ArticleStory::insert(article.id, story.id, None, true, conn).await?;

    Ok(Attachment {
        article_id: article.id,
        story_id: story.id,
        created: true,
        already_linked: false,
        score: None,
    })
}

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::info;

use storyline_common::{AppConfig, JobPayload, Result, StorylineError};
use storyline_queue::JobOutcome;
use storyline_store::{jobs, Article};

/// Shared state for job handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
}

/// Run one decoded job to completion.
pub async fn handle(payload: JobPayload, ctx: &HandlerContext) -> Result<()> {
    let cluster = &ctx.config.cluster;
    match payload {
        JobPayload::IngestArticle { article } => {
            Article::ingest(&article, &ctx.pool).await?;
            Ok(())
        }
        JobPayload::RecordExtraction { article_id, extraction } => {
            Article::record_extraction(article_id, &extraction, ctx.config.worker.embedding_dim, &ctx.pool).await?;
            jobs::enqueue(&ctx.pool, JobPayload::ClusterArticle { article_id }).await?;
            Ok(())
        }
        JobPayload::ClusterArticle { article_id } => {
            storyline_cluster::attach_or_create(article_id, cluster, &ctx.pool).await?;
            Ok(())
        }
        JobPayload::EnrichStory { story_id } => Err(StorylineError::Validation(format!(
            "enrich-story {story_id} is consumed by the enrichment service"
        ))),
        JobPayload::RecomputeCentroids {} => {
            let stats = storyline_cluster::recompute_stale(cluster, &ctx.pool).await?;
            info!("Centroid run complete. {stats}");
            Ok(())
        }
        JobPayload::MergeStories {} => {
            let stats = storyline_cluster::run_merge_pass(cluster, &ctx.pool).await?;
            info!("Merge run complete. {stats}");
            Ok(())
        }
        JobPayload::LifecycleSweep {} => {
            let stats = storyline_cluster::sweep(Utc::now(), &cluster.lifecycle, &ctx.pool).await?;
            info!("{stats}");
            Ok(())
        }
    }
}

/// Transient failures and late-arriving data are retried; everything else
/// fails the job for good.
pub fn outcome_for(err: &StorylineError) -> JobOutcome {
    if err.is_retryable() {
        JobOutcome::Retry(err.to_string())
    } else {
        JobOutcome::Fatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn missing_extraction_is_retried() {
        let outcome = outcome_for(&StorylineError::MissingExtraction(Uuid::nil()));
        assert!(matches!(outcome, JobOutcome::Retry(_)));
    }

    #[test]
    fn policy_and_payload_errors_are_fatal() {
        assert!(matches!(
            outcome_for(&StorylineError::Policy("story is merged".into())),
            JobOutcome::Fatal(_)
        ));
        assert!(matches!(
            outcome_for(&StorylineError::InvalidPayload("cluster-article: missing field".into())),
            JobOutcome::Fatal(_)
        ));
        assert!(matches!(
            outcome_for(&StorylineError::NotFound("article".into())),
            JobOutcome::Fatal(_)
        ));
    }
}

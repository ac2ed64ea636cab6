//! Similarity scorer: pure, deterministic article-to-story scoring.
//!
//! Each component is normalized to [0, 1] and the total is the weighted mean
//! over the components that take part. Geography and keyphrases may sit out
//! when one side lacks the signal, depending on [`AbsentSignalPolicy`].

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use storyline_common::text::{jaccard, token_set};
use storyline_common::{AbsentSignalPolicy, ScoringConfig, StoryStatus};
use storyline_store::{Article, Story};

use crate::aggregate::cosine_similarity;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreComponents {
    pub embedding: f64,
    pub entity: f64,
    pub title: f64,
    pub time: f64,
    /// `None` when excluded from the denominator.
    pub geography: Option<f64>,
    pub keyphrase: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub total: f64,
    pub components: ScoreComponents,
    /// Non-stopword entities the article shares with the story's top list.
    pub shared_entities: usize,
}

/// Score `article` against `story` as of `now`.
pub fn score(article: &Article, story: &Story, now: DateTime<Utc>, cfg: &ScoringConfig) -> ScoreBreakdown {
    let embedding = match (&article.embedding, &story.centroid) {
        (Some(a), Some(c)) => cosine_similarity(a, c).clamp(0.0, 1.0),
        _ => 0.0,
    };

    let article_entities = article_entity_set(article, cfg);
    let story_entities = story_entity_set(story, cfg);
    let entity = jaccard(&article_entities, &story_entities);
    let shared_entities = article_entities.intersection(&story_entities).count();

    let title = jaccard(&token_set(&article.title), &token_set(&story.headline));

    let hours = (now - story.last_updated_at).num_seconds().abs() as f64 / 3600.0;
    let time = 0.5f64.powf(hours / cfg.half_life_hours);

    let geography = match (article.geography.as_deref(), story.geography.as_deref()) {
        (Some(a), Some(s)) => Some(if a.eq_ignore_ascii_case(s) { 1.0 } else { 0.0 }),
        _ => absent(cfg.absent_policy),
    };

    let keyphrase = if article.keyphrases.is_empty() || story.keyphrases.is_empty() {
        absent(cfg.absent_policy)
    } else {
        let a: BTreeSet<String> = article.keyphrases.iter().map(|p| p.to_lowercase()).collect();
        let s: BTreeSet<String> = story.keyphrases.iter().map(|p| p.to_lowercase()).collect();
        Some(jaccard(&a, &s))
    };

    let components = ScoreComponents {
        embedding,
        entity,
        title,
        time,
        geography,
        keyphrase,
    };
    ScoreBreakdown {
        total: weighted_total(&components, cfg),
        components,
        shared_entities,
    }
}

fn absent(policy: AbsentSignalPolicy) -> Option<f64> {
    match policy {
        AbsentSignalPolicy::Neutral => None,
        AbsentSignalPolicy::Penalize => Some(0.0),
    }
}

fn weighted_total(c: &ScoreComponents, cfg: &ScoringConfig) -> f64 {
    let w = &cfg.weights;
    let parts = [
        Some((w.embedding, c.embedding)),
        Some((w.entity, c.entity)),
        Some((w.title, c.title)),
        Some((w.time, c.time)),
        c.geography.map(|s| (w.geography, s)),
        c.keyphrase.map(|s| (w.keyphrase, s)),
    ];
    let (num, den) = parts
        .into_iter()
        .flatten()
        .fold((0.0, 0.0), |(num, den), (weight, s)| (num + weight * s, den + weight));
    if den <= 0.0 {
        return 0.0;
    }
    (num / den).clamp(0.0, 1.0)
}

pub fn article_entity_set<'a>(article: &'a Article, cfg: &ScoringConfig) -> BTreeSet<&'a str> {
    article.entity_ids().filter(|id| !cfg.is_stopword(id)).collect()
}

pub fn story_entity_set<'a>(story: &'a Story, cfg: &ScoringConfig) -> BTreeSet<&'a str> {
    story
        .top_entities
        .iter()
        .map(String::as_str)
        .filter(|id| !cfg.is_stopword(id))
        .collect()
}

/// Attach threshold for `article`; wire-service copy attaches more readily.
pub fn threshold_for(article: &Article, cfg: &ScoringConfig) -> f64 {
    cfg.threshold_for(article.source_domain.as_deref())
}

/// Plain threshold test on the total.
pub fn is_attachable(breakdown: &ScoreBreakdown, threshold: f64) -> bool {
    breakdown.total >= threshold
}

/// Threshold test that also applies the stricter bar for dormant stories.
/// Closed and merged stories are never eligible.
pub fn is_eligible(status: StoryStatus, breakdown: &ScoreBreakdown, threshold: f64, cfg: &ScoringConfig) -> bool {
    match status {
        StoryStatus::Active => is_attachable(breakdown, threshold),
        StoryStatus::Dormant => {
            is_attachable(breakdown, threshold)
                && breakdown.total >= cfg.dormant_reattach_threshold
                && breakdown.shared_entities >= cfg.dormant_min_shared_entities
        }
        StoryStatus::Closed | StoryStatus::Merged => false,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub story_id: Uuid,
    pub status: StoryStatus,
    pub last_updated_at: DateTime<Utc>,
    pub breakdown: ScoreBreakdown,
}

/// Eligible candidates, best first: highest total, then most recently
/// updated, then lowest id.
pub fn rank_candidates(
    article: &Article,
    stories: &[Story],
    now: DateTime<Utc>,
    cfg: &ScoringConfig,
) -> Vec<ScoredCandidate> {
    let threshold = threshold_for(article, cfg);
    let mut ranked: Vec<ScoredCandidate> = stories
        .iter()
        .map(|story| ScoredCandidate {
            story_id: story.id,
            status: story.status,
            last_updated_at: story.last_updated_at,
            breakdown: score(article, story, now, cfg),
        })
        .filter(|c| is_eligible(c.status, &c.breakdown, threshold, cfg))
        .collect();
    ranked.sort_by(compare_candidates);
    ranked
}

fn compare_candidates(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.breakdown
        .total
        .total_cmp(&a.breakdown.total)
        .then_with(|| b.last_updated_at.cmp(&a.last_updated_at))
        .then_with(|| a.story_id.cmp(&b.story_id))
}

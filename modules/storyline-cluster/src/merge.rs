//! Duplicate-story merge pass.
//!
//! Stories of the same event sometimes fragment when early articles disagree.
//! The pass compares recently updated open stories pairwise and folds each
//! qualifying pair into a survivor, leaving the loser as a tombstone.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::Duration;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use storyline_common::text::jaccard;
use storyline_common::{ClusterConfig, JobPayload, Result, StoryStatus, StorylineError};
use storyline_store::{jobs, Article, ArticleStory, MergeAction, NewMergeAction, Story, StoryAggregates};

use crate::aggregate::{cosine_similarity, mean_embedding, merge_counters, top_entities, union_keyphrases};
use crate::scorer::story_entity_set;

const PERFORMED_BY: &str = "merge-pass";

/// Why two stories were judged duplicates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeEvidence {
    pub centroid_similarity: f64,
    pub entity_similarity: f64,
    pub shared_entities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergePlan {
    pub survivor_id: Uuid,
    pub loser_id: Uuid,
    pub evidence: MergeEvidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MergeOutcome {
    Merged { articles_moved: u64 },
    /// One of the stories was locked by an in-flight writer.
    SkippedLocked,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct MergeStats {
    pub scanned: u32,
    pub candidate_pairs: u32,
    pub merged: u32,
    pub articles_moved: u64,
    pub skipped_locked: u32,
    pub rejected: u32,
}

impl fmt::Display for MergeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Merge Pass ===")?;
        writeln!(f, "Stories scanned:  {}", self.scanned)?;
        writeln!(f, "Candidate pairs:  {}", self.candidate_pairs)?;
        writeln!(f, "Merged:           {}", self.merged)?;
        writeln!(f, "Articles moved:   {}", self.articles_moved)?;
        writeln!(f, "Skipped (locked): {}", self.skipped_locked)?;
        write!(f, "Rejected:         {}", self.rejected)
    }
}

/// Duplicate test for one pair. `None` when any criterion fails.
pub fn evaluate_pair(a: &Story, b: &Story, cfg: &ClusterConfig) -> Option<MergeEvidence> {
    let m = &cfg.merge;
    if !a.status.is_open() || !b.status.is_open() || a.id == b.id {
        return None;
    }
    if (a.first_seen_at - b.first_seen_at).abs() > Duration::days(m.max_gap_days) {
        return None;
    }

    let ea = story_entity_set(a, &cfg.scoring);
    let eb = story_entity_set(b, &cfg.scoring);
    let shared: BTreeSet<&str> = ea.intersection(&eb).copied().collect();
    if shared.len() < m.min_shared_entities {
        return None;
    }

    let centroid_similarity = match (&a.centroid, &b.centroid) {
        (Some(ca), Some(cb)) => cosine_similarity(ca, cb),
        _ => return None,
    };
    if centroid_similarity < m.centroid_threshold {
        return None;
    }

    let entity_similarity = jaccard(&ea, &eb);
    if entity_similarity < m.entity_threshold {
        return None;
    }

    Some(MergeEvidence {
        centroid_similarity,
        entity_similarity,
        shared_entities: shared.into_iter().map(str::to_string).collect(),
    })
}

/// Survivor is the story with more members, then the older one, then the
/// lower id. Returns `(survivor, loser)`.
pub fn choose_survivor<'a>(a: &'a Story, b: &'a Story) -> (&'a Story, &'a Story) {
    let a_wins = b
        .member_count
        .cmp(&a.member_count)
        .then_with(|| a.first_seen_at.cmp(&b.first_seen_at))
        .then_with(|| a.id.cmp(&b.id))
        .is_le();
    if a_wins {
        (a, b)
    } else {
        (b, a)
    }
}

/// Status of the survivor after absorbing `loser`. An active side keeps the
/// merged story active; the sweep demotes it later if it goes quiet.
pub fn merged_status(survivor: &Story, loser: &Story) -> StoryStatus {
    if survivor.status == StoryStatus::Active || loser.status == StoryStatus::Active {
        StoryStatus::Active
    } else {
        survivor.status
    }
}

/// Greedy plan over all qualifying pairs, most similar first. Each story
/// takes part in at most one merge.
pub fn plan_merges(stories: &[Story], cfg: &ClusterConfig) -> Vec<MergePlan> {
    let mut pairs: Vec<MergePlan> = Vec::new();
    for (i, a) in stories.iter().enumerate() {
        for b in &stories[i + 1..] {
            if let Some(evidence) = evaluate_pair(a, b, cfg) {
                let (survivor, loser) = choose_survivor(a, b);
                pairs.push(MergePlan {
                    survivor_id: survivor.id,
                    loser_id: loser.id,
                    evidence,
                });
            }
        }
    }
    pairs.sort_by(|x, y| {
        y.evidence
            .centroid_similarity
            .total_cmp(&x.evidence.centroid_similarity)
            .then_with(|| x.survivor_id.cmp(&y.survivor_id))
            .then_with(|| x.loser_id.cmp(&y.loser_id))
    });

    let mut used: HashSet<Uuid> = HashSet::new();
    pairs
        .into_iter()
        .filter(|p| {
            if used.contains(&p.survivor_id) || used.contains(&p.loser_id) {
                return false;
            }
            used.insert(p.survivor_id);
            used.insert(p.loser_id);
            true
        })
        .take(cfg.merge.max_merges)
        .collect()
}

/// Fold `loser_id` into `survivor_id` in one transaction.
pub async fn merge_stories(
    survivor_id: Uuid,
    loser_id: Uuid,
    evidence: &MergeEvidence,
    cfg: &ClusterConfig,
    pool: &PgPool,
) -> Result<MergeOutcome> {
    if survivor_id == loser_id {
        return Err(StorylineError::Policy(format!("story {survivor_id} cannot merge into itself")));
    }
    let mut tx = pool.begin().await?;

    let locked = sqlx::query_as::<_, Story>(
        "SELECT * FROM stories WHERE id = ANY($1) ORDER BY id FOR UPDATE SKIP LOCKED",
    )
    .bind(vec![survivor_id, loser_id])
    .fetch_all(&mut *tx)
    .await?;

    if locked.len() < 2 {
        // SKIP LOCKED hides missing rows and locked rows alike
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stories WHERE id = ANY($1)")
            .bind(vec![survivor_id, loser_id])
            .fetch_one(&mut *tx)
            .await?;
        if existing < 2 {
            return Err(StorylineError::NotFound(format!("stories {survivor_id}, {loser_id}")));
        }
        debug!(survivor = %survivor_id, loser = %loser_id, "Merge skipped, story locked");
        return Ok(MergeOutcome::SkippedLocked);
    }
    let (Some(survivor), Some(loser)) = (
        locked.iter().find(|s| s.id == survivor_id),
        locked.iter().find(|s| s.id == loser_id),
    ) else {
        return Err(StorylineError::NotFound(format!("stories {survivor_id}, {loser_id}")));
    };
    for story in [survivor, loser] {
        if !story.status.is_open() {
            return Err(StorylineError::Policy(format!(
                "story {} is {} and cannot be merged",
                story.id, story.status
            )));
        }
    }

    let moved = ArticleStory::relink(loser.id, survivor.id, &mut *tx).await?;

    let mut entity_counter = survivor.entity_counter.clone();
    merge_counters(&mut entity_counter, &loser.entity_counter);
    let members = Article::members_of(survivor.id, &mut *tx).await?;
    let member_count = survivor.member_count + loser.member_count;
    if member_count as usize != members.len() {
        warn!(
            survivor = %survivor.id,
            counted = member_count,
            linked = members.len(),
            "Member count disagrees with links after merge"
        );
    }
    let aggregates = StoryAggregates {
        centroid: mean_embedding(members.iter().filter_map(|a| a.embedding.as_deref())),
        top_entities: top_entities(&entity_counter, &cfg.scoring),
        entity_counter,
        keyphrases: union_keyphrases(&survivor.keyphrases, &loser.keyphrases, cfg.centroid.max_keyphrases),
        geography: survivor.geography.clone().or_else(|| loser.geography.clone()),
        member_count,
    };
    Story::save_aggregates(survivor.id, &aggregates, &mut *tx).await?;
    let status = merged_status(survivor, loser);
    Story::extend_span(survivor.id, loser.first_seen_at, loser.last_updated_at, status, &mut *tx).await?;
    Story::tombstone(loser.id, survivor.id, &mut *tx).await?;

    MergeAction::record(
        &NewMergeAction {
            survivor_story_id: survivor.id,
            merged_story_id: loser.id,
            centroid_similarity: evidence.centroid_similarity,
            entity_similarity: evidence.entity_similarity,
            shared_entities: evidence.shared_entities.clone(),
            articles_moved: moved as i32,
            reason: format!(
                "centroid {:.3} >= {:.2}, entities {:.3} >= {:.2}, {} shared",
                evidence.centroid_similarity,
                cfg.merge.centroid_threshold,
                evidence.entity_similarity,
                cfg.merge.entity_threshold,
                evidence.shared_entities.len()
            ),
            performed_by: PERFORMED_BY.to_string(),
        },
        &mut *tx,
    )
    .await?;

    jobs::enqueue(&mut *tx, JobPayload::EnrichStory { story_id: survivor.id }).await?;
    tx.commit().await?;

    info!(
        survivor = %survivor_id,
        loser = %loser_id,
        centroid_similarity = evidence.centroid_similarity,
        entity_similarity = evidence.entity_similarity,
        shared = ?evidence.shared_entities,
        articles_moved = moved,
        "Stories merged"
    );
    Ok(MergeOutcome::Merged { articles_moved: moved })
}

/// Scan recently updated open stories and merge duplicates.
pub async fn run_merge_pass(cfg: &ClusterConfig, pool: &PgPool) -> Result<MergeStats> {
    let stories = sqlx::query_as::<_, Story>(
        r#"
        SELECT * FROM stories
        WHERE status IN ('active', 'dormant') AND centroid IS NOT NULL
        ORDER BY last_updated_at DESC, id
        LIMIT $1
        "#,
    )
    .bind(cfg.merge.scan_limit)
    .fetch_all(pool)
    .await?;

    let plans = plan_merges(&stories, cfg);
    let mut stats = MergeStats {
        scanned: stories.len() as u32,
        candidate_pairs: plans.len() as u32,
        ..Default::default()
    };

    for plan in &plans {
        match merge_stories(plan.survivor_id, plan.loser_id, &plan.evidence, cfg, pool).await {
            Ok(MergeOutcome::Merged { articles_moved }) => {
                stats.merged += 1;
                stats.articles_moved += articles_moved;
            }
            Ok(MergeOutcome::SkippedLocked) => stats.skipped_locked += 1,
            Err(StorylineError::Policy(reason)) => {
                warn!(survivor = %plan.survivor_id, loser = %plan.loser_id, reason = %reason, "Merge rejected");
                stats.rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        scanned = stats.scanned,
        merged = stats.merged,
        articles_moved = stats.articles_moved,
        skipped_locked = stats.skipped_locked,
        rejected = stats.rejected,
        "Merge pass finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::story;
    use chrono::Utc;

    fn cfg() -> ClusterConfig {
        ClusterConfig::default()
    }

    // --- evaluate_pair tests ---

    #[test]
    fn near_identical_stories_qualify() {
        let now = Utc::now();
        let a = story("Dam failure floods valley", vec![1.0, 0.1], &["P", "Q", "R"], now);
        let b = story("Valley flooded after dam fails", vec![1.0, 0.12], &["P", "Q", "S"], now);
        let evidence = evaluate_pair(&a, &b, &cfg()).unwrap();
        assert!(evidence.centroid_similarity > 0.99);
        assert!((evidence.entity_similarity - 0.5).abs() < 1e-9);
        assert_eq!(evidence.shared_entities, vec!["P", "Q"]);
    }

    #[test]
    fn one_shared_entity_is_not_enough() {
        let now = Utc::now();
        let a = story("a", vec![1.0, 0.0], &["P", "Q"], now);
        let b = story("b", vec![1.0, 0.0], &["P", "R"], now);
        assert!(evaluate_pair(&a, &b, &cfg()).is_none());
    }

    #[test]
    fn stopword_entities_are_not_shared_evidence() {
        let now = Utc::now();
        let a = story("a", vec![1.0, 0.0], &["ORG-CONGRESS", "US-TRUMP", "P"], now);
        let b = story("b", vec![1.0, 0.0], &["ORG-CONGRESS", "US-TRUMP", "Q"], now);
        assert!(evaluate_pair(&a, &b, &cfg()).is_none());
    }

    #[test]
    fn distant_first_seen_blocks_merge() {
        let now = Utc::now();
        let a = story("a", vec![1.0, 0.0], &["P", "Q"], now);
        let mut b = story("b", vec![1.0, 0.0], &["P", "Q"], now);
        b.first_seen_at = now - Duration::days(8);
        assert!(evaluate_pair(&a, &b, &cfg()).is_none());
        b.first_seen_at = now - Duration::days(7);
        assert!(evaluate_pair(&a, &b, &cfg()).is_some());
    }

    #[test]
    fn closed_or_merged_stories_never_qualify() {
        let now = Utc::now();
        let a = story("a", vec![1.0, 0.0], &["P", "Q"], now);
        let mut b = story("b", vec![1.0, 0.0], &["P", "Q"], now);
        b.status = StoryStatus::Closed;
        assert!(evaluate_pair(&a, &b, &cfg()).is_none());
        b.status = StoryStatus::Merged;
        assert!(evaluate_pair(&a, &b, &cfg()).is_none());
        b.status = StoryStatus::Dormant;
        assert!(evaluate_pair(&a, &b, &cfg()).is_some());
    }

    // --- survivor and planning tests ---

    #[test]
    fn survivor_prefers_members_then_age_then_id() {
        let now = Utc::now();
        let mut a = story("a", vec![1.0], &[], now);
        let mut b = story("b", vec![1.0], &[], now);
        a.member_count = 2;
        b.member_count = 5;
        assert_eq!(choose_survivor(&a, &b).0.id, b.id);

        b.member_count = 2;
        b.first_seen_at = now - Duration::hours(1);
        assert_eq!(choose_survivor(&a, &b).0.id, b.id);

        b.first_seen_at = a.first_seen_at;
        let lower = a.id.min(b.id);
        assert_eq!(choose_survivor(&a, &b).0.id, lower);
        assert_eq!(choose_survivor(&b, &a).0.id, lower);
    }

    #[test]
    fn dormant_survivor_absorbing_active_story_becomes_active() {
        let now = Utc::now();
        let mut survivor = story("a", vec![1.0, 0.0], &["P", "Q"], now - Duration::hours(100));
        survivor.status = StoryStatus::Dormant;
        survivor.member_count = 5;
        let loser = story("b", vec![1.0, 0.0], &["P", "Q"], now - Duration::hours(1));
        assert_eq!(choose_survivor(&survivor, &loser).0.id, survivor.id);
        assert_eq!(merged_status(&survivor, &loser), StoryStatus::Active);

        let mut quiet = loser.clone();
        quiet.status = StoryStatus::Dormant;
        assert_eq!(merged_status(&survivor, &quiet), StoryStatus::Dormant);
    }

    #[test]
    fn each_story_merges_at_most_once_per_plan() {
        let now = Utc::now();
        let a = story("a", vec![1.0, 0.0], &["P", "Q"], now);
        let b = story("b", vec![1.0, 0.01], &["P", "Q"], now);
        let c = story("c", vec![1.0, 0.02], &["P", "Q"], now);
        let plans = plan_merges(&[a, b, c], &cfg());
        assert_eq!(plans.len(), 1);
    }

    #[test]
    fn plan_respects_max_merges() {
        let now = Utc::now();
        let mut stories = Vec::new();
        for i in 0..6 {
            let x = i as f32;
            stories.push(story("x", vec![1.0, x * 10.0], &["P", "Q"], now));
            stories.push(story("y", vec![1.0, x * 10.0 + 0.01], &["P", "Q"], now));
        }
        let config = ClusterConfig {
            merge: storyline_common::MergeConfig {
                max_merges: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(plan_merges(&stories, &config).len(), 2);
    }
}

//! Pure reductions over story members: centroid, entity counter, top-N,
//! keyphrases, geography. Used by attachment (incrementally), by the centroid
//! maintainer (from scratch) and by merges.

use std::collections::{BTreeMap, HashMap};

use storyline_common::ScoringConfig;
use storyline_store::{Article, EntityCounter, StoryAggregates};

/// Cosine similarity; 0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Arithmetic mean of the vectors sharing the first vector's dimension.
/// `None` when there is nothing to average.
pub fn mean_embedding<'a>(vectors: impl IntoIterator<Item = &'a [f32]>) -> Option<Vec<f32>> {
    let mut sum: Vec<f64> = Vec::new();
    let mut count = 0usize;
    for v in vectors {
        if v.is_empty() {
            continue;
        }
        if sum.is_empty() {
            sum = vec![0.0; v.len()];
        } else if v.len() != sum.len() {
            continue;
        }
        for (acc, x) in sum.iter_mut().zip(v) {
            *acc += *x as f64;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(sum.into_iter().map(|s| (s / count as f64) as f32).collect())
}

pub fn add_entities<'a>(counter: &mut EntityCounter, entity_ids: impl IntoIterator<Item = &'a str>) {
    for id in entity_ids {
        *counter.entry(id.to_string()).or_default() += 1;
    }
}

pub fn merge_counters(into: &mut EntityCounter, other: &EntityCounter) {
    for (id, count) in other {
        *into.entry(id.clone()).or_default() += count;
    }
}

/// Most frequent non-stopword entities, ties broken by id.
pub fn top_entities(counter: &EntityCounter, cfg: &ScoringConfig) -> Vec<String> {
    let mut ranked: Vec<(&String, &i64)> = counter.iter().filter(|(id, _)| !cfg.is_stopword(id)).collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().take(cfg.top_entities).map(|(id, _)| id.clone()).collect()
}

/// Existing keyphrases first, then new ones not yet present, capped.
pub fn union_keyphrases(existing: &[String], incoming: &[String], cap: usize) -> Vec<String> {
    let mut out: Vec<String> = existing.iter().take(cap).cloned().collect();
    for phrase in incoming {
        if out.len() >= cap {
            break;
        }
        if !out.contains(phrase) {
            out.push(phrase.clone());
        }
    }
    out
}

/// Keyphrases ranked by how many members carry them.
pub fn keyphrases_by_frequency(members: &[Article], cap: usize) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for article in members {
        for phrase in &article.keyphrases {
            *counts.entry(phrase.as_str()).or_default() += 1;
        }
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().take(cap).map(|(p, _)| p.to_string()).collect()
}

/// Most common member geography tag (case-insensitive), ties broken alphabetically.
pub fn dominant_geography(members: &[Article]) -> Option<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for geo in members.iter().filter_map(|a| a.geography.as_deref()) {
        *counts.entry(geo.to_lowercase()).or_default() += 1;
    }
    let best = counts.values().copied().max()?;
    counts.into_iter().find(|(_, c)| *c == best).map(|(g, _)| g)
}

/// Sum of the confidences of an article's discriminating entities.
pub fn headline_salience(article: &Article, cfg: &ScoringConfig) -> f64 {
    article
        .entities
        .iter()
        .flat_map(|m| m.iter())
        .filter(|(id, _)| !cfg.is_stopword(id))
        .map(|(_, confidence)| *confidence)
        .sum()
}

/// Rebuild every member-derived aggregate from scratch.
pub fn from_members(members: &[Article], cfg: &ScoringConfig, max_keyphrases: usize) -> StoryAggregates {
    let centroid = mean_embedding(members.iter().filter_map(|a| a.embedding.as_deref()));
    let mut entity_counter = EntityCounter::new();
    for article in members {
        add_entities(&mut entity_counter, article.entity_ids());
    }
    StoryAggregates {
        centroid,
        top_entities: top_entities(&entity_counter, cfg),
        entity_counter,
        keyphrases: keyphrases_by_frequency(members, max_keyphrases),
        geography: dominant_geography(members),
        member_count: members.len() as i32,
    }
}

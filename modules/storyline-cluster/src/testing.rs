//! Fixture builders shared by the unit tests.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use storyline_common::text::extract_keyphrases;
use storyline_common::{EntityMap, StoryStatus};
use storyline_store::{Article, EntityCounter, Story};

pub fn article(title: &str, embedding: Vec<f32>, entities: EntityMap, published_at: DateTime<Utc>) -> Article {
    Article {
        id: Uuid::new_v4(),
        url: format!("https://news.example.com/{}", Uuid::new_v4()),
        url_hash: String::new(),
        title: title.to_string(),
        excerpt: None,
        published_at,
        source_name: "Example Wire".into(),
        source_domain: Some("news.example.com".into()),
        entities: Some(entities),
        embedding: Some(embedding),
        keyphrases: extract_keyphrases(title, 10),
        geography: None,
        extracted_at: Some(published_at),
        created_at: published_at,
    }
}

pub fn story(headline: &str, centroid: Vec<f32>, top_entities: &[&str], last_updated_at: DateTime<Utc>) -> Story {
    let entity_counter: EntityCounter = top_entities.iter().map(|id| (id.to_string(), 1)).collect();
    Story {
        id: Uuid::new_v4(),
        headline: headline.to_string(),
        headline_salience: 0.0,
        primary_source_domain: None,
        status: StoryStatus::Active,
        centroid: Some(centroid),
        centroid_stale_since: None,
        centroid_computed_at: Some(last_updated_at),
        entity_counter,
        top_entities: top_entities.iter().map(|s| s.to_string()).collect(),
        keyphrases: extract_keyphrases(headline, 10),
        geography: None,
        first_seen_at: last_updated_at,
        last_updated_at,
        member_count: 1,
        merged_into_story_id: None,
        closed_at: None,
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{Result, StorylineError};

/// Entity id → extractor confidence in [0, 1].
pub type EntityMap = BTreeMap<String, f64>;

// --- Story status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryStatus {
    Active,
    Dormant,
    Closed,
    /// Tombstone: the story was merged into another and takes no new members.
    Merged,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Active => "active",
            StoryStatus::Dormant => "dormant",
            StoryStatus::Closed => "closed",
            StoryStatus::Merged => "merged",
        }
    }

    /// Active and dormant stories are clustering and merge candidates.
    pub fn is_open(&self) -> bool {
        matches!(self, StoryStatus::Active | StoryStatus::Dormant)
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoryStatus {
    type Err = StorylineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(StoryStatus::Active),
            "dormant" => Ok(StoryStatus::Dormant),
            "closed" => Ok(StoryStatus::Closed),
            "merged" => Ok(StoryStatus::Merged),
            other => Err(StorylineError::Validation(format!("unknown story status: {other}"))),
        }
    }
}

// --- Ingestion and extraction inputs ---

/// A normalized article as delivered by the feed layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct NewArticle {
    #[builder(setter(into))]
    pub url: String,
    #[builder(setter(into))]
    pub title: String,
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub excerpt: Option<String>,
    pub published_at: DateTime<Utc>,
    #[builder(setter(into))]
    pub source_name: String,
    /// Defaults to the host of the canonical URL.
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub source_domain: Option<String>,
}

impl NewArticle {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(StorylineError::Validation("article title is empty".into()));
        }
        if self.source_name.trim().is_empty() {
            return Err(StorylineError::Validation("article source name is empty".into()));
        }
        crate::canonical::canonicalize(&self.url)?;
        Ok(())
    }
}

/// Extractor output for one article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub entities: EntityMap,
    #[serde(default)]
    pub geography: Option<String>,
}

impl Extraction {
    pub fn validate(&self, expected_dim: Option<usize>) -> Result<()> {
        if self.embedding.is_empty() {
            return Err(StorylineError::Validation("embedding is empty".into()));
        }
        if let Some(dim) = expected_dim {
            if self.embedding.len() != dim {
                return Err(StorylineError::Validation(format!(
                    "embedding has {} dimensions, expected {dim}",
                    self.embedding.len()
                )));
            }
        }
        if self.embedding.iter().any(|v| !v.is_finite()) {
            return Err(StorylineError::Validation("embedding contains a non-finite value".into()));
        }
        for (id, confidence) in &self.entities {
            if id.trim().is_empty() {
                return Err(StorylineError::Validation("entity id is empty".into()));
            }
            if !(0.0..=1.0).contains(confidence) {
                return Err(StorylineError::Validation(format!(
                    "entity {id} confidence {confidence} is outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

// --- Job payloads ---

/// Job type tags. Each carries its own processing timeout and attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    IngestArticle,
    RecordExtraction,
    ClusterArticle,
    EnrichStory,
    RecomputeCentroids,
    MergeStories,
    LifecycleSweep,
}

impl JobKind {
    pub const ALL: [JobKind; 7] = [
        JobKind::IngestArticle,
        JobKind::RecordExtraction,
        JobKind::ClusterArticle,
        JobKind::EnrichStory,
        JobKind::RecomputeCentroids,
        JobKind::MergeStories,
        JobKind::LifecycleSweep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::IngestArticle => "ingest-article",
            JobKind::RecordExtraction => "record-extraction",
            JobKind::ClusterArticle => "cluster-article",
            JobKind::EnrichStory => "enrich-story",
            JobKind::RecomputeCentroids => "recompute-centroids",
            JobKind::MergeStories => "merge-stories",
            JobKind::LifecycleSweep => "lifecycle-sweep",
        }
    }

    /// Seconds a claim may run before another worker may reclaim it.
    pub fn timeout_secs(&self) -> i32 {
        match self {
            JobKind::IngestArticle | JobKind::RecordExtraction | JobKind::ClusterArticle => 5 * 60,
            JobKind::EnrichStory => 10 * 60,
            JobKind::RecomputeCentroids | JobKind::MergeStories | JobKind::LifecycleSweep => 30 * 60,
        }
    }

    pub fn max_attempts(&self) -> i32 {
        match self {
            JobKind::ClusterArticle => 5,
            _ => 3,
        }
    }
}

impl FromStr for JobKind {
    type Err = StorylineError;

    fn from_str(s: &str) -> Result<Self> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StorylineError::InvalidPayload(format!("unknown job type: {s}")))
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed job payloads. The queue stores the tag and the content separately;
/// `into_parts` and `from_parts` convert at the boundary and validate both ways.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", content = "payload", rename_all = "kebab-case")]
pub enum JobPayload {
    IngestArticle { article: NewArticle },
    RecordExtraction { article_id: Uuid, extraction: Extraction },
    ClusterArticle { article_id: Uuid },
    EnrichStory { story_id: Uuid },
    RecomputeCentroids {},
    MergeStories {},
    LifecycleSweep {},
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::IngestArticle { .. } => JobKind::IngestArticle,
            JobPayload::RecordExtraction { .. } => JobKind::RecordExtraction,
            JobPayload::ClusterArticle { .. } => JobKind::ClusterArticle,
            JobPayload::EnrichStory { .. } => JobKind::EnrichStory,
            JobPayload::RecomputeCentroids {} => JobKind::RecomputeCentroids,
            JobPayload::MergeStories {} => JobKind::MergeStories,
            JobPayload::LifecycleSweep {} => JobKind::LifecycleSweep,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            JobPayload::IngestArticle { article } => article.validate(),
            JobPayload::RecordExtraction { extraction, .. } => extraction.validate(None),
            _ => Ok(()),
        }
        .map_err(|e| StorylineError::InvalidPayload(format!("{}: {e}", self.kind())))
    }

    /// Split into `(job_type, payload)` for the queue, validating first.
    pub fn into_parts(self) -> Result<(JobKind, serde_json::Value)> {
        self.validate()?;
        let kind = self.kind();
        let mut tagged = serde_json::to_value(&self)
            .map_err(|e| StorylineError::InvalidPayload(format!("{kind}: {e}")))?;
        let payload = tagged
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or_else(|| serde_json::json!({}));
        Ok((kind, payload))
    }

    /// Rebuild from a claimed job's columns. Unknown tags and shapes that do
    /// not match the tag are rejected rather than passed to a handler.
    pub fn from_parts(job_type: &str, payload: &serde_json::Value) -> Result<Self> {
        let kind: JobKind = job_type.parse()?;
        let tagged = serde_json::json!({ "job_type": kind.as_str(), "payload": payload });
        let parsed: JobPayload = serde_json::from_value(tagged)
            .map_err(|e| StorylineError::InvalidPayload(format!("{kind}: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_payload_kinds_serialize_to_empty_object() {
        let (kind, payload) = JobPayload::MergeStories {}.into_parts().unwrap();
        assert_eq!(kind, JobKind::MergeStories);
        assert_eq!(payload, json!({}));
    }

    #[test]
    fn cluster_payload_carries_article_id() {
        let id = Uuid::new_v4();
        let (kind, payload) = JobPayload::ClusterArticle { article_id: id }.into_parts().unwrap();
        assert_eq!(kind.as_str(), "cluster-article");
        assert_eq!(payload, json!({ "article_id": id }));
        assert_eq!(
            JobPayload::from_parts("cluster-article", &payload).unwrap(),
            JobPayload::ClusterArticle { article_id: id }
        );
    }

    #[test]
    fn mismatched_shape_is_rejected_at_claim() {
        let err = JobPayload::from_parts("enrich-story", &json!({ "article_id": Uuid::new_v4() })).unwrap_err();
        assert!(matches!(err, StorylineError::InvalidPayload(_)));
    }

    #[test]
    fn unknown_job_type_is_rejected() {
        let err = JobPayload::from_parts("summarize", &json!({})).unwrap_err();
        assert!(matches!(err, StorylineError::InvalidPayload(_)));
    }

    #[test]
    fn invalid_extraction_is_rejected_at_enqueue() {
        let payload = JobPayload::RecordExtraction {
            article_id: Uuid::new_v4(),
            extraction: Extraction {
                embedding: vec![0.1, f32::NAN],
                entities: EntityMap::new(),
                geography: None,
            },
        };
        assert!(matches!(payload.into_parts(), Err(StorylineError::InvalidPayload(_))));
    }

    #[test]
    fn extraction_rejects_wrong_dimension_and_confidence() {
        let mut extraction = Extraction {
            embedding: vec![0.0, 1.0, 0.0],
            entities: EntityMap::from([("ORG-ACME".to_string(), 0.9)]),
            geography: None,
        };
        assert!(extraction.validate(Some(3)).is_ok());
        assert!(extraction.validate(Some(4)).is_err());

        extraction.entities.insert("PER-X".into(), 1.5);
        assert!(extraction.validate(None).is_err());
    }

    #[test]
    fn ingest_payload_requires_a_title() {
        let article = NewArticle::builder()
            .url("https://example.com/a")
            .title("  ")
            .published_at(Utc::now())
            .source_name("Example")
            .build();
        assert!(JobPayload::IngestArticle { article }.into_parts().is_err());
    }

    #[test]
    fn story_status_round_trips_through_text() {
        for status in [StoryStatus::Active, StoryStatus::Dormant, StoryStatus::Closed, StoryStatus::Merged] {
            assert_eq!(status.as_str().parse::<StoryStatus>().unwrap(), status);
        }
        assert!(!StoryStatus::Merged.is_open());
        assert!(StoryStatus::Dormant.is_open());
    }
}

use std::collections::HashSet;
use std::env;
use std::str::FromStr;

use crate::error::{Result, StorylineError};

/// Entities that appear across too many unrelated events to discriminate
/// between them.
pub const DEFAULT_ENTITY_STOPWORDS: &[&str] = &[
    "US-TRUMP",
    "US-BIDEN",
    "LOC-USA",
    "LOC-WASHINGTON",
    "ORG-WHITE-HOUSE",
    "ORG-DEM",
    "ORG-GOP",
    "ORG-CONGRESS",
    "ORG-SENATE",
    "ORG-HOUSE",
    "ORG-SUPREME-COURT",
    "ORG-DOJ",
    "ORG-FBI",
];

/// Wire services syndicate one report under many headlines, so their
/// articles attach at a lower threshold.
pub const DEFAULT_WIRE_DOMAINS: &[&str] = &[
    "ap.org",
    "apnews.com",
    "reuters.com",
    "afp.com",
    "bloomberg.com",
    "upi.com",
    "marketwatch.com",
];

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub cluster: ClusterConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
}

/// Everything the clustering engine and its maintenance passes read.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub scoring: ScoringConfig,
    pub candidates: CandidateConfig,
    pub lifecycle: LifecycleConfig,
    pub centroid: CentroidConfig,
    pub merge: MergeConfig,
}

impl ClusterConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            scoring: ScoringConfig::from_env()?,
            candidates: CandidateConfig::from_env()?,
            lifecycle: LifecycleConfig::from_env()?,
            centroid: CentroidConfig::from_env()?,
            merge: MergeConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.scoring.validate()?;
        self.candidates.validate()?;
        self.merge.validate()?;
        if self.lifecycle.close_after_hours <= self.lifecycle.dormant_after_hours {
            return Err(StorylineError::Config(
                "LIFECYCLE_CLOSE_AFTER_HOURS must exceed LIFECYCLE_DORMANT_AFTER_HOURS".into(),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from `.env` and the process environment.
    /// Unset values fall back to defaults. A value that is set but does not
    /// parse is a configuration error, and the result is validated.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| StorylineError::Config("DATABASE_URL environment variable is required".into()))?;

        let config = Self {
            database_url,
            cluster: ClusterConfig::from_env()?,
            queue: QueueConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        if self.worker.concurrency == 0 {
            return Err(StorylineError::Config("WORKER_CONCURRENCY must be at least 1".into()));
        }
        Ok(())
    }

    /// Log the effective configuration without the connection string.
    pub fn log_redacted(&self) {
        tracing::info!(
            threshold = self.cluster.scoring.threshold,
            wire_threshold = self.cluster.scoring.wire_threshold,
            wire_domains = self.cluster.scoring.wire_domains.len(),
            absent_policy = ?self.cluster.scoring.absent_policy,
            half_life_hours = self.cluster.scoring.half_life_hours,
            stopwords = self.cluster.scoring.entity_stopwords.len(),
            concurrency = self.worker.concurrency,
            poll_interval_ms = self.worker.poll_interval_ms,
            "Configuration loaded"
        );
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// How the scorer treats a signal that only one side of the pair carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbsentSignalPolicy {
    /// Drop the component's weight from the denominator.
    #[default]
    Neutral,
    /// Score the component as 0 and keep its weight.
    Penalize,
}

impl FromStr for AbsentSignalPolicy {
    type Err = StorylineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "neutral" => Ok(Self::Neutral),
            "penalize" => Ok(Self::Penalize),
            other => Err(StorylineError::Config(format!("unknown absent-signal policy: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub embedding: f64,
    pub entity: f64,
    pub title: f64,
    pub time: f64,
    pub geography: f64,
    pub keyphrase: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            embedding: 0.40,
            entity: 0.25,
            title: 0.15,
            time: 0.10,
            geography: 0.05,
            keyphrase: 0.05,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.embedding + self.entity + self.title + self.time + self.geography + self.keyphrase
    }

    fn all(&self) -> [f64; 6] {
        [self.embedding, self.entity, self.title, self.time, self.geography, self.keyphrase]
    }
}

#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    pub threshold: f64,
    /// Attach threshold for articles from `wire_domains`.
    pub wire_threshold: f64,
    /// Matched against an article's source domain and its parent domains.
    pub wire_domains: Vec<String>,
    pub half_life_hours: f64,
    /// Size of a story's top-entity list used for overlap scoring.
    pub top_entities: usize,
    pub entity_stopwords: HashSet<String>,
    pub absent_policy: AbsentSignalPolicy,
    pub dormant_reattach_threshold: f64,
    pub dormant_min_shared_entities: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            threshold: 0.70,
            wire_threshold: 0.68,
            wire_domains: DEFAULT_WIRE_DOMAINS.iter().map(|s| s.to_string()).collect(),
            half_life_hours: 72.0,
            top_entities: 8,
            entity_stopwords: DEFAULT_ENTITY_STOPWORDS.iter().map(|s| s.to_string()).collect(),
            absent_policy: AbsentSignalPolicy::Neutral,
            dormant_reattach_threshold: 0.80,
            dormant_min_shared_entities: 2,
        }
    }
}

impl ScoringConfig {
    fn from_env() -> Result<Self> {
        let d = Self::default();
        let dw = d.weights;
        Ok(Self {
            weights: ScoreWeights {
                embedding: env_or("SCORING_WEIGHT_EMBEDDING", dw.embedding)?,
                entity: env_or("SCORING_WEIGHT_ENTITY", dw.entity)?,
                title: env_or("SCORING_WEIGHT_TITLE", dw.title)?,
                time: env_or("SCORING_WEIGHT_TIME", dw.time)?,
                geography: env_or("SCORING_WEIGHT_GEOGRAPHY", dw.geography)?,
                keyphrase: env_or("SCORING_WEIGHT_KEYPHRASE", dw.keyphrase)?,
            },
            threshold: env_or("SCORING_THRESHOLD", d.threshold)?,
            wire_threshold: env_or("SCORING_WIRE_THRESHOLD", d.wire_threshold)?,
            wire_domains: env_list("SCORING_WIRE_DOMAINS")
                .map(|list| list.into_iter().map(|s| s.to_lowercase()).collect())
                .unwrap_or(d.wire_domains),
            half_life_hours: env_or("SCORING_HALF_LIFE_HOURS", d.half_life_hours)?,
            top_entities: env_or("SCORING_TOP_ENTITIES", d.top_entities)?,
            entity_stopwords: env_list("SCORING_ENTITY_STOPWORDS")
                .map(|list| list.into_iter().map(|s| s.to_uppercase()).collect())
                .unwrap_or(d.entity_stopwords),
            absent_policy: env_or("SCORING_ABSENT_POLICY", d.absent_policy)?,
            dormant_reattach_threshold: env_or("SCORING_DORMANT_REATTACH_THRESHOLD", d.dormant_reattach_threshold)?,
            dormant_min_shared_entities: env_or("SCORING_DORMANT_MIN_SHARED_ENTITIES", d.dormant_min_shared_entities)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.weights.all().iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(StorylineError::Config("scoring weights must each be within [0, 1]".into()));
        }
        let sum = self.weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(StorylineError::Config(format!("scoring weights must sum to 1.0, got {sum:.4}")));
        }
        for (name, value) in [
            ("SCORING_THRESHOLD", self.threshold),
            ("SCORING_WIRE_THRESHOLD", self.wire_threshold),
            ("SCORING_DORMANT_REATTACH_THRESHOLD", self.dormant_reattach_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(StorylineError::Config(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.half_life_hours <= 0.0 {
            return Err(StorylineError::Config("SCORING_HALF_LIFE_HOURS must be positive".into()));
        }
        if self.top_entities == 0 {
            return Err(StorylineError::Config("SCORING_TOP_ENTITIES must be at least 1".into()));
        }
        Ok(())
    }

    pub fn is_stopword(&self, entity: &str) -> bool {
        self.entity_stopwords.contains(entity)
    }

    /// Attach threshold for an article from `source_domain`. A wire domain
    /// matches itself and its subdomains (`apnews.com`, `www.apnews.com`).
    pub fn threshold_for(&self, source_domain: Option<&str>) -> f64 {
        let Some(domain) = source_domain else {
            return self.threshold;
        };
        let domain = domain.to_ascii_lowercase();
        let is_wire = self.wire_domains.iter().any(|wire| {
            domain == *wire || domain.strip_suffix(wire.as_str()).is_some_and(|rest| rest.ends_with('.'))
        });
        if is_wire {
            self.wire_threshold
        } else {
            self.threshold
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CandidateConfig {
    /// Nearest centroids fetched by vector distance.
    pub ann_limit: i64,
    /// Stories fetched by shared top entity.
    pub entity_limit: i64,
    /// Stories fetched by recency around the article's publish time.
    pub time_window_hours: i64,
    pub time_limit: i64,
    pub max_candidates: i64,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            ann_limit: 60,
            entity_limit: 60,
            time_window_hours: 72,
            time_limit: 80,
            max_candidates: 200,
        }
    }
}

impl CandidateConfig {
    fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            ann_limit: env_or("CANDIDATE_ANN_LIMIT", d.ann_limit)?,
            entity_limit: env_or("CANDIDATE_ENTITY_LIMIT", d.entity_limit)?,
            time_window_hours: env_or("CANDIDATE_TIME_WINDOW_HOURS", d.time_window_hours)?,
            time_limit: env_or("CANDIDATE_TIME_LIMIT", d.time_limit)?,
            max_candidates: env_or("CANDIDATE_MAX", d.max_candidates)?,
        })
    }

    /// The per-source limits must fit in `max_candidates`, otherwise the final
    /// cap would silently drop nearest-centroid rows.
    pub fn validate(&self) -> Result<()> {
        let limits = [self.ann_limit, self.entity_limit, self.time_limit, self.time_window_hours];
        if limits.iter().any(|l| *l < 0) || self.max_candidates < 1 {
            return Err(StorylineError::Config(
                "candidate limits must be non-negative and CANDIDATE_MAX at least 1".into(),
            ));
        }
        let per_source = self.ann_limit + self.entity_limit + self.time_limit;
        if per_source > self.max_candidates {
            return Err(StorylineError::Config(format!(
                "CANDIDATE_ANN_LIMIT + CANDIDATE_ENTITY_LIMIT + CANDIDATE_TIME_LIMIT ({per_source}) exceeds CANDIDATE_MAX ({})",
                self.max_candidates
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub dormant_after_hours: i64,
    pub close_after_hours: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            dormant_after_hours: 72,
            close_after_hours: 14 * 24,
        }
    }
}

impl LifecycleConfig {
    fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            dormant_after_hours: env_or("LIFECYCLE_DORMANT_AFTER_HOURS", d.dormant_after_hours)?,
            close_after_hours: env_or("LIFECYCLE_CLOSE_AFTER_HOURS", d.close_after_hours)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Centroid maintenance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CentroidConfig {
    pub time_budget_secs: u64,
    pub max_stories_per_run: usize,
    pub max_keyphrases: usize,
}

impl Default for CentroidConfig {
    fn default() -> Self {
        Self {
            time_budget_secs: 120,
            max_stories_per_run: 500,
            max_keyphrases: 12,
        }
    }
}

impl CentroidConfig {
    fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            time_budget_secs: env_or("CENTROID_TIME_BUDGET_SECS", d.time_budget_secs)?,
            max_stories_per_run: env_or("CENTROID_MAX_STORIES", d.max_stories_per_run)?,
            max_keyphrases: env_or("CENTROID_MAX_KEYPHRASES", d.max_keyphrases)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Merge pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub scan_limit: i64,
    pub centroid_threshold: f64,
    pub entity_threshold: f64,
    pub min_shared_entities: usize,
    pub max_gap_days: i64,
    pub max_merges: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            scan_limit: 100,
            centroid_threshold: 0.85,
            entity_threshold: 0.40,
            min_shared_entities: 2,
            max_gap_days: 7,
            max_merges: 10,
        }
    }
}

impl MergeConfig {
    fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            scan_limit: env_or("MERGE_SCAN_LIMIT", d.scan_limit)?,
            centroid_threshold: env_or("MERGE_CENTROID_THRESHOLD", d.centroid_threshold)?,
            entity_threshold: env_or("MERGE_ENTITY_THRESHOLD", d.entity_threshold)?,
            min_shared_entities: env_or("MERGE_MIN_SHARED_ENTITIES", d.min_shared_entities)?,
            max_gap_days: env_or("MERGE_MAX_GAP_DAYS", d.max_gap_days)?,
            max_merges: env_or("MERGE_MAX_PER_RUN", d.max_merges)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.centroid_threshold) || !(0.0..=1.0).contains(&self.entity_threshold) {
            return Err(StorylineError::Config("merge thresholds must be within [0, 1]".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue and worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub retry_base_delay_secs: i64,
    pub retry_max_delay_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_secs: 2,
            retry_max_delay_secs: 600,
        }
    }
}

impl QueueConfig {
    fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            retry_base_delay_secs: env_or("QUEUE_RETRY_BASE_DELAY_SECS", d.retry_base_delay_secs)?,
            retry_max_delay_secs: env_or("QUEUE_RETRY_MAX_DELAY_SECS", d.retry_max_delay_secs)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub centroid_interval_secs: u64,
    pub merge_interval_secs: u64,
    pub lifecycle_interval_secs: u64,
    /// Expected embedding length; extraction writes with another length are rejected.
    pub embedding_dim: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval_ms: 5000,
            centroid_interval_secs: 300,
            merge_interval_secs: 3600,
            lifecycle_interval_secs: 900,
            embedding_dim: None,
        }
    }
}

impl WorkerConfig {
    fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            concurrency: env_or("WORKER_CONCURRENCY", d.concurrency)?,
            poll_interval_ms: env_or("WORKER_POLL_INTERVAL_MS", d.poll_interval_ms)?,
            centroid_interval_secs: env_or("WORKER_CENTROID_INTERVAL_SECS", d.centroid_interval_secs)?,
            merge_interval_secs: env_or("WORKER_MERGE_INTERVAL_SECS", d.merge_interval_secs)?,
            lifecycle_interval_secs: env_or("WORKER_LIFECYCLE_INTERVAL_SECS", d.lifecycle_interval_secs)?,
            embedding_dim: env_opt("EMBEDDING_DIM")?,
        })
    }
}

/// Read and parse `key`. Unset or blank yields `None`; a value that does not
/// parse is an error naming the variable.
fn env_opt<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| StorylineError::Config(format!("{key} has an invalid value: {raw:?}"))),
        _ => Ok(None),
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    Ok(env_opt(key)?.unwrap_or(default))
}

/// Comma-separated list; `None` when unset.
fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        assert!(ScoringConfig::default().validate().is_ok());
    }

    #[test]
    fn unbalanced_weights_are_rejected() {
        let mut cfg = ScoringConfig::default();
        cfg.weights.embedding = 0.50;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, StorylineError::Config(_)));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let cfg = ScoringConfig {
            threshold: 1.2,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn absent_policy_parses_case_insensitively() {
        assert_eq!("Penalize".parse::<AbsentSignalPolicy>().unwrap(), AbsentSignalPolicy::Penalize);
        assert_eq!("neutral".parse::<AbsentSignalPolicy>().unwrap(), AbsentSignalPolicy::Neutral);
        assert!("ignore".parse::<AbsentSignalPolicy>().is_err());
    }

    #[test]
    fn lifecycle_windows_must_be_ordered() {
        let mut cfg = ClusterConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.lifecycle.close_after_hours = cfg.lifecycle.dormant_after_hours;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn wire_domains_and_subdomains_get_the_wire_threshold() {
        let cfg = ScoringConfig::default();
        assert_eq!(cfg.threshold_for(Some("reuters.com")), 0.68);
        assert_eq!(cfg.threshold_for(Some("uk.Reuters.com")), 0.68);
        assert_eq!(cfg.threshold_for(Some("notreuters.com")), 0.70);
        assert_eq!(cfg.threshold_for(Some("example.com")), 0.70);
        assert_eq!(cfg.threshold_for(None), 0.70);
    }

    #[test]
    fn candidate_limits_must_fit_the_cap() {
        assert!(CandidateConfig::default().validate().is_ok());
        let cfg = CandidateConfig {
            max_candidates: 100,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(StorylineError::Config(_))));
    }

    #[test]
    fn set_but_invalid_env_value_is_an_error() {
        // Variable names are unique to this test so parallel tests do not interfere
        env::set_var("STORYLINE_TEST_POLICY", "penalise");
        env::set_var("STORYLINE_TEST_COUNT", " 12 ");
        env::set_var("STORYLINE_TEST_BLANK", "");

        let err = env_or("STORYLINE_TEST_POLICY", AbsentSignalPolicy::Neutral).unwrap_err();
        assert!(err.to_string().contains("STORYLINE_TEST_POLICY"));
        assert_eq!(env_or("STORYLINE_TEST_COUNT", 3usize).unwrap(), 12);
        assert_eq!(env_or("STORYLINE_TEST_BLANK", 3usize).unwrap(), 3);
        assert_eq!(env_or("STORYLINE_TEST_UNSET", 3usize).unwrap(), 3);
        assert!(env_opt::<usize>("STORYLINE_TEST_POLICY").is_err());
    }

    #[test]
    fn default_stopwords_cover_generic_actors() {
        let cfg = ScoringConfig::default();
        assert!(cfg.is_stopword("ORG-CONGRESS"));
        assert!(!cfg.is_stopword("ORG-ACME"));
    }
}

pub mod canonical;
pub mod config;
pub mod error;
pub mod text;
pub mod types;

pub use config::{
    AbsentSignalPolicy, AppConfig, CandidateConfig, CentroidConfig, ClusterConfig, LifecycleConfig, MergeConfig, QueueConfig,
    ScoreWeights, ScoringConfig, WorkerConfig,
};
pub use error::{Result, StorylineError};
pub use types::*;

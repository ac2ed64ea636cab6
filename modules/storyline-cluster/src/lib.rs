//! Story clustering: scoring, attach-or-create, centroid maintenance, the
//! duplicate merge pass and the lifecycle sweep.

pub mod aggregate;
pub mod attach;
pub mod candidates;
pub mod centroid;
pub mod lifecycle;
pub mod merge;
pub mod scorer;

#[cfg(test)]
mod testing;

pub use attach::{attach_or_create, Attachment};
pub use centroid::{recompute_stale, CentroidStats};
pub use lifecycle::{close_story, reopen_story, sweep, LifecycleStats};
pub use merge::{merge_stories, run_merge_pass, MergeEvidence, MergeOutcome, MergeStats};
pub use scorer::{score, ScoreBreakdown};

//! Generic, domain-agnostic durable job queue.
//!
//! Stores opaque JSONB payloads keyed by a string job type. Zero knowledge of
//! articles, stories, or any domain concept. Consumers map their own typed
//! payloads to `(job_type, payload)` at the boundary.

pub mod error;
pub mod queue;
pub mod types;

pub use error::QueueError;
pub use queue::{enqueue_with, JobQueue};
pub use types::{payload_hash, Job, JobOutcome, JobStatus, NewJob, QueueDepth, RetryPolicy};

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorylineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Article {0} has no extraction output yet")]
    MissingExtraction(Uuid),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Policy violation: {0}")]
    Policy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl StorylineError {
    /// Whether a job that failed with this error should go back to the queue.
    ///
    /// Infrastructure failures are transient. A missing extraction may still
    /// arrive, so it is retried until the job's attempts run out. Everything
    /// else is deterministic and retrying would fail the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorylineError::Database(_) | StorylineError::MissingExtraction(_) | StorylineError::Anyhow(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StorylineError>;

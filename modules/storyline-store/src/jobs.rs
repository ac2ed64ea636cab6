//! Typed enqueue on top of the generic queue.

use sqlx::{Executor, Postgres};

use storyline_common::{JobPayload, Result, StorylineError};
use storyline_queue::{enqueue_with, NewJob, QueueError};

/// Validate and convert a payload into a queue row with its kind's limits.
pub fn new_job(payload: JobPayload) -> Result<NewJob> {
    let (kind, value) = payload.into_parts()?;
    Ok(NewJob::new(kind.as_str(), value)
        .with_max_attempts(kind.max_attempts())
        .with_timeout_secs(kind.timeout_secs()))
}

/// Enqueue through any executor. Pass a transaction to make the job commit
/// together with the writes that produced it.
pub async fn enqueue<'e, E>(executor: E, payload: JobPayload) -> Result<Option<i64>>
where
    E: Executor<'e, Database = Postgres>,
{
    let job = new_job(payload)?;
    enqueue_with(executor, &job).await.map_err(queue_error)
}

pub fn queue_error(e: QueueError) -> StorylineError {
    match e {
        QueueError::Database(e) => StorylineError::Database(e),
        QueueError::Corrupt(msg) => StorylineError::Validation(msg),
    }
}

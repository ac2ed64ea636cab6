use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

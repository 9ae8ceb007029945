use thiserror::Error;

#[derive(Error, Debug)]
pub enum GrantcastError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Database error: {0}")]
    Database(String),

    /// A model or collaborator returned data that would corrupt state if
    /// persisted (hallucinated grant id, malformed hash, bad timestamp).
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Queue full: {0}")]
    QueueFull(String),
    #[error("Transient store error: {0}")]
    TransientStore(String),
    #[error("Permanent store error: {0}")]
    PermanentStore(String),
    #[error("Extraction error: {0}")]
    Extraction(String),
    #[error("Adjudication error: {0}")]
    Adjudication(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether the queue substrate should retry a job that failed with this error.
    /// Logic errors (validation, schema, permanent store constraints) are final;
    /// infrastructure errors are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::PermanentStore(_)
            | Self::Extraction(_)
            | Self::NotFound(_)
            | Self::QueueFull(_)
            | Self::Cancelled(_) => false,
            Self::Database(err) => is_retryable_db_error(err),
            Self::OpenAI(_)
            | Self::TransientStore(_)
            | Self::Adjudication(_)
            | Self::LLMParsing(_)
            | Self::Join(_)
            | Self::Io(_)
            | Self::Anyhow(_)
            | Self::InternalError(_) => true,
        }
    }
}

/// Commit conflicts and connection-level failures are transient; schema and
/// constraint violations are not.
pub fn is_retryable_db_error(error: &surrealdb::Error) -> bool {
    let message = error.to_string();
    message.contains("read or write conflict")
        || message.contains("connection")
        || message.contains("timed out")
}

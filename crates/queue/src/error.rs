use thiserror::Error;

/// Queue-boundary error kinds. The transport layer maps these onto HTTP
/// statuses (400 / 403 / 404); internally they are just values.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

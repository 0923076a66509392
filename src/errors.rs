use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("AUTHENTICATION: {0}")]
    Authentication(String),
    #[error("AUTHORIZATION: {0}")]
    Authorization(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("RATE_LIMITED: {0}")]
    RateLimited(String),
    #[error("UNAVAILABLE: {0}")]
    Unavailable(String),
    #[error("MODEL_OUTPUT: {0}")]
    ModelOutput(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Transient dependency failures a caller may retry; everything else is
    /// definitive and must not be retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

//! Error types for the knowledge graph engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    pub fn entity_not_found(id: i64) -> Self {
        Self::NotFound {
            kind: "Entity",
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    /// True for errors caused by the caller's input rather than the store.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ValidationFailed(_))
    }
}

impl From<rusqlite::Error> for GraphError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::ValidationFailed(format!("constraint violated: {}", err))
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Lock timeout: no transaction lock acquired within {waited:?}")]
    LockTimeout { waited: Duration },

    #[error("Invalid owner: the current owner is {current} but the owner requested to release is {requested}")]
    InvalidOwner { current: String, requested: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Entity '{collection}' was not found while trying to find it with '{id}'")]
    NotFound { collection: String, id: String },

    #[error("Entity '{0}' is already tracked by the session")]
    AlreadyTracked(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Errors raised by the store while flushing or committing.
    pub fn is_persistence(&self) -> bool {
        matches!(self, DbError::Persistence(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::sync::AcquireError> for DbError {
    fn from(err: tokio::sync::AcquireError) -> Self {
        Self::LockError(err.to_string())
    }
}

use crate::models::Object;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RebacError {
    /// Self-loops, malformed identifiers, undefined relations or types.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Relation {from} -> {to} would close a cycle")]
    Cycle { from: Object, to: Object },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Raised by the intersection cache and consumed by the check resolver.
    #[error("Intersection cache cannot decide {0}")]
    StaleCache(String),

    #[error("Schema evaluation exceeded maximum depth {0}")]
    SchemaDepthExceeded(u32),

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RebacError {
    /// Only storage and deadline failures are worth retrying; everything else
    /// is deterministic given the same graph and schema.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::DeadlineExceeded(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::SchemaDepthExceeded(_))
    }
}

impl From<sqlx::Error> for RebacError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            if db.code().as_deref() == Some("23505") {
                return Self::AlreadyExists(db.message().to_string());
            }
        }
        Self::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;

//! Error types for persevere.

use thiserror::Error;

use crate::model::{JobId, Status};

#[derive(Debug, Error)]
pub enum Error {
    /// A `defer` collided with a live job holding the same queueing lock.
    #[error("duplicate job: queueing lock {0:?} is held by a live job")]
    DuplicateJob(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A conditional state update found the row in a different state.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("unknown job status: {0:?}")]
    UnknownStatus(String),

    /// The persistent store cannot be reached. Polling loops back off and
    /// retry instead of failing jobs.
    #[error("store unavailable: {0}")]
    Store(#[from] sqlx::Error),

    #[error("task already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid cron expression {expr:?}: {message}")]
    InvalidCron { expr: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error should pause a polling loop rather than fail it.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

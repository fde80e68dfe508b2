// src/engine/error.rs

use std::fmt;

use crate::store::StoreError;

/// Failures surfaced by a running exam session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The durable store could not be reached. The operation was rolled back
    /// (answer writes) or is being retried (finalization).
    TransientStore(String),

    /// The session is not in a state that accepts this operation,
    /// e.g. a mutation after submission started.
    InvalidState(String),

    NotFound(String),

    /// The attempt belongs to another learner.
    Forbidden(String),

    /// The request is malformed for the target question.
    BadRequest(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::TransientStore(msg) => write!(f, "store unavailable: {}", msg),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            EngineError::NotFound(msg) => write!(f, "not found: {}", msg),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            EngineError::BadRequest(msg) => write!(f, "bad request: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => EngineError::TransientStore(msg),
            StoreError::NotFound(msg) => EngineError::NotFound(msg),
            StoreError::Conflict(msg) => EngineError::InvalidState(msg),
        }
    }
}

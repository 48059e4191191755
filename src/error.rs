//! Construction-time and API-misuse errors.
//!
//! These are distinct from [`crate::flow::FlowStatus`], which models
//! per-stream scheduling state and is never an `Err`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MultiQueueError {
    #[error("queue id {0} is already in use")]
    DuplicateId(u32),

    #[error("no queue registered for handle {0}")]
    UnknownHandle(u32),

    #[error("unrecognized property key: {0}")]
    UnknownProperty(String),

    #[error("invalid value for property {key}: {reason}")]
    InvalidPropertyValue { key: String, reason: String },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

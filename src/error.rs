//! Errors the engine reports to its caller.
//!
//! Only conditions the caller must react to are errors. A turn that found
//! no context or whose generation failed still produces a reply, with its
//! [`TurnStatus`](crate::models::TurnStatus) set accordingly.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("query must not be empty")]
    EmptyQuery,

    #[error("session {0} already has a turn in flight")]
    SessionBusy(String),

    #[error("session not found: {0}")]
    UnknownSession(String),
}

use crate::core::Target;
use crate::state::ActionState;
use thiserror::Error;

/// Errors raised by the synchronization engine.
///
/// The type is `Clone` because a single record failure is delivered to every
/// caller waiting on that record's ready/sync futures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Backend error on {target}: {message}")]
    Backend { target: Target, message: String },

    #[error("Invalid transition: {incoming} cannot be merged into queued {queued}")]
    InvalidTransition {
        queued: ActionState,
        incoming: ActionState,
    },

    #[error("Record {0} is locked after an unrecoverable error")]
    Locked(u64),

    #[error("Key field '{0}' is missing")]
    MissingKey(String),

    #[error("Local cache unavailable: {0}")]
    LocalCacheUnavailable(String),

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("Record {0} was discarded before it became ready")]
    Discarded(u64),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl SyncError {
    pub fn backend(target: Target, message: impl Into<String>) -> Self {
        Self::Backend {
            target,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

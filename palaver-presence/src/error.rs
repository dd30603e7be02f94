use crate::path::{PathError, StorePath};

/// Broad classification used for notices and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Store unreachable; recovered by the reconnection flow.
    Transport,
    /// Payload rejected by the store; logged and surfaced, never retried.
    WriteAcknowledgment,
}

/// Errors returned by a [`SessionStore`](crate::store::SessionStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Transport unavailable: {0}")]
    Transport(String),

    #[error("Permission denied at {0}")]
    PermissionDenied(StorePath),

    #[error("Malformed payload for {path}: {reason}")]
    Malformed { path: StorePath, reason: String },

    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Transport(_) => ErrorClass::Transport,
            StoreError::PermissionDenied(_)
            | StoreError::Malformed { .. }
            | StoreError::InvalidPath(_) => ErrorClass::WriteAcknowledgment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("No identity is signed in")]
    NotSignedIn,
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Invalid identity id: {0}")]
    InvalidIdentity(#[from] PathError),

    #[error("{count} subscription(s) still registered for '{identity}' before switching identity")]
    SubscriptionLeak { identity: String, count: usize },

    #[error("Presence engine has stopped")]
    EngineStopped,

    #[error("Config error: {0}")]
    Config(String),
}

//! Error types for the matchmaking service
//!
//! Service-level failures use `MatchmakingError` wrapped in `anyhow`, the same
//! as the rest of the crate. The store layer returns its own typed
//! `StoreError` so the matcher can branch on the kind of failure.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Result type returned by every store operation
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("Invalid user: {reason}")]
    InvalidUser { reason: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("User {user_id} is not a participant of session {session_id}")]
    NotAParticipant { user_id: String, session_id: String },

    #[error("Match request not found: {request_id}")]
    RequestNotFound { request_id: String },

    #[error("Match request {request_id} belongs to the caller")]
    OwnRequest { request_id: String },

    #[error("Match request {request_id} is no longer available")]
    RequestUnavailable { request_id: String },

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

/// Failure kinds reported by `RequestStore` / `SessionStore` implementations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A conditional write found the row in an unexpected state
    #[error("Lost race on a conditional update")]
    RaceLost,

    /// Contention in the backend; the same operation may succeed when retried
    #[error("Transient store error: {message}")]
    Transient { message: String },

    /// The caller's own request was claimed by an unrelated attempt
    #[error("Terminal conflict: {message}")]
    TerminalConflict { message: String },

    /// The user already has an open request or session
    #[error("User {user_id} already has an open match request")]
    Duplicate { user_id: String },

    /// Anything else the backend reports (I/O, corrupt rows, poisoned locks)
    #[error("Store backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    /// Whether retrying the same unit of work may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }

    pub(crate) fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
        }
    }
}

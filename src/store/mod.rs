//! Storage interfaces for match requests and sessions
//!
//! Every mutual-exclusion guarantee of the matchmaking protocol lives here:
//! status changes are conditional ("only if still in state X") and the
//! multi-row units of work run atomically inside the backend. Nothing above
//! this layer holds a lock across workers.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryMatchStore;
pub use sqlite::SqliteMatchStore;

use crate::error::{StoreError, StoreResult};
use crate::types::{
    MatchRequest, RequestCounts, RequestId, RequestStatus, Session, SessionId, SessionStatus,
    UserId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Durable storage of match requests
pub trait RequestStore: Send + Sync {
    /// Insert a request as-is (no uniqueness checks)
    fn insert_request(&self, request: MatchRequest) -> StoreResult<()>;

    fn get_request(&self, id: RequestId) -> StoreResult<Option<MatchRequest>>;

    /// The user's most recently created request
    fn latest_request_for(&self, user_id: &str) -> StoreResult<Option<MatchRequest>>;

    /// Pending requests of other users, oldest first
    fn pending_candidates(&self, exclude_user: &str, limit: usize)
        -> StoreResult<Vec<MatchRequest>>;

    /// Conditional status update; `Ok(false)` when the row was not in `from`
    fn transition_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    ) -> StoreResult<bool>;

    /// Move `candidate` pending -> matching, only while `caller` is still pending.
    ///
    /// Both conditions are checked in one atomic statement.
    fn claim_candidate(&self, candidate: RequestId, caller: RequestId) -> StoreResult<bool>;

    /// Pending or matching requests created before `cutoff`
    fn open_requests_created_before(&self, cutoff: DateTime<Utc>)
        -> StoreResult<Vec<MatchRequest>>;

    /// Matched requests whose `matched_at` is before `cutoff`
    fn matched_requests_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<MatchRequest>>;

    /// Number of requests by this user that ended up matched
    fn successful_matches(&self, user_id: &str) -> StoreResult<u32>;

    fn request_counts(&self) -> StoreResult<RequestCounts>;
}

/// Durable storage of sessions
pub trait SessionStore: Send + Sync {
    /// Insert a session as-is (no uniqueness checks)
    fn insert_session(&self, session: Session) -> StoreResult<()>;

    fn get_session(&self, id: SessionId) -> StoreResult<Option<Session>>;

    /// The user's non-ended session; active is preferred over waiting
    fn open_session_for(&self, user_id: &str) -> StoreResult<Option<Session>>;

    /// Active sessions created before `cutoff`
    fn active_sessions_created_before(&self, cutoff: DateTime<Utc>)
        -> StoreResult<Vec<Session>>;

    fn count_sessions(&self, status: SessionStatus) -> StoreResult<u64>;
}

/// How a pairing obtains its active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResolution {
    /// Activate the candidate's waiting session with the caller as second participant
    AttachToCandidate(SessionId),
    /// Activate the caller's waiting session with the candidate as second participant
    AttachToCaller(SessionId),
    /// Create a fresh active session for both
    CreateNew,
}

/// Everything needed to commit one pairing
#[derive(Debug, Clone)]
pub struct PairingCommit {
    pub caller_request: RequestId,
    pub caller_id: UserId,
    pub candidate_request: RequestId,
    pub candidate_id: UserId,
    pub resolution: SessionResolution,
    /// Waiting sessions made redundant by this pairing; ended if still waiting
    pub superseded: Vec<SessionId>,
    pub now: DateTime<Utc>,
}

/// Units of work spanning both requests and sessions
pub trait MatchStore: RequestStore + SessionStore {
    /// Insert a waiting session and its pending request together.
    ///
    /// Fails with `Duplicate` if the user already has an open request or a
    /// non-ended session.
    fn open_request(&self, session: Session, request: MatchRequest) -> StoreResult<()>;

    /// Commit a claimed pairing.
    ///
    /// - caller request no longer pending: `TerminalConflict`
    /// - candidate request no longer matching: `RaceLost`
    /// - resolved session no longer waiting for its owner: `Transient`
    ///
    /// On success both requests are matched to the returned active session.
    fn commit_pairing(&self, commit: &PairingCommit) -> StoreResult<Session>;

    /// Conditionally expire a request; a linked session still waiting is ended
    fn expire_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Cancel every pending request of the user and end their waiting sessions.
    ///
    /// Returns the number of requests cancelled.
    fn cancel_pending(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<usize>;

    /// End a non-ended session and expire the requests linked to it.
    ///
    /// Returns `None` when the session was already ended (or missing),
    /// otherwise the number of requests expired.
    fn end_session(&self, id: SessionId, now: DateTime<Utc>) -> StoreResult<Option<usize>>;
}

/// Run a store operation on the blocking thread pool.
///
/// Backends may wait on file locks (sqlite `busy_timeout`), so store calls
/// never run directly on an async worker thread.
pub async fn blocking<T, F>(store: &Arc<dyn MatchStore>, op: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn MatchStore) -> StoreResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| StoreError::backend(format!("store task failed: {}", e)))?
}

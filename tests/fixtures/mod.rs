//! Test fixtures and fault-injecting implementations for integration testing

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heart_link::activity::{ActivityFeed, InMemoryActivityFeed};
use heart_link::config::AppConfig;
use heart_link::error::{MatchmakingError, Result, StoreError, StoreResult};
use heart_link::lifecycle::RequestLifecycleManager;
use heart_link::store::{
    InMemoryMatchStore, MatchStore, PairingCommit, RequestStore, SessionStore, SqliteMatchStore,
};
use heart_link::types::{
    Activity, MatchRequest, RequestCounts, RequestId, RequestStatus, Session, SessionId,
    SessionStatus,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic config: no score jitter and near-zero retry backoff
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.matching.score_jitter = 0;
    config.matching.commit_retry_backoff_ms = 1;
    config
}

/// Manager over a fresh in-memory store
pub fn memory_system() -> (
    RequestLifecycleManager,
    Arc<InMemoryMatchStore>,
    Arc<InMemoryActivityFeed>,
) {
    let store = Arc::new(InMemoryMatchStore::new());
    let feed = Arc::new(InMemoryActivityFeed::new());
    let manager = RequestLifecycleManager::new(store.clone(), feed.clone(), &test_config());
    (manager, store, feed)
}

/// Manager over its own connection to the database at `path`
pub fn sqlite_manager(path: &Path) -> (RequestLifecycleManager, Arc<SqliteMatchStore>) {
    let store = Arc::new(
        SqliteMatchStore::open(path, Duration::from_secs(5)).expect("Failed to open sqlite store"),
    );
    let manager = RequestLifecycleManager::new(
        store.clone(),
        Arc::new(InMemoryActivityFeed::new()),
        &test_config(),
    );
    (manager, store)
}

/// Open a waiting session and pending request for `user` created at `at`
pub fn open_request_at(store: &dyn MatchStore, user: &str, at: DateTime<Utc>) -> MatchRequest {
    let session = Session::waiting(user, at);
    let request = MatchRequest::pending(user, Some(session.id), at);
    store
        .open_request(session, request.clone())
        .expect("Failed to open request");
    request
}

/// Store wrapper that fails the first `failures` pairing commits with a
/// transient error
pub struct FlakyStore {
    inner: Arc<dyn MatchStore>,
    failures: AtomicUsize,
    commit_calls: AtomicUsize,
    /// Claim the caller's request right before each commit
    steal_caller: AtomicBool,
    /// Blocks every `latest_request_for` call this long
    read_delay: Option<Duration>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn MatchStore>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            commit_calls: AtomicUsize::new(0),
            steal_caller: AtomicBool::new(false),
            read_delay: None,
        }
    }

    /// Before delegating a commit, move the caller pending -> matching as a
    /// concurrent attempt claiming them would
    pub fn stealing_caller(inner: Arc<dyn MatchStore>) -> Self {
        let store = Self::new(inner, 0);
        store.steal_caller.store(true, Ordering::SeqCst);
        store
    }

    /// Every `latest_request_for` sleeps the calling thread for `delay`
    pub fn with_read_delay(inner: Arc<dyn MatchStore>, delay: Duration) -> Self {
        Self {
            read_delay: Some(delay),
            ..Self::new(inner, 0)
        }
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }
}

impl RequestStore for FlakyStore {
    fn insert_request(&self, request: MatchRequest) -> StoreResult<()> {
        self.inner.insert_request(request)
    }

    fn get_request(&self, id: RequestId) -> StoreResult<Option<MatchRequest>> {
        self.inner.get_request(id)
    }

    fn latest_request_for(&self, user_id: &str) -> StoreResult<Option<MatchRequest>> {
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }
        self.inner.latest_request_for(user_id)
    }

    fn pending_candidates(
        &self,
        exclude_user: &str,
        limit: usize,
    ) -> StoreResult<Vec<MatchRequest>> {
        self.inner.pending_candidates(exclude_user, limit)
    }

    fn transition_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    ) -> StoreResult<bool> {
        self.inner.transition_request(id, from, to)
    }

    fn claim_candidate(&self, candidate: RequestId, caller: RequestId) -> StoreResult<bool> {
        self.inner.claim_candidate(candidate, caller)
    }

    fn open_requests_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<MatchRequest>> {
        self.inner.open_requests_created_before(cutoff)
    }

    fn matched_requests_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<MatchRequest>> {
        self.inner.matched_requests_before(cutoff)
    }

    fn successful_matches(&self, user_id: &str) -> StoreResult<u32> {
        self.inner.successful_matches(user_id)
    }

    fn request_counts(&self) -> StoreResult<RequestCounts> {
        self.inner.request_counts()
    }
}

impl SessionStore for FlakyStore {
    fn insert_session(&self, session: Session) -> StoreResult<()> {
        self.inner.insert_session(session)
    }

    fn get_session(&self, id: SessionId) -> StoreResult<Option<Session>> {
        self.inner.get_session(id)
    }

    fn open_session_for(&self, user_id: &str) -> StoreResult<Option<Session>> {
        self.inner.open_session_for(user_id)
    }

    fn active_sessions_created_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Session>> {
        self.inner.active_sessions_created_before(cutoff)
    }

    fn count_sessions(&self, status: SessionStatus) -> StoreResult<u64> {
        self.inner.count_sessions(status)
    }
}

impl MatchStore for FlakyStore {
    fn open_request(&self, session: Session, request: MatchRequest) -> StoreResult<()> {
        self.inner.open_request(session, request)
    }

    fn commit_pairing(&self, commit: &PairingCommit) -> StoreResult<Session> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            return Err(StoreError::Transient {
                message: "injected lock contention".to_string(),
            });
        }
        if self.steal_caller.load(Ordering::SeqCst) {
            self.inner.transition_request(
                commit.caller_request,
                RequestStatus::Pending,
                RequestStatus::Matching,
            )?;
        }
        self.inner.commit_pairing(commit)
    }

    fn expire_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.expire_request(id, from, now)
    }

    fn cancel_pending(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        self.inner.cancel_pending(user_id, now)
    }

    fn end_session(&self, id: SessionId, now: DateTime<Utc>) -> StoreResult<Option<usize>> {
        self.inner.end_session(id, now)
    }
}

/// Activity feed whose backend is always down
#[derive(Debug, Default)]
pub struct FailingActivityFeed;

#[async_trait]
impl ActivityFeed for FailingActivityFeed {
    async fn get_activity(&self, _user_id: &str) -> Result<Activity> {
        Err(MatchmakingError::InternalError {
            message: "activity feed unavailable".to_string(),
        }
        .into())
    }
}

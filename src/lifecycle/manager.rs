//! Request lifecycle manager
//!
//! This module provides the public entry points of the matchmaking engine:
//! creating, cancelling, accepting and inspecting match requests, ending
//! sessions, and forcing a cleanup pass. Every entry point taken on behalf of
//! a user also reports that user's presence to the activity feed.

use crate::activity::ActivityFeed;
use crate::config::AppConfig;
use crate::error::{MatchmakingError, Result, StoreError};
use crate::matching::{AttemptOutcome, Matcher, MatcherConfig};
use crate::metrics::MetricsCollector;
use crate::reaper::{ExpiryReaper, ReaperConfig};
use crate::store::{blocking, MatchStore};
use crate::types::{
    AvailableRequest, CancelOutcome, CleanupReport, CreateOutcome, MatchRequest, MatchStatus,
    MatchingStats, RequestId, RequestStatus, Session, SessionId, SessionStatus, StatusReport,
};
use crate::utils::{current_timestamp, is_valid_user_id, to_chrono};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many times create_request re-checks after losing an open race
const MAX_OPEN_ATTEMPTS: usize = 3;

/// Where an accepting user's own request comes from
enum AcceptingRequest {
    /// The user was already waiting with this request
    Existing(MatchRequest),
    /// Opened for this accept; withdrawn again if the accept fails
    Opened(MatchRequest),
    /// The user is already engaged; nothing to accept
    Engaged(CreateOutcome),
}

/// Public façade over the store, matcher and reaper
#[derive(Clone)]
pub struct RequestLifecycleManager {
    /// Request and session storage
    store: Arc<dyn MatchStore>,
    /// Presence and activity of users
    activity: Arc<dyn ActivityFeed>,
    /// Pairing protocol
    matcher: Arc<Matcher>,
    /// Expiry sweeps, shared with the periodic task
    reaper: Arc<ExpiryReaper>,
    /// Pending requests older than this are expired on read
    pending_ttl: Duration,
    /// Matched requests older than this are expired on read
    matched_ttl: Duration,
    /// Requesters seen within this window are listed as available
    online_window: Duration,
    /// Pending rows scanned when listing available requests
    scan_limit: usize,
    /// Metrics collector for recording performance data
    metrics: Arc<MetricsCollector>,
}

impl RequestLifecycleManager {
    /// Create a new manager
    pub fn new(
        store: Arc<dyn MatchStore>,
        activity: Arc<dyn ActivityFeed>,
        config: &AppConfig,
    ) -> Self {
        // Create a default metrics collector if none provided
        let metrics = Arc::new(MetricsCollector::new().unwrap_or_else(|_| {
            warn!("Failed to create metrics collector, using default");
            MetricsCollector::default()
        }));

        Self::with_metrics(store, activity, config, metrics)
    }

    /// Create a new manager with metrics collector
    pub fn with_metrics(
        store: Arc<dyn MatchStore>,
        activity: Arc<dyn ActivityFeed>,
        config: &AppConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let matcher = Arc::new(Matcher::with_metrics(
            store.clone(),
            activity.clone(),
            MatcherConfig::from(&config.matching),
            metrics.clone(),
        ));
        let reaper = Arc::new(ExpiryReaper::new(
            store.clone(),
            activity.clone(),
            ReaperConfig::from(config),
            metrics.clone(),
        ));

        Self {
            store,
            activity,
            matcher,
            reaper,
            pending_ttl: to_chrono(config.pending_ttl()),
            matched_ttl: to_chrono(config.matched_ttl()),
            online_window: to_chrono(config.online_window()),
            scan_limit: config.matching.max_candidates,
            metrics,
        }
    }

    /// Get the reaper (for scheduling periodic sweeps)
    pub fn reaper(&self) -> Arc<ExpiryReaper> {
        self.reaper.clone()
    }

    /// Get the metrics collector
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Ask to be paired with another waiting user.
    ///
    /// A user already in a session gets that session back; a user already
    /// waiting gets their existing request back. Otherwise a new request is
    /// opened and one matcher attempt runs immediately.
    pub async fn create_request(&self, user_id: &str) -> Result<CreateOutcome> {
        validate_user(user_id)?;
        let timer = self.metrics.start_timer();
        self.touch(user_id).await;

        info!("Processing match request for user '{}'", user_id);

        for _ in 0..MAX_OPEN_ATTEMPTS {
            let now = current_timestamp();
            self.expire_latest_if_stale(user_id, now).await?;

            if let Some(outcome) = self.existing_outcome(user_id).await? {
                debug!("User '{}' already engaged: {}", user_id, outcome.label());
                self.metrics
                    .record_request_created(outcome.label(), timer.elapsed());
                return Ok(outcome);
            }

            let Some(request) = self.open_request(user_id, now).await? else {
                debug!("Concurrent request for '{}' won the open race", user_id);
                continue;
            };

            let outcome = match self.matcher.attempt(&request).await {
                AttemptOutcome::Matched { session, peer_id } => CreateOutcome::Matched {
                    request_id: request.id,
                    session_id: session.id,
                    peer_id,
                },
                AttemptOutcome::Pending => CreateOutcome::Pending {
                    request_id: request.id,
                    already_waiting: false,
                },
            };

            info!(
                "Match request for '{}' finished as {} ({:.2}ms)",
                user_id,
                outcome.label(),
                timer.elapsed().as_secs_f64() * 1000.0
            );
            self.metrics
                .record_request_created(outcome.label(), timer.stop());
            return Ok(outcome);
        }

        Err(MatchmakingError::InternalError {
            message: format!("could not open a match request for '{}'", user_id),
        }
        .into())
    }

    /// Pending requests of other users who are online, oldest first
    pub async fn available_requests(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<AvailableRequest>> {
        validate_user(user_id)?;
        self.touch(user_id).await;

        let now = current_timestamp();
        let exclude = user_id.to_string();
        let scan = self.scan_limit.max(limit);
        let candidates = self
            .run(move |store| store.pending_candidates(&exclude, scan))
            .await?;

        let mut available = Vec::new();
        for candidate in candidates {
            if available.len() >= limit {
                break;
            }
            if candidate.is_stale_open(now, self.pending_ttl) {
                continue;
            }
            if self.is_online(&candidate.requester_id, now).await {
                available.push(AvailableRequest::from(&candidate));
            }
        }

        debug!(
            "Listed {} available request(s) for '{}'",
            available.len(),
            user_id
        );
        Ok(available)
    }

    /// Pair with one specific pending request picked from `available_requests`.
    ///
    /// A user already in an active session gets it back as `Reconnect`. If
    /// the target was taken first the call fails with `RequestUnavailable`
    /// and the caller is left as they were.
    pub async fn accept_request(
        &self,
        user_id: &str,
        request_id: RequestId,
    ) -> Result<CreateOutcome> {
        validate_user(user_id)?;
        let timer = self.metrics.start_timer();
        self.touch(user_id).await;

        let now = current_timestamp();
        let target = self
            .run(move |store| store.get_request(request_id))
            .await?
            .ok_or_else(|| MatchmakingError::RequestNotFound {
                request_id: request_id.to_string(),
            })?;
        if target.requester_id == user_id {
            return Err(MatchmakingError::OwnRequest {
                request_id: request_id.to_string(),
            }
            .into());
        }
        let target = self.apply_lazy_expiry(target, now).await?;
        if target.status != RequestStatus::Pending {
            return Err(unavailable(request_id));
        }

        let (request, opened) = match self.accepting_request(user_id).await? {
            AcceptingRequest::Existing(request) => (request, false),
            AcceptingRequest::Opened(request) => (request, true),
            AcceptingRequest::Engaged(outcome) => {
                debug!("User '{}' already engaged: {}", user_id, outcome.label());
                self.metrics
                    .record_request_created(outcome.label(), timer.stop());
                return Ok(outcome);
            }
        };

        match self.matcher.accept(&request, &target).await {
            AttemptOutcome::Matched { session, peer_id } => {
                info!(
                    "User '{}' accepted request {} of '{}'",
                    user_id, request_id, peer_id
                );
                let outcome = CreateOutcome::Matched {
                    request_id: request.id,
                    session_id: session.id,
                    peer_id,
                };
                self.metrics
                    .record_request_created(outcome.label(), timer.stop());
                Ok(outcome)
            }
            AttemptOutcome::Pending => {
                if opened {
                    let user = user_id.to_string();
                    let withdrawn = self
                        .run(move |store| store.cancel_pending(&user, current_timestamp()))
                        .await?;
                    debug!(
                        "Withdrew {} request(s) opened for the accept by '{}'",
                        withdrawn, user_id
                    );
                }
                info!(
                    "Request {} was taken before '{}' could accept it",
                    request_id, user_id
                );
                Err(unavailable(request_id))
            }
        }
    }

    /// Withdraw the user's pending request(s)
    pub async fn cancel_request(&self, user_id: &str) -> Result<CancelOutcome> {
        validate_user(user_id)?;
        self.touch(user_id).await;

        let user = user_id.to_string();
        let cancelled = self
            .run(move |store| store.cancel_pending(&user, current_timestamp()))
            .await?;
        self.metrics.record_cancellation(cancelled);

        if cancelled == 0 {
            info!("Cancel for '{}' rejected: nothing pending", user_id);
        } else {
            info!("Cancelled {} pending request(s) for '{}'", cancelled, user_id);
        }

        Ok(CancelOutcome {
            cancelled_count: cancelled,
        })
    }

    /// Status of the user's latest request, applying lazy expiry
    pub async fn get_status(&self, user_id: &str) -> Result<StatusReport> {
        validate_user(user_id)?;
        self.touch(user_id).await;

        let Some(latest) = self.latest_request(user_id).await? else {
            return Ok(StatusReport::not_found());
        };

        let request = self.apply_lazy_expiry(latest, current_timestamp()).await?;
        let status = MatchStatus::from(request.status);
        let matched = status == MatchStatus::Matched;

        Ok(StatusReport {
            status,
            request_id: Some(request.id),
            session_id: request.session_id.filter(|_| matched),
            peer_id: request.matched_with_id.filter(|_| matched),
        })
    }

    /// Run every expiry sweep now
    pub async fn force_cleanup(&self) -> CleanupReport {
        info!("Running forced cleanup");
        self.reaper.sweep().await
    }

    /// End a session the user participates in.
    ///
    /// Returns `false` if the session had already ended.
    pub async fn end_session(&self, user_id: &str, session_id: SessionId) -> Result<bool> {
        validate_user(user_id)?;

        let session = self
            .run(move |store| store.get_session(session_id))
            .await?
            .ok_or_else(|| MatchmakingError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if !session.has_participant(user_id) {
            return Err(MatchmakingError::NotAParticipant {
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
            }
            .into());
        }

        match self
            .run(move |store| store.end_session(session_id, current_timestamp()))
            .await?
        {
            Some(expired) => {
                info!("User '{}' ended session {}", user_id, session_id);
                self.metrics.record_sessions_ended("participant", 1);
                self.metrics.record_expired("session_ended", expired);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Counts per status and match rate
    pub async fn stats(&self) -> Result<MatchingStats> {
        self.run(|store| {
            let counts = store.request_counts()?;
            let active_sessions = store.count_sessions(SessionStatus::Active)?;
            Ok(MatchingStats::from_counts(counts, active_sessions))
        })
        .await
    }

    /// Run a store operation off the async workers, as a service error
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MatchStore) -> crate::error::StoreResult<T> + Send + 'static,
    {
        blocking(&self.store, op)
            .await
            .map_err(|e| MatchmakingError::from(e).into())
    }

    /// Report the user's presence; a feed outage never fails the call
    async fn touch(&self, user_id: &str) {
        if let Err(e) = self
            .activity
            .record_presence(user_id, current_timestamp())
            .await
        {
            warn!("Failed to record presence of '{}': {}", user_id, e);
            self.metrics.record_activity_feed_error();
        }
    }

    async fn is_online(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        match self.activity.get_activity(user_id).await {
            Ok(activity) => activity
                .last_seen
                .is_some_and(|last_seen| now - last_seen <= self.online_window),
            Err(e) => {
                warn!("Activity feed unavailable for {}: {}", user_id, e);
                self.metrics.record_activity_feed_error();
                false
            }
        }
    }

    async fn latest_request(&self, user_id: &str) -> Result<Option<MatchRequest>> {
        let user = user_id.to_string();
        self.run(move |store| store.latest_request_for(&user)).await
    }

    async fn expire_latest_if_stale(&self, user_id: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(latest) = self.latest_request(user_id).await? {
            self.apply_lazy_expiry(latest, now).await?;
        }
        Ok(())
    }

    /// Open a waiting session and pending request; `None` if a concurrent
    /// call for the same user opened one first
    async fn open_request(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<MatchRequest>> {
        let session = Session::waiting(user_id, now);
        let request = MatchRequest::pending(user_id, Some(session.id), now);
        let opened = request.clone();
        match blocking(&self.store, move |store| store.open_request(session, opened)).await {
            Ok(()) => {
                debug!("Opened request {} for '{}'", request.id, user_id);
                Ok(Some(request))
            }
            Err(StoreError::Duplicate { .. }) => Ok(None),
            Err(e) => Err(MatchmakingError::from(e).into()),
        }
    }

    /// Reconnect or already-waiting outcome for a user, if any
    async fn existing_outcome(&self, user_id: &str) -> Result<Option<CreateOutcome>> {
        let user = user_id.to_string();
        if let Some(session) = self.run(move |store| store.open_session_for(&user)).await? {
            return Ok(Some(CreateOutcome::Reconnect {
                session_id: session.id,
                peer_id: session.peer_of(user_id).cloned(),
            }));
        }

        let latest = self.latest_request(user_id).await?;
        Ok(latest
            .filter(|r| r.status.is_open())
            .map(|r| CreateOutcome::Pending {
                request_id: r.id,
                already_waiting: true,
            }))
    }

    /// The request an accepting user pairs with, opening one if needed
    async fn accepting_request(&self, user_id: &str) -> Result<AcceptingRequest> {
        for _ in 0..MAX_OPEN_ATTEMPTS {
            let now = current_timestamp();
            self.expire_latest_if_stale(user_id, now).await?;

            let user = user_id.to_string();
            let open_session = self.run(move |store| store.open_session_for(&user)).await?;
            if let Some(session) = open_session.filter(|s| s.status == SessionStatus::Active) {
                return Ok(AcceptingRequest::Engaged(CreateOutcome::Reconnect {
                    session_id: session.id,
                    peer_id: session.peer_of(user_id).cloned(),
                }));
            }

            match self.latest_request(user_id).await? {
                Some(latest) if latest.status == RequestStatus::Pending => {
                    return Ok(AcceptingRequest::Existing(latest));
                }
                // Someone is pairing with this user right now
                Some(latest) if latest.status == RequestStatus::Matching => {
                    return Ok(AcceptingRequest::Engaged(CreateOutcome::Pending {
                        request_id: latest.id,
                        already_waiting: true,
                    }));
                }
                _ => {}
            }

            if let Some(request) = self.open_request(user_id, now).await? {
                return Ok(AcceptingRequest::Opened(request));
            }
        }

        Err(MatchmakingError::InternalError {
            message: format!("could not open a match request for '{}'", user_id),
        }
        .into())
    }

    /// Expire `request` if it outlived its TTL; returns the current row
    async fn apply_lazy_expiry(
        &self,
        request: MatchRequest,
        now: DateTime<Utc>,
    ) -> Result<MatchRequest> {
        let reason = if request.is_stale_open(now, self.pending_ttl) {
            "pending_ttl"
        } else if request.is_stale_match(now, self.matched_ttl) {
            "matched_ttl"
        } else {
            return Ok(request);
        };

        let (id, from) = (request.id, request.status);
        let (expired, current) = self
            .run(move |store| {
                let expired = store.expire_request(id, from, now)?;
                // Re-read either way: a lost CAS means someone else moved it
                Ok((expired, store.get_request(id)?))
            })
            .await?;
        if expired {
            debug!("Lazily expired request {} ({})", id, reason);
            self.metrics.record_expired(reason, 1);
        }
        Ok(current.unwrap_or(request))
    }
}

fn validate_user(user_id: &str) -> Result<()> {
    if is_valid_user_id(user_id) {
        Ok(())
    } else {
        Err(MatchmakingError::InvalidUser {
            reason: "user id must not be empty".to_string(),
        }
        .into())
    }
}

fn unavailable(request_id: RequestId) -> anyhow::Error {
    MatchmakingError::RequestUnavailable {
        request_id: request_id.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::InMemoryActivityFeed;
    use crate::store::{InMemoryMatchStore, RequestStore, SessionStore};

    fn manager_with_store() -> (RequestLifecycleManager, Arc<InMemoryMatchStore>) {
        let (manager, store, _feed) = manager_with_feed();
        (manager, store)
    }

    fn manager_with_feed() -> (
        RequestLifecycleManager,
        Arc<InMemoryMatchStore>,
        Arc<InMemoryActivityFeed>,
    ) {
        let store = Arc::new(InMemoryMatchStore::new());
        let feed = Arc::new(InMemoryActivityFeed::new());
        let mut config = AppConfig::default();
        config.matching.score_jitter = 0;
        let manager = RequestLifecycleManager::new(store.clone(), feed.clone(), &config);
        (manager, store, feed)
    }

    /// A pending request with its waiting session, created `age` ago
    fn seed_pending(store: &InMemoryMatchStore, user_id: &str, age: Duration) -> MatchRequest {
        let then = Utc::now() - age;
        let session = Session::waiting(user_id, then);
        let request = MatchRequest::pending(user_id, Some(session.id), then);
        store.preset(request.clone(), Some(session)).unwrap();
        request
    }

    #[tokio::test]
    async fn test_empty_user_id_is_rejected_before_store_access() {
        let (manager, store) = manager_with_store();

        let err = manager.create_request("   ").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::InvalidUser { .. })
        ));
        assert!(store.all_requests().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_request_waits() {
        let (manager, _store) = manager_with_store();

        let outcome = manager.create_request("alice").await.unwrap();
        assert!(matches!(
            outcome,
            CreateOutcome::Pending {
                already_waiting: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_waiting_user_reconnects_to_own_session() {
        let (manager, _store) = manager_with_store();

        manager.create_request("alice").await.unwrap();
        let again = manager.create_request("alice").await.unwrap();
        assert!(matches!(
            again,
            CreateOutcome::Reconnect { peer_id: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_open_request_without_session_reports_already_waiting() {
        let (manager, store) = manager_with_store();
        let request = MatchRequest::pending("alice", None, Utc::now());
        store.insert_request(request.clone()).unwrap();

        let outcome = manager.create_request("alice").await.unwrap();
        assert_eq!(
            outcome,
            CreateOutcome::Pending {
                request_id: request.id,
                already_waiting: true
            }
        );
    }

    #[tokio::test]
    async fn test_stale_request_is_replaced() {
        let (manager, store) = manager_with_store();
        let then = Utc::now() - Duration::minutes(15);
        let session = Session::waiting("alice", then);
        let stale = MatchRequest::pending("alice", Some(session.id), then);
        store.preset(stale.clone(), Some(session)).unwrap();

        let outcome = manager.create_request("alice").await.unwrap();
        match outcome {
            CreateOutcome::Pending {
                request_id,
                already_waiting: false,
            } => assert_ne!(request_id, stale.id),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            store.get_request(stale.id).unwrap().unwrap().status,
            RequestStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_get_status_not_found() {
        let (manager, _store) = manager_with_store();
        let report = manager.get_status("nobody").await.unwrap();
        assert_eq!(report, StatusReport::not_found());
    }

    #[tokio::test]
    async fn test_end_session_requires_participant() {
        let (manager, store) = manager_with_store();
        let session = Session::active("alice", "bob", Utc::now());
        store.insert_session(session.clone()).unwrap();

        let err = manager.end_session("mallory", session.id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::NotAParticipant { .. })
        ));

        assert!(manager.end_session("bob", session.id).await.unwrap());
        assert!(!manager.end_session("bob", session.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_after_pairing() {
        let (manager, _store) = manager_with_store();
        manager.create_request("alice").await.unwrap();
        manager.create_request("bob").await.unwrap();

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.counts.matched, 2);
        assert_eq!(stats.active_sessions, 1);
        assert!((stats.match_rate - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_get_status_expires_old_match() {
        let (manager, store) = manager_with_store();
        let matched_at = Utc::now() - Duration::minutes(61);
        let session = Session::active("alice", "bob", matched_at);
        let mut request = MatchRequest::pending("alice", Some(session.id), matched_at);
        request.status = RequestStatus::Matched;
        request.matched_at = Some(matched_at);
        request.matched_with_id = Some("bob".to_string());
        store.preset(request.clone(), Some(session)).unwrap();

        let report = manager.get_status("alice").await.unwrap();
        assert_eq!(report.status, MatchStatus::Expired);
        assert_eq!(report.request_id, Some(request.id));
        assert_eq!(report.peer_id, None);
        assert_eq!(
            store.get_request(request.id).unwrap().unwrap().status,
            RequestStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_get_status_keeps_recent_match() {
        let (manager, store) = manager_with_store();
        let matched_at = Utc::now() - Duration::minutes(59);
        let session = Session::active("alice", "bob", matched_at);
        let mut request = MatchRequest::pending("alice", Some(session.id), matched_at);
        request.status = RequestStatus::Matched;
        request.matched_at = Some(matched_at);
        request.matched_with_id = Some("bob".to_string());
        store.preset(request, Some(session.clone())).unwrap();

        let report = manager.get_status("alice").await.unwrap();
        assert_eq!(report.status, MatchStatus::Matched);
        assert_eq!(report.session_id, Some(session.id));
        assert_eq!(report.peer_id.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_calls_record_presence() {
        let (manager, _store, feed) = manager_with_feed();

        manager.create_request("alice").await.unwrap();
        manager.get_status("bob").await.unwrap();

        let now = Utc::now();
        assert!(feed.activity_at("alice", now).unwrap().last_seen.is_some());
        assert!(feed.activity_at("bob", now).unwrap().last_seen.is_some());
        assert_eq!(feed.activity_at("carol", now).unwrap().last_seen, None);
    }

    #[tokio::test]
    async fn test_available_requests_lists_online_requesters_only() {
        let (manager, store, feed) = manager_with_feed();
        let now = Utc::now();
        let online = seed_pending(&store, "online", Duration::minutes(2));
        seed_pending(&store, "away", Duration::minutes(1));
        seed_pending(&store, "stale", Duration::minutes(20));
        feed.record_seen("online", now - Duration::minutes(1)).unwrap();
        feed.record_seen("away", now - Duration::hours(2)).unwrap();
        feed.record_seen("stale", now).unwrap();

        let available = manager.available_requests("carol", 10).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].request_id, online.id);
        assert_eq!(available[0].requester_id, "online");
    }

    #[tokio::test]
    async fn test_available_requests_respects_limit_and_excludes_caller() {
        let (manager, store, feed) = manager_with_feed();
        let now = Utc::now();
        for (i, user) in ["u1", "u2", "u3", "carol"].iter().enumerate() {
            seed_pending(&store, user, Duration::minutes(5 - i as i64));
            feed.record_seen(user, now).unwrap();
        }

        let available = manager.available_requests("carol", 2).await.unwrap();
        let requesters: Vec<_> = available.iter().map(|a| a.requester_id.as_str()).collect();
        assert_eq!(requesters, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_accept_request_pairs_with_target() {
        let (manager, store) = manager_with_store();
        let target = seed_pending(&store, "bob", Duration::minutes(1));

        let outcome = manager.accept_request("carol", target.id).await.unwrap();
        let session_id = match outcome {
            CreateOutcome::Matched {
                session_id,
                ref peer_id,
                ..
            } => {
                assert_eq!(peer_id, "bob");
                session_id
            }
            other => panic!("unexpected outcome {:?}", other),
        };

        let session = store.get_session(session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.has_participant("carol"));
        assert!(session.has_participant("bob"));
        let bob = store.get_request(target.id).unwrap().unwrap();
        assert_eq!(bob.status, RequestStatus::Matched);
        assert_eq!(bob.matched_with_id.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn test_accept_own_request_is_rejected() {
        let (manager, store) = manager_with_store();
        let own = seed_pending(&store, "carol", Duration::minutes(1));

        let err = manager.accept_request("carol", own.id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::OwnRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_unknown_request_is_not_found() {
        let (manager, _store) = manager_with_store();

        let err = manager
            .accept_request("carol", uuid::Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::RequestNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_cancelled_request_is_unavailable() {
        let (manager, store) = manager_with_store();
        let target = seed_pending(&store, "bob", Duration::minutes(1));
        store.cancel_pending("bob", Utc::now()).unwrap();

        let err = manager.accept_request("carol", target.id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::RequestUnavailable { .. })
        ));
        assert_eq!(
            manager.get_status("carol").await.unwrap(),
            StatusReport::not_found()
        );
    }

    #[tokio::test]
    async fn test_accept_expired_target_is_unavailable() {
        let (manager, store) = manager_with_store();
        let target = seed_pending(&store, "bob", Duration::minutes(11));

        let err = manager.accept_request("carol", target.id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::RequestUnavailable { .. })
        ));
        assert_eq!(
            store.get_request(target.id).unwrap().unwrap().status,
            RequestStatus::Expired
        );
    }
}

//! Candidate selection and the atomic claim protocol
//!
//! An attempt walks the oldest pending candidates (the first few reordered by
//! score), claims one with a conditional update, and commits the pairing in a
//! single store unit of work. A candidate is only ever claimed while the
//! caller's own request is still pending, so two users can never hold claims
//! on each other.

use crate::activity::ActivityFeed;
use crate::config::MatchingSettings;
use crate::error::{StoreError, StoreResult};
use crate::matching::scoring::{reorder_window, ScoreFactors, ScoringEngine};
use crate::metrics::MetricsCollector;
use crate::store::{blocking, MatchStore, PairingCommit, SessionResolution};
use crate::types::{
    MatchRequest, RequestId, RequestStatus, Session, SessionId, SessionStatus, UserId,
};
use crate::utils::current_timestamp;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tuning for matcher attempts
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Oldest candidates re-ordered by score
    pub candidate_window: usize,
    /// Upper bound on candidates fetched per attempt
    pub max_candidates: usize,
    /// Score jitter range
    pub score_jitter: i64,
    /// Commit retries after transient contention
    pub commit_retry_attempts: u32,
    /// Linear backoff step between retries
    pub commit_retry_backoff: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            candidate_window: 3,
            max_candidates: 50,
            score_jitter: 20,
            commit_retry_attempts: 3,
            commit_retry_backoff: Duration::from_millis(25),
        }
    }
}

impl From<&MatchingSettings> for MatcherConfig {
    fn from(settings: &MatchingSettings) -> Self {
        Self {
            candidate_window: settings.candidate_window,
            max_candidates: settings.max_candidates,
            score_jitter: settings.score_jitter,
            commit_retry_attempts: settings.commit_retry_attempts,
            commit_retry_backoff: Duration::from_millis(settings.commit_retry_backoff_ms),
        }
    }
}

/// Result of one matcher attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The caller was paired; `session` is active and holds both users
    Matched { session: Session, peer_id: UserId },
    /// No pairing was made; the caller stays (or was left) waiting
    Pending,
}

/// What to do after trying one candidate
enum CandidateStep {
    Matched(Session),
    NextCandidate,
    Stop,
}

/// Pairs a pending request with one of the waiting candidates
pub struct Matcher {
    store: Arc<dyn MatchStore>,
    activity: Arc<dyn ActivityFeed>,
    scoring: ScoringEngine,
    config: MatcherConfig,
    metrics: Arc<MetricsCollector>,
}

impl Matcher {
    /// Create a new matcher
    pub fn new(
        store: Arc<dyn MatchStore>,
        activity: Arc<dyn ActivityFeed>,
        config: MatcherConfig,
    ) -> Self {
        // Create a default metrics collector if none provided
        let metrics = Arc::new(MetricsCollector::new().unwrap_or_else(|_| {
            warn!("Failed to create metrics collector, using default");
            MetricsCollector::default()
        }));

        Self::with_metrics(store, activity, config, metrics)
    }

    /// Create a new matcher with metrics collector
    pub fn with_metrics(
        store: Arc<dyn MatchStore>,
        activity: Arc<dyn ActivityFeed>,
        config: MatcherConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            activity,
            scoring: ScoringEngine::new(config.score_jitter),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Try to pair `request` with a waiting candidate.
    ///
    /// Store failures never escape: they are logged and end the attempt as
    /// `Pending`.
    pub async fn attempt(&self, request: &MatchRequest) -> AttemptOutcome {
        let timer = self.metrics.start_timer();
        let mut examined = 0;
        let outcome = self.run_attempt(request, &mut examined).await;
        self.metrics.record_attempt(examined, timer.stop());
        outcome
    }

    /// Pair `request` with one specific pending request chosen by the caller.
    ///
    /// Goes through the same guarded claim and commit as `attempt`; a target
    /// that is no longer pending leaves the caller untouched.
    pub async fn accept(&self, request: &MatchRequest, target: &MatchRequest) -> AttemptOutcome {
        let timer = self.metrics.start_timer();
        let outcome = match self.try_candidate(request, target).await {
            CandidateStep::Matched(session) => {
                info!(
                    "{} accepted the request of {} in session {}",
                    request.requester_id, target.requester_id, session.id
                );
                self.metrics.record_match();
                AttemptOutcome::Matched {
                    session,
                    peer_id: target.requester_id.clone(),
                }
            }
            CandidateStep::NextCandidate | CandidateStep::Stop => AttemptOutcome::Pending,
        };
        self.metrics.record_attempt(1, timer.stop());
        outcome
    }

    async fn run_attempt(&self, request: &MatchRequest, examined: &mut usize) -> AttemptOutcome {
        let exclude = request.requester_id.clone();
        let limit = self.config.max_candidates;
        let candidates =
            match blocking(&self.store, move |store| store.pending_candidates(&exclude, limit))
                .await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(
                        "Failed to load candidates for {}: {}",
                        request.requester_id, e
                    );
                    return AttemptOutcome::Pending;
                }
            };

        if candidates.is_empty() {
            debug!("No candidates waiting for {}", request.requester_id);
            return AttemptOutcome::Pending;
        }

        let ordered = self.rank_candidates(candidates).await;

        for candidate in ordered {
            *examined += 1;

            match self.try_candidate(request, &candidate).await {
                CandidateStep::Matched(session) => {
                    info!(
                        "Matched {} with {} in session {}",
                        request.requester_id, candidate.requester_id, session.id
                    );
                    self.metrics.record_match();
                    return AttemptOutcome::Matched {
                        session,
                        peer_id: candidate.requester_id,
                    };
                }
                CandidateStep::NextCandidate => continue,
                CandidateStep::Stop => return AttemptOutcome::Pending,
            }
        }

        AttemptOutcome::Pending
    }

    /// Claim `candidate` for `request`, confirm the claim, then commit
    async fn try_candidate(
        &self,
        request: &MatchRequest,
        candidate: &MatchRequest,
    ) -> CandidateStep {
        let (candidate_id, caller_id) = (candidate.id, request.id);
        match blocking(&self.store, move |store| {
            store.claim_candidate(candidate_id, caller_id)
        })
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.record_race_lost();
                if !self.caller_still_pending(request).await {
                    debug!(
                        "Request {} was claimed by another attempt, stopping",
                        request.id
                    );
                    return CandidateStep::Stop;
                }
                debug!(
                    "Candidate {} already taken, trying next",
                    candidate.requester_id
                );
                return CandidateStep::NextCandidate;
            }
            Err(e) => {
                warn!("Failed to claim candidate {}: {}", candidate.id, e);
                return CandidateStep::NextCandidate;
            }
        }

        // Confirm the claim before touching sessions
        match self.read_request(candidate.id).await {
            Ok(Some(current)) if current.status == RequestStatus::Matching => {}
            Ok(_) => {
                self.metrics.record_race_lost();
                return CandidateStep::NextCandidate;
            }
            Err(e) => {
                warn!("Failed to re-read candidate {}: {}", candidate.id, e);
                self.release_candidate(candidate).await;
                return CandidateStep::NextCandidate;
            }
        }

        self.commit_with_retry(request, candidate).await
    }

    /// Score the oldest `candidate_window` candidates and move the best forward
    async fn rank_candidates(&self, candidates: Vec<MatchRequest>) -> Vec<MatchRequest> {
        let window = self.config.candidate_window.min(candidates.len());
        let now = current_timestamp();

        let mut scores = Vec::with_capacity(window);
        for candidate in candidates.iter().take(window) {
            let factors = self.gather_factors(&candidate.requester_id).await;
            let score = self.scoring.score(&factors, now);
            debug!("Candidate {} scored {}", candidate.requester_id, score);
            scores.push(score);
        }

        reorder_window(candidates, &scores, window)
    }

    async fn gather_factors(&self, user_id: &str) -> ScoreFactors {
        let activity = match self.activity.get_activity(user_id).await {
            Ok(activity) => activity,
            Err(e) => {
                warn!("Activity feed unavailable for {}: {}", user_id, e);
                self.metrics.record_activity_feed_error();
                Default::default()
            }
        };

        let user = user_id.to_string();
        let successful_matches =
            blocking(&self.store, move |store| store.successful_matches(&user))
                .await
                .unwrap_or_else(|e| {
                    warn!("Failed to count matches for {}: {}", user_id, e);
                    0
                });

        ScoreFactors::new(activity, successful_matches)
    }

    async fn read_request(&self, id: RequestId) -> StoreResult<Option<MatchRequest>> {
        blocking(&self.store, move |store| store.get_request(id)).await
    }

    async fn caller_still_pending(&self, request: &MatchRequest) -> bool {
        matches!(
            self.read_request(request.id).await,
            Ok(Some(current)) if current.status == RequestStatus::Pending
        )
    }

    async fn commit_with_retry(
        &self,
        request: &MatchRequest,
        candidate: &MatchRequest,
    ) -> CandidateStep {
        let max_retries = self.config.commit_retry_attempts;
        let mut retry = 0;

        loop {
            let (caller, claimed) = (request.clone(), candidate.clone());
            let result = blocking(&self.store, move |store| {
                let (resolution, superseded) = resolve_session(store, &caller, &claimed)?;
                store.commit_pairing(&PairingCommit {
                    caller_request: caller.id,
                    caller_id: caller.requester_id,
                    candidate_request: claimed.id,
                    candidate_id: claimed.requester_id,
                    resolution,
                    superseded,
                    now: current_timestamp(),
                })
            })
            .await;

            match result {
                Ok(session) => return CandidateStep::Matched(session),
                Err(StoreError::RaceLost) => {
                    debug!(
                        "Candidate {} left matching before commit",
                        candidate.requester_id
                    );
                    self.metrics.record_race_lost();
                    return CandidateStep::NextCandidate;
                }
                Err(StoreError::TerminalConflict { message }) => {
                    warn!(
                        "Request {} can no longer be paired: {}",
                        request.id, message
                    );
                    self.metrics.record_commit_conflict("terminal");
                    self.expire_caller(request).await;
                    self.release_candidate(candidate).await;
                    return CandidateStep::Stop;
                }
                Err(e) if e.is_transient() && retry < max_retries => {
                    retry += 1;
                    debug!(
                        "Transient failure committing {} with {} (retry {}/{}): {}",
                        request.requester_id, candidate.requester_id, retry, max_retries, e
                    );
                    self.metrics.record_commit_conflict("transient");
                    tokio::time::sleep(self.config.commit_retry_backoff * retry).await;
                }
                Err(e) => {
                    warn!(
                        "Giving up on pairing {} with {}: {}",
                        request.requester_id, candidate.requester_id, e
                    );
                    self.metrics.record_commit_conflict("exhausted");
                    self.release_candidate(candidate).await;
                    return CandidateStep::Stop;
                }
            }
        }
    }

    /// Expire the caller from whichever open state it was left in.
    ///
    /// A caller that already reached matched, cancelled or expired is kept.
    async fn expire_caller(&self, request: &MatchRequest) {
        match self.read_request(request.id).await {
            Ok(Some(current)) if current.status.is_open() => {
                self.expire(request.id, current.status).await;
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to re-read request {}: {}", request.id, e),
        }
    }

    /// A claimed candidate never returns to pending; it is expired instead
    async fn release_candidate(&self, candidate: &MatchRequest) {
        self.expire(candidate.id, RequestStatus::Matching).await;
    }

    async fn expire(&self, id: RequestId, from: RequestStatus) {
        let result = blocking(&self.store, move |store| {
            store.expire_request(id, from, current_timestamp())
        })
        .await;
        match result {
            Ok(true) => self.metrics.record_expired("conflict", 1),
            Ok(false) => {}
            Err(e) => warn!("Failed to expire request {}: {}", id, e),
        }
    }
}

/// Pick the session for a pairing: candidate's waiting session, then the
/// caller's, else a fresh one
fn resolve_session(
    store: &dyn MatchStore,
    request: &MatchRequest,
    candidate: &MatchRequest,
) -> StoreResult<(SessionResolution, Vec<SessionId>)> {
    let candidate_session = waiting_session_of(store, candidate)?;
    let caller_session = waiting_session_of(store, request)?;

    let resolved = match (candidate_session, caller_session) {
        (Some(candidate_session), caller_session) => (
            SessionResolution::AttachToCandidate(candidate_session),
            caller_session.into_iter().collect(),
        ),
        (None, Some(caller_session)) => {
            (SessionResolution::AttachToCaller(caller_session), Vec::new())
        }
        (None, None) => (SessionResolution::CreateNew, Vec::new()),
    };
    Ok(resolved)
}

fn waiting_session_of(
    store: &dyn MatchStore,
    request: &MatchRequest,
) -> StoreResult<Option<SessionId>> {
    let Some(session_id) = request.session_id else {
        return Ok(None);
    };
    let session = store.get_session(session_id)?;
    Ok(session
        .filter(|s| {
            s.status == SessionStatus::Waiting
                && s.participant_a == request.requester_id
                && s.participant_b.is_none()
        })
        .map(|s| s.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::InMemoryActivityFeed;
    use crate::store::{InMemoryMatchStore, RequestStore, SessionStore};
    use chrono::{DateTime, Utc};
    use chrono::Duration as ChronoDuration;

    fn matcher_for(store: Arc<InMemoryMatchStore>, feed: Arc<InMemoryActivityFeed>) -> Matcher {
        let config = MatcherConfig {
            score_jitter: 0,
            ..MatcherConfig::default()
        };
        Matcher::new(store, feed, config)
    }

    fn open_for(store: &InMemoryMatchStore, user: &str, at: DateTime<Utc>) -> MatchRequest {
        let session = Session::waiting(user, at);
        let request = MatchRequest::pending(user, Some(session.id), at);
        store.open_request(session, request.clone()).unwrap();
        request
    }

    #[tokio::test]
    async fn test_no_candidates_stays_pending() {
        let store = Arc::new(InMemoryMatchStore::new());
        let matcher = matcher_for(store.clone(), Arc::new(InMemoryActivityFeed::new()));
        let alice = open_for(&store, "alice", Utc::now());

        assert_eq!(matcher.attempt(&alice).await, AttemptOutcome::Pending);
        assert_eq!(
            store.get_request(alice.id).unwrap().unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_pairs_into_candidate_session() {
        let store = Arc::new(InMemoryMatchStore::new());
        let matcher = matcher_for(store.clone(), Arc::new(InMemoryActivityFeed::new()));
        let now = Utc::now();
        let bob = open_for(&store, "bob", now - ChronoDuration::seconds(30));
        let alice = open_for(&store, "alice", now);

        let outcome = matcher.attempt(&alice).await;
        let AttemptOutcome::Matched { session, peer_id } = outcome else {
            panic!("expected a match");
        };
        assert_eq!(peer_id, "bob");
        assert_eq!(Some(session.id), bob.session_id);
        assert_eq!(session.participant_b.as_deref(), Some("alice"));

        // The caller's speculative session is no longer open
        let own = store.get_session(alice.session_id.unwrap()).unwrap().unwrap();
        assert_eq!(own.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_scoring_prefers_active_candidate_within_window() {
        let store = Arc::new(InMemoryMatchStore::new());
        let feed = Arc::new(InMemoryActivityFeed::new());
        let matcher = matcher_for(store.clone(), feed.clone());
        let now = Utc::now();

        open_for(&store, "idle", now - ChronoDuration::seconds(60));
        open_for(&store, "online", now - ChronoDuration::seconds(30));
        for minutes_ago in 0..10 {
            feed.record_seen("online", now - ChronoDuration::minutes(minutes_ago))
                .unwrap();
        }
        let alice = open_for(&store, "alice", now);

        match matcher.attempt(&alice).await {
            AttemptOutcome::Matched { peer_id, .. } => assert_eq!(peer_id, "online"),
            AttemptOutcome::Pending => panic!("expected a match"),
        }
    }

    #[tokio::test]
    async fn test_candidate_outside_window_keeps_fifo() {
        let store = Arc::new(InMemoryMatchStore::new());
        let feed = Arc::new(InMemoryActivityFeed::new());
        let config = MatcherConfig {
            candidate_window: 1,
            score_jitter: 0,
            ..MatcherConfig::default()
        };
        let matcher = Matcher::new(store.clone(), feed.clone(), config);
        let now = Utc::now();

        open_for(&store, "oldest", now - ChronoDuration::seconds(60));
        open_for(&store, "newer", now - ChronoDuration::seconds(30));
        for hours_ago in 0..50 {
            feed.record_seen("newer", now - ChronoDuration::hours(hours_ago))
                .unwrap();
        }
        let alice = open_for(&store, "alice", now);

        match matcher.attempt(&alice).await {
            AttemptOutcome::Matched { peer_id, .. } => assert_eq!(peer_id, "oldest"),
            AttemptOutcome::Pending => panic!("expected a match"),
        }
    }

    #[tokio::test]
    async fn test_skips_candidate_claimed_elsewhere() {
        let store = Arc::new(InMemoryMatchStore::new());
        let matcher = matcher_for(store.clone(), Arc::new(InMemoryActivityFeed::new()));
        let now = Utc::now();

        let bob = open_for(&store, "bob", now - ChronoDuration::seconds(60));
        open_for(&store, "carol", now - ChronoDuration::seconds(30));
        // bob is mid-claim by someone else
        assert!(store
            .transition_request(bob.id, RequestStatus::Pending, RequestStatus::Matching)
            .unwrap());
        let alice = open_for(&store, "alice", now);

        match matcher.attempt(&alice).await {
            AttemptOutcome::Matched { peer_id, .. } => assert_eq!(peer_id, "carol"),
            AttemptOutcome::Pending => panic!("expected a match"),
        }
    }

    #[tokio::test]
    async fn test_claimed_caller_stops_attempt() {
        let store = Arc::new(InMemoryMatchStore::new());
        let matcher = matcher_for(store.clone(), Arc::new(InMemoryActivityFeed::new()));
        let now = Utc::now();

        let bob = open_for(&store, "bob", now - ChronoDuration::seconds(60));
        let alice = open_for(&store, "alice", now);
        assert!(store
            .transition_request(alice.id, RequestStatus::Pending, RequestStatus::Matching)
            .unwrap());

        assert_eq!(matcher.attempt(&alice).await, AttemptOutcome::Pending);
        assert_eq!(
            store.get_request(bob.id).unwrap().unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_creates_session_when_nobody_is_waiting_in_one() {
        let store = Arc::new(InMemoryMatchStore::new());
        let matcher = matcher_for(store.clone(), Arc::new(InMemoryActivityFeed::new()));
        let now = Utc::now();

        let bob = MatchRequest::pending("bob", None, now - ChronoDuration::seconds(10));
        store.insert_request(bob.clone()).unwrap();
        let alice = MatchRequest::pending("alice", None, now);
        store.insert_request(alice.clone()).unwrap();

        let AttemptOutcome::Matched { session, .. } = matcher.attempt(&alice).await else {
            panic!("expected a match");
        };
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.has_participant("alice") && session.has_participant("bob"));
        assert_eq!(
            store.get_request(bob.id).unwrap().unwrap().session_id,
            Some(session.id)
        );
    }

    #[tokio::test]
    async fn test_accept_pairs_with_chosen_request() {
        let store = Arc::new(InMemoryMatchStore::new());
        let matcher = matcher_for(store.clone(), Arc::new(InMemoryActivityFeed::new()));
        let now = Utc::now();

        open_for(&store, "oldest", now - ChronoDuration::seconds(90));
        let bob = open_for(&store, "bob", now - ChronoDuration::seconds(30));
        let alice = open_for(&store, "alice", now);

        let AttemptOutcome::Matched { session, peer_id } = matcher.accept(&alice, &bob).await
        else {
            panic!("expected a match");
        };
        assert_eq!(peer_id, "bob");
        assert_eq!(Some(session.id), bob.session_id);
        assert_eq!(
            store.get_request(bob.id).unwrap().unwrap().matched_with_id.as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn test_accept_of_taken_request_leaves_caller_waiting() {
        let store = Arc::new(InMemoryMatchStore::new());
        let matcher = matcher_for(store.clone(), Arc::new(InMemoryActivityFeed::new()));
        let now = Utc::now();

        let bob = open_for(&store, "bob", now - ChronoDuration::seconds(30));
        assert!(store
            .transition_request(bob.id, RequestStatus::Pending, RequestStatus::Cancelled)
            .unwrap());
        let alice = open_for(&store, "alice", now);

        assert_eq!(matcher.accept(&alice, &bob).await, AttemptOutcome::Pending);
        assert_eq!(
            store.get_request(alice.id).unwrap().unwrap().status,
            RequestStatus::Pending
        );
        assert_eq!(
            store.get_request(bob.id).unwrap().unwrap().status,
            RequestStatus::Cancelled
        );
    }
}

//! TTL sweeps over requests and sessions
//!
//! Each item is handled independently: a failure is logged and counted, and
//! the sweep moves on.

use crate::activity::ActivityFeed;
use crate::config::AppConfig;
use crate::metrics::MetricsCollector;
use crate::store::{blocking, MatchStore};
use crate::types::{CleanupReport, Session};
use crate::utils::{current_timestamp, to_chrono};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Thresholds for the expiry sweeps
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Open (pending or matching) requests older than this are expired
    pub pending_ttl: Duration,
    /// Matched requests older than this are expired
    pub matched_ttl: Duration,
    /// Active sessions younger than this are left alone
    pub session_grace: Duration,
    /// Both participants must be idle this long for a session to end
    pub inactivity_threshold: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(10 * 60),
            matched_ttl: Duration::from_secs(60 * 60),
            session_grace: Duration::from_secs(5 * 60),
            inactivity_threshold: Duration::from_secs(30 * 60),
        }
    }
}

impl From<&AppConfig> for ReaperConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            pending_ttl: config.pending_ttl(),
            matched_ttl: config.matched_ttl(),
            session_grace: config.session_grace(),
            inactivity_threshold: config.inactivity_threshold(),
        }
    }
}

/// Expires stale requests and ends abandoned sessions
pub struct ExpiryReaper {
    store: Arc<dyn MatchStore>,
    activity: Arc<dyn ActivityFeed>,
    config: ReaperConfig,
    metrics: Arc<MetricsCollector>,
}

impl ExpiryReaper {
    pub fn new(
        store: Arc<dyn MatchStore>,
        activity: Arc<dyn ActivityFeed>,
        config: ReaperConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            activity,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Run all three sweeps now
    pub async fn sweep(&self) -> CleanupReport {
        self.sweep_at(current_timestamp()).await
    }

    /// Run all three sweeps as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let timer = self.metrics.start_timer();

        let mut report = self.expire_open_requests(now).await;
        report.merge(self.expire_matched_requests(now).await);
        report.merge(self.end_inactive_sessions(now).await);

        self.metrics.record_cleanup(&report, timer.stop());
        if report.expired_requests > 0 || report.ended_sessions > 0 {
            info!(
                "Cleanup expired {} requests, ended {} sessions ({} failures)",
                report.expired_requests, report.ended_sessions, report.failed_items
            );
        } else {
            debug!("Cleanup found nothing to do");
        }
        report
    }

    /// Pending and matching requests past the pending TTL
    async fn expire_open_requests(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cutoff = now - to_chrono(self.config.pending_ttl);

        let stale = match blocking(&self.store, move |store| {
            store.open_requests_created_before(cutoff)
        })
        .await
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!("Failed to list stale open requests: {}", e);
                report.failed_items += 1;
                return report;
            }
        };

        for request in stale {
            let (id, from) = (request.id, request.status);
            match blocking(&self.store, move |store| store.expire_request(id, from, now)).await {
                Ok(true) => {
                    debug!(
                        "Expired {} request {} of {}",
                        request.status, request.id, request.requester_id
                    );
                    report.expired_requests += 1;
                }
                // Moved on since it was listed
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to expire request {}: {}", request.id, e);
                    report.failed_items += 1;
                }
            }
        }

        self.metrics
            .record_expired("pending_ttl", report.expired_requests);
        report
    }

    /// Matched requests past the matched TTL; their sessions are untouched
    async fn expire_matched_requests(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cutoff = now - to_chrono(self.config.matched_ttl);

        let stale = match blocking(&self.store, move |store| store.matched_requests_before(cutoff))
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!("Failed to list stale matched requests: {}", e);
                report.failed_items += 1;
                return report;
            }
        };

        for request in stale {
            let (id, from) = (request.id, request.status);
            match blocking(&self.store, move |store| store.expire_request(id, from, now)).await {
                Ok(true) => report.expired_requests += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to expire matched request {}: {}", request.id, e);
                    report.failed_items += 1;
                }
            }
        }

        self.metrics
            .record_expired("matched_ttl", report.expired_requests);
        report
    }

    /// Active sessions past the grace period whose participants have all gone quiet
    async fn end_inactive_sessions(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cutoff = now - to_chrono(self.config.session_grace);

        let sessions = match blocking(&self.store, move |store| {
            store.active_sessions_created_before(cutoff)
        })
        .await
        {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Failed to list active sessions: {}", e);
                report.failed_items += 1;
                return report;
            }
        };

        for session in sessions {
            match self.all_participants_inactive(&session, now).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(
                        "Skipping session {}: activity unavailable: {}",
                        session.id, e
                    );
                    report.failed_items += 1;
                    continue;
                }
            }

            let session_id = session.id;
            match blocking(&self.store, move |store| store.end_session(session_id, now)).await {
                Ok(Some(expired)) => {
                    info!("Ended inactive session {}", session.id);
                    report.ended_sessions += 1;
                    report.expired_requests += expired;
                    self.metrics.record_expired("session_ended", expired);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to end session {}: {}", session.id, e);
                    report.failed_items += 1;
                }
            }
        }

        self.metrics
            .record_sessions_ended("inactivity", report.ended_sessions);
        report
    }

    async fn all_participants_inactive(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> crate::error::Result<bool> {
        let threshold = to_chrono(self.config.inactivity_threshold);
        for participant in session.participants() {
            let activity = self.activity.get_activity(participant).await?;
            // Never seen counts as inactive
            let active = activity
                .last_seen
                .is_some_and(|last_seen| now - last_seen <= threshold);
            if active {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::InMemoryActivityFeed;
    use crate::store::{InMemoryMatchStore, RequestStore, SessionStore};
    use crate::types::{MatchRequest, RequestStatus, SessionStatus};
    use chrono::Duration as ChronoDuration;

    fn reaper_for(
        store: Arc<InMemoryMatchStore>,
        feed: Arc<InMemoryActivityFeed>,
    ) -> ExpiryReaper {
        ExpiryReaper::new(
            store,
            feed,
            ReaperConfig::default(),
            Arc::new(MetricsCollector::default()),
        )
    }

    #[tokio::test]
    async fn test_expires_stale_pending_and_ends_waiting_session() {
        let store = Arc::new(InMemoryMatchStore::new());
        let reaper = reaper_for(store.clone(), Arc::new(InMemoryActivityFeed::new()));
        let now = Utc::now();
        let then = now - ChronoDuration::minutes(11);

        let session = Session::waiting("alice", then);
        let request = MatchRequest::pending("alice", Some(session.id), then);
        store.open_request(session.clone(), request.clone()).unwrap();
        let fresh_session = Session::waiting("bob", now);
        let fresh = MatchRequest::pending("bob", Some(fresh_session.id), now);
        store.open_request(fresh_session, fresh.clone()).unwrap();

        let report = reaper.sweep_at(now).await;
        assert_eq!(report.expired_requests, 1);
        assert_eq!(report.failed_items, 0);
        assert_eq!(
            store.get_request(request.id).unwrap().unwrap().status,
            RequestStatus::Expired
        );
        assert_eq!(
            store.get_session(session.id).unwrap().unwrap().status,
            SessionStatus::Ended
        );
        assert_eq!(
            store.get_request(fresh.id).unwrap().unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_expires_stale_matching_claim() {
        let store = Arc::new(InMemoryMatchStore::new());
        let reaper = reaper_for(store.clone(), Arc::new(InMemoryActivityFeed::new()));
        let now = Utc::now();

        let mut stuck = MatchRequest::pending("carol", None, now - ChronoDuration::minutes(20));
        stuck.status = RequestStatus::Matching;
        store.insert_request(stuck.clone()).unwrap();

        let report = reaper.sweep_at(now).await;
        assert_eq!(report.expired_requests, 1);
        assert_eq!(
            store.get_request(stuck.id).unwrap().unwrap().status,
            RequestStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_expires_old_match_but_keeps_session() {
        let store = Arc::new(InMemoryMatchStore::new());
        let feed = Arc::new(InMemoryActivityFeed::new());
        let reaper = reaper_for(store.clone(), feed.clone());
        let now = Utc::now();
        let matched_at = now - ChronoDuration::minutes(61);

        let session = Session::active("alice", "bob", matched_at);
        store.insert_session(session.clone()).unwrap();
        let mut request = MatchRequest::pending("alice", Some(session.id), matched_at);
        request.status = RequestStatus::Matched;
        request.matched_at = Some(matched_at);
        request.matched_with_id = Some("bob".to_string());
        store.insert_request(request.clone()).unwrap();
        // Participants still chatting
        feed.record_seen("alice", now).unwrap();

        let report = reaper.sweep_at(now).await;
        assert_eq!(report.expired_requests, 1);
        assert_eq!(report.ended_sessions, 0);
        assert_eq!(
            store.get_session(session.id).unwrap().unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_ends_session_only_when_everyone_is_idle() {
        let store = Arc::new(InMemoryMatchStore::new());
        let feed = Arc::new(InMemoryActivityFeed::new());
        let reaper = reaper_for(store.clone(), feed.clone());
        let now = Utc::now();
        let created = now - ChronoDuration::minutes(45);

        let idle = Session::active("alice", "bob", created);
        let half_idle = Session::active("carol", "dave", created);
        let young = Session::active("erin", "frank", now - ChronoDuration::minutes(2));
        for session in [&idle, &half_idle, &young] {
            store.insert_session(session.clone()).unwrap();
        }
        feed.record_seen("alice", now - ChronoDuration::minutes(40)).unwrap();
        feed.record_seen("dave", now - ChronoDuration::minutes(1)).unwrap();

        let report = reaper.sweep_at(now).await;
        assert_eq!(report.ended_sessions, 1);
        assert_eq!(
            store.get_session(idle.id).unwrap().unwrap().status,
            SessionStatus::Ended
        );
        assert_eq!(
            store.get_session(half_idle.id).unwrap().unwrap().status,
            SessionStatus::Active
        );
        assert_eq!(
            store.get_session(young.id).unwrap().unwrap().status,
            SessionStatus::Active
        );
    }
}

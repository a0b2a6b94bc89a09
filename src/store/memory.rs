//! In-memory match store
//!
//! All rows live behind a single `RwLock`, so every trait method is one
//! critical section and therefore atomic. Suitable for tests, the tester
//! binary and single-process deployments.

use super::{MatchStore, PairingCommit, RequestStore, SessionResolution, SessionStore};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    MatchRequest, RequestCounts, RequestId, RequestStatus, Session, SessionId, SessionStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct StoreState {
    /// Requests in insertion order; never deleted
    requests: Vec<MatchRequest>,
    request_index: HashMap<RequestId, usize>,
    sessions: HashMap<SessionId, Session>,
}

impl StoreState {
    fn request_mut(&mut self, id: RequestId) -> Option<&mut MatchRequest> {
        let index = *self.request_index.get(&id)?;
        self.requests.get_mut(index)
    }

    fn request(&self, id: RequestId) -> Option<&MatchRequest> {
        let index = *self.request_index.get(&id)?;
        self.requests.get(index)
    }

    fn push_request(&mut self, request: MatchRequest) {
        self.request_index.insert(request.id, self.requests.len());
        self.requests.push(request);
    }

    fn end_if_waiting(&mut self, session_id: Option<SessionId>, now: DateTime<Utc>) -> bool {
        let Some(session) = session_id.and_then(|id| self.sessions.get_mut(&id)) else {
            return false;
        };
        if session.status != SessionStatus::Waiting {
            return false;
        }
        session.status = SessionStatus::Ended;
        session.ended_at = Some(now);
        true
    }

    /// Flip a waiting session owned by `owner` to active with `joiner`
    fn activate(
        &mut self,
        session_id: SessionId,
        owner: &str,
        joiner: &str,
    ) -> StoreResult<Session> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .filter(|s| {
                s.status == SessionStatus::Waiting
                    && s.participant_a == owner
                    && s.participant_b.is_none()
            })
            .ok_or_else(|| StoreError::Transient {
                message: format!("session {} is no longer waiting for {}", session_id, owner),
            })?;
        session.participant_b = Some(joiner.to_string());
        session.status = SessionStatus::Active;
        Ok(session.clone())
    }
}

/// `MatchStore` backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryMatchStore {
    state: RwLock<StoreState>,
}

impl InMemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a request and (optionally) its session for tests
    pub fn preset(&self, request: MatchRequest, session: Option<Session>) -> StoreResult<()> {
        let mut state = self.write()?;
        if let Some(session) = session {
            state.sessions.insert(session.id, session);
        }
        state.push_request(request);
        Ok(())
    }

    /// Snapshot of every request, in insertion order
    pub fn all_requests(&self) -> StoreResult<Vec<MatchRequest>> {
        Ok(self.read()?.requests.clone())
    }

    /// Snapshot of every session
    pub fn all_sessions(&self) -> StoreResult<Vec<Session>> {
        Ok(self.read()?.sessions.values().cloned().collect())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|_| StoreError::backend("Failed to acquire store read lock"))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|_| StoreError::backend("Failed to acquire store write lock"))
    }
}

impl RequestStore for InMemoryMatchStore {
    fn insert_request(&self, request: MatchRequest) -> StoreResult<()> {
        self.write()?.push_request(request);
        Ok(())
    }

    fn get_request(&self, id: RequestId) -> StoreResult<Option<MatchRequest>> {
        Ok(self.read()?.request(id).cloned())
    }

    fn latest_request_for(&self, user_id: &str) -> StoreResult<Option<MatchRequest>> {
        let state = self.read()?;
        Ok(state
            .requests
            .iter()
            .filter(|r| r.requester_id == user_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    fn pending_candidates(
        &self,
        exclude_user: &str,
        limit: usize,
    ) -> StoreResult<Vec<MatchRequest>> {
        let state = self.read()?;
        let mut candidates: Vec<MatchRequest> = state
            .requests
            .iter()
            .filter(|r| r.status == RequestStatus::Pending && r.requester_id != exclude_user)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        candidates.sort_by_key(|r| r.created_at);
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn transition_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    ) -> StoreResult<bool> {
        let mut state = self.write()?;
        match state.request_mut(id) {
            Some(request) if request.status == from => {
                request.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn claim_candidate(&self, candidate: RequestId, caller: RequestId) -> StoreResult<bool> {
        let mut state = self.write()?;
        let caller_pending = state
            .request(caller)
            .is_some_and(|r| r.status == RequestStatus::Pending);
        if !caller_pending {
            return Ok(false);
        }
        match state.request_mut(candidate) {
            Some(request) if request.status == RequestStatus::Pending => {
                request.status = RequestStatus::Matching;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn open_requests_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<MatchRequest>> {
        let state = self.read()?;
        Ok(state
            .requests
            .iter()
            .filter(|r| r.status.is_open() && r.created_at < cutoff)
            .cloned()
            .collect())
    }

    fn matched_requests_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<MatchRequest>> {
        let state = self.read()?;
        Ok(state
            .requests
            .iter()
            .filter(|r| {
                r.status == RequestStatus::Matched && r.matched_at.is_some_and(|at| at < cutoff)
            })
            .cloned()
            .collect())
    }

    fn successful_matches(&self, user_id: &str) -> StoreResult<u32> {
        let state = self.read()?;
        let count = state
            .requests
            .iter()
            .filter(|r| r.requester_id == user_id && r.status == RequestStatus::Matched)
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn request_counts(&self) -> StoreResult<RequestCounts> {
        let state = self.read()?;
        let mut counts = RequestCounts::default();
        for request in &state.requests {
            counts.bump(request.status);
        }
        Ok(counts)
    }
}

impl SessionStore for InMemoryMatchStore {
    fn insert_session(&self, session: Session) -> StoreResult<()> {
        self.write()?.sessions.insert(session.id, session);
        Ok(())
    }

    fn get_session(&self, id: SessionId) -> StoreResult<Option<Session>> {
        Ok(self.read()?.sessions.get(&id).cloned())
    }

    fn open_session_for(&self, user_id: &str) -> StoreResult<Option<Session>> {
        let state = self.read()?;
        let mut open: Vec<&Session> = state
            .sessions
            .values()
            .filter(|s| s.is_open() && s.has_participant(user_id))
            .collect();
        // Active first, then most recent
        open.sort_by_key(|s| (s.status != SessionStatus::Active, std::cmp::Reverse(s.created_at)));
        Ok(open.first().map(|s| (*s).clone()))
    }

    fn active_sessions_created_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Session>> {
        let state = self.read()?;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.created_at < cutoff)
            .cloned()
            .collect())
    }

    fn count_sessions(&self, status: SessionStatus) -> StoreResult<u64> {
        let state = self.read()?;
        Ok(state.sessions.values().filter(|s| s.status == status).count() as u64)
    }
}

impl MatchStore for InMemoryMatchStore {
    fn open_request(&self, session: Session, request: MatchRequest) -> StoreResult<()> {
        let mut state = self.write()?;
        let user_id = &request.requester_id;

        let has_open_request = state
            .requests
            .iter()
            .any(|r| &r.requester_id == user_id && r.status.is_open());
        let has_open_session = state
            .sessions
            .values()
            .any(|s| s.is_open() && s.has_participant(user_id));
        if has_open_request || has_open_session {
            return Err(StoreError::Duplicate {
                user_id: user_id.clone(),
            });
        }

        state.sessions.insert(session.id, session);
        state.push_request(request);
        Ok(())
    }

    fn commit_pairing(&self, commit: &PairingCommit) -> StoreResult<Session> {
        let mut state = self.write()?;

        let caller_status = state.request(commit.caller_request).map(|r| r.status);
        if caller_status != Some(RequestStatus::Pending) {
            return Err(StoreError::TerminalConflict {
                message: format!(
                    "request {} is {:?}, expected pending",
                    commit.caller_request, caller_status
                ),
            });
        }
        let candidate_status = state.request(commit.candidate_request).map(|r| r.status);
        if candidate_status != Some(RequestStatus::Matching) {
            return Err(StoreError::RaceLost);
        }

        let session = match commit.resolution {
            SessionResolution::AttachToCandidate(id) => {
                state.activate(id, &commit.candidate_id, &commit.caller_id)?
            }
            SessionResolution::AttachToCaller(id) => {
                state.activate(id, &commit.caller_id, &commit.candidate_id)?
            }
            SessionResolution::CreateNew => {
                let session = Session::active(
                    commit.caller_id.clone(),
                    commit.candidate_id.clone(),
                    commit.now,
                );
                state.sessions.insert(session.id, session.clone());
                session
            }
        };

        for (request_id, peer) in [
            (commit.caller_request, &commit.candidate_id),
            (commit.candidate_request, &commit.caller_id),
        ] {
            if let Some(request) = state.request_mut(request_id) {
                request.status = RequestStatus::Matched;
                request.matched_at = Some(commit.now);
                request.matched_with_id = Some(peer.clone());
                request.session_id = Some(session.id);
            }
        }

        for superseded in &commit.superseded {
            state.end_if_waiting(Some(*superseded), commit.now);
        }

        Ok(session)
    }

    fn expire_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.write()?;
        let session_id = match state.request_mut(id) {
            Some(request) if request.status == from => {
                request.status = RequestStatus::Expired;
                request.session_id
            }
            _ => return Ok(false),
        };
        state.end_if_waiting(session_id, now);
        Ok(true)
    }

    fn cancel_pending(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.write()?;
        let mut linked = Vec::new();
        for request in state.requests.iter_mut() {
            if request.requester_id == user_id && request.status == RequestStatus::Pending {
                request.status = RequestStatus::Cancelled;
                linked.push(request.session_id);
            }
        }
        for session_id in &linked {
            state.end_if_waiting(*session_id, now);
        }
        Ok(linked.len())
    }

    fn end_session(&self, id: SessionId, now: DateTime<Utc>) -> StoreResult<Option<usize>> {
        let mut state = self.write()?;
        match state.sessions.get_mut(&id) {
            Some(session) if session.is_open() => {
                session.status = SessionStatus::Ended;
                session.ended_at = Some(now);
            }
            _ => return Ok(None),
        }

        let mut expired = 0;
        for request in state.requests.iter_mut() {
            if request.session_id == Some(id)
                && request.status.can_transition_to(RequestStatus::Expired)
            {
                request.status = RequestStatus::Expired;
                expired += 1;
            }
        }
        Ok(Some(expired))
    }
}

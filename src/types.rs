//! Common types used throughout the matchmaking service

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for users (resolved by the excluded auth layer)
pub type UserId = String;

/// Unique identifier for match requests
pub type RequestId = Uuid;

/// Unique identifier for sessions
pub type SessionId = Uuid;

/// Lifecycle state of a match request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Matching,
    Matched,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Matching => "matching",
            RequestStatus::Matched => "matched",
            RequestStatus::Expired => "expired",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    /// Whether `self -> next` is an edge of the request state machine
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Matching)
                | (Pending, Expired)
                | (Pending, Cancelled)
                | (Matching, Matched)
                | (Matching, Expired)
                | (Pending, Matched)
                | (Matched, Expired)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Expired | RequestStatus::Cancelled)
    }

    /// Still waiting for a partner (claimed or not)
    pub fn is_open(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::Matching)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "matching" => Ok(RequestStatus::Matching),
            "matched" => Ok(RequestStatus::Matched),
            "expired" => Ok(RequestStatus::Expired),
            "cancelled" => Ok(RequestStatus::Cancelled),
            other => Err(format!("unknown request status '{}'", other)),
        }
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(SessionStatus::Waiting),
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// A user's durable request to be paired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub id: RequestId,
    pub requester_id: UserId,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub matched_with_id: Option<UserId>,
    /// Waiting session while open, pairing session once matched
    pub session_id: Option<SessionId>,
}

impl MatchRequest {
    /// Create a new pending request linked to the requester's waiting session
    pub fn pending(
        requester_id: impl Into<UserId>,
        session_id: Option<SessionId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester_id: requester_id.into(),
            status: RequestStatus::Pending,
            created_at,
            matched_at: None,
            matched_with_id: None,
            session_id,
        }
    }

    /// Pending (or claimed) for longer than `ttl`
    pub fn is_stale_open(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.status.is_open() && now - self.created_at > ttl
    }

    /// Matched for longer than `ttl`
    pub fn is_stale_match(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.status == RequestStatus::Matched
            && self.matched_at.is_some_and(|matched_at| now - matched_at > ttl)
    }
}

/// A one-on-one pairing container (one-sided while waiting)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub participant_a: UserId,
    pub participant_b: Option<UserId>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A speculative session holding only its owner
    pub fn waiting(owner: impl Into<UserId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            participant_a: owner.into(),
            participant_b: None,
            status: SessionStatus::Waiting,
            created_at,
            ended_at: None,
        }
    }

    /// A session created directly between two users
    pub fn active(
        participant_a: impl Into<UserId>,
        participant_b: impl Into<UserId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            participant_a: participant_a.into(),
            participant_b: Some(participant_b.into()),
            status: SessionStatus::Active,
            created_at,
            ended_at: None,
        }
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_a == user_id || self.participant_b.as_deref() == Some(user_id)
    }

    /// The other participant, if there is one
    pub fn peer_of(&self, user_id: &str) -> Option<&UserId> {
        if self.participant_a == user_id {
            self.participant_b.as_ref()
        } else if self.participant_b.as_deref() == Some(user_id) {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    pub fn participants(&self) -> impl Iterator<Item = &UserId> {
        std::iter::once(&self.participant_a).chain(self.participant_b.iter())
    }

    pub fn is_open(&self) -> bool {
        self.status != SessionStatus::Ended
    }
}

/// Activity data consumed from the online-status feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub last_seen: Option<DateTime<Utc>>,
    /// Activity events in the last 7 days
    pub recent_activity_count: u32,
}

/// Result of `create_request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreateOutcome {
    Matched {
        request_id: RequestId,
        session_id: SessionId,
        peer_id: UserId,
    },
    Pending {
        request_id: RequestId,
        /// The request existed before this call
        already_waiting: bool,
    },
    Reconnect {
        session_id: SessionId,
        peer_id: Option<UserId>,
    },
}

impl CreateOutcome {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            CreateOutcome::Matched { session_id, .. } => Some(*session_id),
            CreateOutcome::Reconnect { session_id, .. } => Some(*session_id),
            CreateOutcome::Pending { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CreateOutcome::Matched { .. } => "matched",
            CreateOutcome::Pending { .. } => "pending",
            CreateOutcome::Reconnect { .. } => "reconnect",
        }
    }
}

/// A pending request another user may accept directly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableRequest {
    pub request_id: RequestId,
    pub requester_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl From<&MatchRequest> for AvailableRequest {
    fn from(request: &MatchRequest) -> Self {
        Self {
            request_id: request.id,
            requester_id: request.requester_id.clone(),
            created_at: request.created_at,
        }
    }
}

/// Result of `cancel_request`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub cancelled_count: usize,
}

impl CancelOutcome {
    /// The latest request had already left pending
    pub fn rejected(&self) -> bool {
        self.cancelled_count == 0
    }
}

/// Externally visible request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    Matched,
    Expired,
    Cancelled,
    NotFound,
}

impl From<RequestStatus> for MatchStatus {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Pending | RequestStatus::Matching => MatchStatus::Pending,
            RequestStatus::Matched => MatchStatus::Matched,
            RequestStatus::Expired => MatchStatus::Expired,
            RequestStatus::Cancelled => MatchStatus::Cancelled,
        }
    }
}

/// Result of `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: MatchStatus,
    pub request_id: Option<RequestId>,
    pub session_id: Option<SessionId>,
    pub peer_id: Option<UserId>,
}

impl StatusReport {
    pub fn not_found() -> Self {
        Self {
            status: MatchStatus::NotFound,
            request_id: None,
            session_id: None,
            peer_id: None,
        }
    }
}

/// Result of one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired_requests: usize,
    pub ended_sessions: usize,
    /// Items skipped because of an error
    pub failed_items: usize,
}

impl CleanupReport {
    pub fn merge(&mut self, other: CleanupReport) {
        self.expired_requests += other.expired_requests;
        self.ended_sessions += other.ended_sessions;
        self.failed_items += other.failed_items;
    }
}

/// Request counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub pending: u64,
    pub matching: u64,
    pub matched: u64,
    pub expired: u64,
    pub cancelled: u64,
}

impl RequestCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.matching + self.matched + self.expired + self.cancelled
    }

    pub fn bump(&mut self, status: RequestStatus) {
        match status {
            RequestStatus::Pending => self.pending += 1,
            RequestStatus::Matching => self.matching += 1,
            RequestStatus::Matched => self.matched += 1,
            RequestStatus::Expired => self.expired += 1,
            RequestStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Matching statistics for monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchingStats {
    pub counts: RequestCounts,
    pub active_sessions: u64,
    /// Percentage of all requests that are currently matched
    pub match_rate: f64,
}

impl MatchingStats {
    pub fn from_counts(counts: RequestCounts, active_sessions: u64) -> Self {
        let total = counts.total();
        let match_rate = if total > 0 {
            counts.matched as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            counts,
            active_sessions,
            match_rate,
        }
    }
}

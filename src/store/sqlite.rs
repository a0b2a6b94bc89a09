//! SQLite match store
//!
//! One connection per store instance; several instances (or processes) may
//! share the same database file. Conditional updates are single `UPDATE ...
//! WHERE status = ?` statements whose affected-row count is the result, and
//! multi-row units of work run inside `BEGIN IMMEDIATE` transactions.
//! `SQLITE_BUSY` / `SQLITE_LOCKED` surface as `StoreError::Transient`.

use super::{MatchStore, PairingCommit, RequestStore, SessionResolution, SessionStore};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    MatchRequest, RequestCounts, RequestId, RequestStatus, Session, SessionId, SessionStatus,
};
use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
  id TEXT PRIMARY KEY,
  participant_a TEXT NOT NULL,
  participant_b TEXT,
  status TEXT NOT NULL CHECK (status IN ('waiting', 'active', 'ended')),
  created_at INTEGER NOT NULL,
  ended_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sessions_participant_a ON sessions(participant_a, status);
CREATE INDEX IF NOT EXISTS idx_sessions_participant_b ON sessions(participant_b, status);

CREATE TABLE IF NOT EXISTS match_requests (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  requester_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (
    status IN ('pending', 'matching', 'matched', 'expired', 'cancelled')
  ),
  created_at INTEGER NOT NULL,
  matched_at INTEGER,
  matched_with_id TEXT,
  session_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_match_requests_status_created
  ON match_requests(status, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_match_requests_requester
  ON match_requests(requester_id, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_match_requests_session
  ON match_requests(session_id);
";

const REQUEST_COLUMNS: &str =
    "id, requester_id, status, created_at, matched_at, matched_with_id, session_id";

const SESSION_COLUMNS: &str = "id, participant_a, participant_b, status, created_at, ended_at";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Transient {
                    message: err.to_string(),
                }
            }
            _ => StoreError::backend(err.to_string()),
        }
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, micros))
}

fn parse_column<T: std::str::FromStr>(index: usize, raw: String) -> rusqlite::Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            err.to_string().into(),
        )
    })
}

fn parse_uuid(index: usize, raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<MatchRequest> {
    Ok(MatchRequest {
        id: parse_uuid(0, row.get(0)?)?,
        requester_id: row.get(1)?,
        status: parse_column(2, row.get::<_, String>(2)?)?,
        created_at: from_micros(row.get(3)?)?,
        matched_at: row.get::<_, Option<i64>>(4)?.map(from_micros).transpose()?,
        matched_with_id: row.get(5)?,
        session_id: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_uuid(6, raw))
            .transpose()?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: parse_uuid(0, row.get(0)?)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        status: parse_column(3, row.get::<_, String>(3)?)?,
        created_at: from_micros(row.get(4)?)?,
        ended_at: row.get::<_, Option<i64>>(5)?.map(from_micros).transpose()?,
    })
}

fn insert_request_on(conn: &Connection, request: &MatchRequest) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO match_requests
           (id, requester_id, status, created_at, matched_at, matched_with_id, session_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            request.id.to_string(),
            request.requester_id,
            request.status.as_str(),
            to_micros(request.created_at),
            request.matched_at.map(to_micros),
            request.matched_with_id,
            request.session_id.map(|id| id.to_string()),
        ],
    )?;
    Ok(())
}

fn insert_session_on(conn: &Connection, session: &Session) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sessions (id, participant_a, participant_b, status, created_at, ended_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            session.id.to_string(),
            session.participant_a,
            session.participant_b,
            session.status.as_str(),
            to_micros(session.created_at),
            session.ended_at.map(to_micros),
        ],
    )?;
    Ok(())
}

fn end_if_waiting_on(
    conn: &Connection,
    session_id: Option<SessionId>,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let Some(session_id) = session_id else {
        return Ok(false);
    };
    let changed = conn.execute(
        "UPDATE sessions SET status = 'ended', ended_at = ?2
         WHERE id = ?1 AND status = 'waiting'",
        params![session_id.to_string(), to_micros(now)],
    )?;
    Ok(changed == 1)
}

fn request_status_on(tx: &Transaction<'_>, id: RequestId) -> rusqlite::Result<Option<String>> {
    tx.query_row(
        "SELECT status FROM match_requests WHERE id = ?1",
        params![id.to_string()],
        |row| row.get(0),
    )
    .optional()
}

/// Flip a waiting session owned by `owner` to active with `joiner`
fn activate_on(
    tx: &Transaction<'_>,
    session_id: SessionId,
    owner: &str,
    joiner: &str,
) -> StoreResult<Session> {
    let changed = tx.execute(
        "UPDATE sessions SET status = 'active', participant_b = ?3
         WHERE id = ?1 AND participant_a = ?2 AND participant_b IS NULL AND status = 'waiting'",
        params![session_id.to_string(), owner, joiner],
    )?;
    if changed != 1 {
        return Err(StoreError::Transient {
            message: format!("session {} is no longer waiting for {}", session_id, owner),
        });
    }
    let session = tx.query_row(
        &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
        params![session_id.to_string()],
        session_from_row,
    )?;
    Ok(session)
}

/// `MatchStore` backed by a SQLite database file
pub struct SqliteMatchStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteMatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMatchStore").finish_non_exhaustive()
    }
}

impl SqliteMatchStore {
    /// Open (creating if needed) the database at `path` and apply the schema
    pub fn open(path: &Path, busy_timeout: Duration) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn, busy_timeout)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::configure(conn, Duration::from_millis(250))
    }

    fn configure(conn: Connection, busy_timeout: Duration) -> anyhow::Result<Self> {
        // journal_mode returns a row, so it cannot go through execute_batch
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("failed to enable WAL journal mode")?;
        debug!("SQLite journal mode: {}", mode);

        conn.busy_timeout(busy_timeout)
            .context("failed to configure sqlite busy timeout")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")
            .context("failed to configure sqlite pragmas")?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply heart-link schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::backend("Failed to acquire sqlite connection lock"))
    }

    fn query_requests(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<MatchRequest>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM match_requests WHERE {} ORDER BY created_at, seq",
            REQUEST_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, request_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn query_sessions(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<Session>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM sessions WHERE {} ORDER BY created_at",
            SESSION_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl RequestStore for SqliteMatchStore {
    fn insert_request(&self, request: MatchRequest) -> StoreResult<()> {
        let conn = self.lock()?;
        insert_request_on(&conn, &request)?;
        Ok(())
    }

    fn get_request(&self, id: RequestId) -> StoreResult<Option<MatchRequest>> {
        Ok(self
            .query_requests("id = ?1", params![id.to_string()])?
            .into_iter()
            .next())
    }

    fn latest_request_for(&self, user_id: &str) -> StoreResult<Option<MatchRequest>> {
        let conn = self.lock()?;
        let request = conn
            .query_row(
                &format!(
                    "SELECT {} FROM match_requests WHERE requester_id = ?1
                     ORDER BY created_at DESC, seq DESC LIMIT 1",
                    REQUEST_COLUMNS
                ),
                params![user_id],
                request_from_row,
            )
            .optional()?;
        Ok(request)
    }

    fn pending_candidates(
        &self,
        exclude_user: &str,
        limit: usize,
    ) -> StoreResult<Vec<MatchRequest>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM match_requests
             WHERE status = 'pending' AND requester_id != ?1
             ORDER BY created_at, seq LIMIT ?2",
            REQUEST_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![exclude_user, limit], request_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn transition_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    ) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE match_requests SET status = ?3 WHERE id = ?1 AND status = ?2",
            params![id.to_string(), from.as_str(), to.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn claim_candidate(&self, candidate: RequestId, caller: RequestId) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE match_requests SET status = 'matching'
             WHERE id = ?1 AND status = 'pending'
               AND EXISTS (SELECT 1 FROM match_requests WHERE id = ?2 AND status = 'pending')",
            params![candidate.to_string(), caller.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn open_requests_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<MatchRequest>> {
        self.query_requests(
            "status IN ('pending', 'matching') AND created_at < ?1",
            params![to_micros(cutoff)],
        )
    }

    fn matched_requests_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<MatchRequest>> {
        self.query_requests(
            "status = 'matched' AND matched_at IS NOT NULL AND matched_at < ?1",
            params![to_micros(cutoff)],
        )
    }

    fn successful_matches(&self, user_id: &str) -> StoreResult<u32> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM match_requests WHERE requester_id = ?1 AND status = 'matched'",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn request_counts(&self) -> StoreResult<RequestCounts> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM match_requests GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                let status: RequestStatus = parse_column(0, row.get::<_, String>(0)?)?;
                let count: i64 = row.get(1)?;
                Ok((status, count))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = RequestCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match status {
                RequestStatus::Pending => counts.pending = count,
                RequestStatus::Matching => counts.matching = count,
                RequestStatus::Matched => counts.matched = count,
                RequestStatus::Expired => counts.expired = count,
                RequestStatus::Cancelled => counts.cancelled = count,
            }
        }
        Ok(counts)
    }
}

impl SessionStore for SqliteMatchStore {
    fn insert_session(&self, session: Session) -> StoreResult<()> {
        let conn = self.lock()?;
        insert_session_on(&conn, &session)?;
        Ok(())
    }

    fn get_session(&self, id: SessionId) -> StoreResult<Option<Session>> {
        Ok(self
            .query_sessions("id = ?1", params![id.to_string()])?
            .into_iter()
            .next())
    }

    fn open_session_for(&self, user_id: &str) -> StoreResult<Option<Session>> {
        let conn = self.lock()?;
        let session = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sessions
                     WHERE status IN ('waiting', 'active')
                       AND (participant_a = ?1 OR participant_b = ?1)
                     ORDER BY CASE status WHEN 'active' THEN 0 ELSE 1 END, created_at DESC
                     LIMIT 1",
                    SESSION_COLUMNS
                ),
                params![user_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn active_sessions_created_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Session>> {
        self.query_sessions(
            "status = 'active' AND created_at < ?1",
            params![to_micros(cutoff)],
        )
    }

    fn count_sessions(&self, status: SessionStatus) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl MatchStore for SqliteMatchStore {
    fn open_request(&self, session: Session, request: MatchRequest) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let open: i64 = tx.query_row(
            "SELECT
               (SELECT COUNT(*) FROM match_requests
                 WHERE requester_id = ?1 AND status IN ('pending', 'matching'))
             + (SELECT COUNT(*) FROM sessions
                 WHERE status IN ('waiting', 'active')
                   AND (participant_a = ?1 OR participant_b = ?1))",
            params![request.requester_id],
            |row| row.get(0),
        )?;
        if open > 0 {
            return Err(StoreError::Duplicate {
                user_id: request.requester_id.clone(),
            });
        }

        insert_session_on(&tx, &session)?;
        insert_request_on(&tx, &request)?;
        tx.commit()?;
        Ok(())
    }

    fn commit_pairing(&self, commit: &PairingCommit) -> StoreResult<Session> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let caller_status = request_status_on(&tx, commit.caller_request)?;
        if caller_status.as_deref() != Some(RequestStatus::Pending.as_str()) {
            return Err(StoreError::TerminalConflict {
                message: format!(
                    "request {} is {:?}, expected pending",
                    commit.caller_request, caller_status
                ),
            });
        }
        let candidate_status = request_status_on(&tx, commit.candidate_request)?;
        if candidate_status.as_deref() != Some(RequestStatus::Matching.as_str()) {
            return Err(StoreError::RaceLost);
        }

        let session = match commit.resolution {
            SessionResolution::AttachToCandidate(id) => {
                activate_on(&tx, id, &commit.candidate_id, &commit.caller_id)?
            }
            SessionResolution::AttachToCaller(id) => {
                activate_on(&tx, id, &commit.caller_id, &commit.candidate_id)?
            }
            SessionResolution::CreateNew => {
                let session = Session::active(
                    commit.caller_id.clone(),
                    commit.candidate_id.clone(),
                    commit.now,
                );
                insert_session_on(&tx, &session)?;
                session
            }
        };

        for (request_id, from, peer) in [
            (
                commit.caller_request,
                RequestStatus::Pending,
                &commit.candidate_id,
            ),
            (
                commit.candidate_request,
                RequestStatus::Matching,
                &commit.caller_id,
            ),
        ] {
            tx.execute(
                "UPDATE match_requests
                 SET status = 'matched', matched_at = ?3, matched_with_id = ?4, session_id = ?5
                 WHERE id = ?1 AND status = ?2",
                params![
                    request_id.to_string(),
                    from.as_str(),
                    to_micros(commit.now),
                    peer,
                    session.id.to_string(),
                ],
            )?;
        }

        for superseded in &commit.superseded {
            end_if_waiting_on(&tx, Some(*superseded), commit.now)?;
        }

        tx.commit()?;
        Ok(session)
    }

    fn expire_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE match_requests SET status = 'expired' WHERE id = ?1 AND status = ?2",
            params![id.to_string(), from.as_str()],
        )?;
        if changed != 1 {
            return Ok(false);
        }

        let session_id: Option<String> = tx.query_row(
            "SELECT session_id FROM match_requests WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        let session_id = session_id.map(|raw| parse_uuid(0, raw)).transpose()?;
        end_if_waiting_on(&tx, session_id, now)?;

        tx.commit()?;
        Ok(true)
    }

    fn cancel_pending(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let now_micros = to_micros(now);
        tx.execute(
            "UPDATE sessions SET status = 'ended', ended_at = ?2
             WHERE status = 'waiting' AND id IN (
               SELECT session_id FROM match_requests
               WHERE requester_id = ?1 AND status = 'pending' AND session_id IS NOT NULL
             )",
            params![user_id, now_micros],
        )?;
        let cancelled = tx.execute(
            "UPDATE match_requests SET status = 'cancelled'
             WHERE requester_id = ?1 AND status = 'pending'",
            params![user_id],
        )?;

        tx.commit()?;
        Ok(cancelled)
    }

    fn end_session(&self, id: SessionId, now: DateTime<Utc>) -> StoreResult<Option<usize>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ended = tx.execute(
            "UPDATE sessions SET status = 'ended', ended_at = ?2
             WHERE id = ?1 AND status IN ('waiting', 'active')",
            params![id.to_string(), to_micros(now)],
        )?;
        if ended != 1 {
            return Ok(None);
        }

        let expired = tx.execute(
            "UPDATE match_requests SET status = 'expired'
             WHERE session_id = ?1 AND status IN ('pending', 'matching', 'matched')",
            params![id.to_string()],
        )?;

        tx.commit()?;
        Ok(Some(expired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn open_for(store: &SqliteMatchStore, user: &str, at: DateTime<Utc>) -> MatchRequest {
        let session = Session::waiting(user, at);
        let request = MatchRequest::pending(user, Some(session.id), at);
        store.open_request(session, request.clone()).unwrap();
        request
    }

    #[test]
    fn test_request_round_trips_through_sqlite() {
        let store = SqliteMatchStore::open_in_memory().unwrap();
        let now = Utc::now();
        let request = open_for(&store, "alice", now);

        let loaded = store.get_request(request.id).unwrap().unwrap();
        assert_eq!(loaded.requester_id, "alice");
        assert_eq!(loaded.status, RequestStatus::Pending);
        assert_eq!(loaded.created_at.timestamp_micros(), now.timestamp_micros());
        assert_eq!(loaded.session_id, request.session_id);
    }

    #[test]
    fn test_open_request_rejects_duplicates() {
        let store = SqliteMatchStore::open_in_memory().unwrap();
        let now = Utc::now();
        open_for(&store, "alice", now);

        let session = Session::waiting("alice", now);
        let request = MatchRequest::pending("alice", Some(session.id), now);
        assert!(matches!(
            store.open_request(session, request),
            Err(StoreError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_claim_and_commit() {
        let store = SqliteMatchStore::open_in_memory().unwrap();
        let now = Utc::now();
        let bob = open_for(&store, "bob", now - ChronoDuration::seconds(5));
        let alice = open_for(&store, "alice", now);

        let candidates = store.pending_candidates("alice", 10).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, bob.id);

        assert!(store.claim_candidate(bob.id, alice.id).unwrap());
        assert!(!store.claim_candidate(bob.id, alice.id).unwrap());

        let session = store
            .commit_pairing(&PairingCommit {
                caller_request: alice.id,
                caller_id: "alice".to_string(),
                candidate_request: bob.id,
                candidate_id: "bob".to_string(),
                resolution: SessionResolution::AttachToCandidate(bob.session_id.unwrap()),
                superseded: alice.session_id.into_iter().collect(),
                now,
            })
            .unwrap();

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.participant_a, "bob");
        assert_eq!(session.participant_b.as_deref(), Some("alice"));

        let bob_after = store.get_request(bob.id).unwrap().unwrap();
        assert_eq!(bob_after.status, RequestStatus::Matched);
        assert_eq!(bob_after.matched_with_id.as_deref(), Some("alice"));
        assert_eq!(store.successful_matches("bob").unwrap(), 1);

        let open = store.open_session_for("alice").unwrap().unwrap();
        assert_eq!(open.id, session.id);
        assert_eq!(store.count_sessions(SessionStatus::Ended).unwrap(), 1);
    }

    #[test]
    fn test_commit_after_session_ended_loses_race() {
        let store = SqliteMatchStore::open_in_memory().unwrap();
        let now = Utc::now();
        let bob = open_for(&store, "bob", now);
        let alice = open_for(&store, "alice", now);
        assert!(store.claim_candidate(bob.id, alice.id).unwrap());
        store.end_session(bob.session_id.unwrap(), now).unwrap();
        // Ending the session expired bob's request, so the commit sees a lost race
        let result = store.commit_pairing(&PairingCommit {
            caller_request: alice.id,
            caller_id: "alice".to_string(),
            candidate_request: bob.id,
            candidate_id: "bob".to_string(),
            resolution: SessionResolution::AttachToCandidate(bob.session_id.unwrap()),
            superseded: Vec::new(),
            now,
        });
        assert_eq!(result.unwrap_err(), StoreError::RaceLost);
    }

    #[test]
    fn test_expire_request_ends_waiting_session() {
        let store = SqliteMatchStore::open_in_memory().unwrap();
        let now = Utc::now();
        let alice = open_for(&store, "alice", now);

        assert!(store
            .expire_request(alice.id, RequestStatus::Pending, now)
            .unwrap());
        assert!(!store
            .expire_request(alice.id, RequestStatus::Pending, now)
            .unwrap());
        assert!(store.open_session_for("alice").unwrap().is_none());
    }

    #[test]
    fn test_request_counts() {
        let store = SqliteMatchStore::open_in_memory().unwrap();
        let now = Utc::now();
        open_for(&store, "alice", now);
        open_for(&store, "bob", now);
        store.cancel_pending("bob", now).unwrap();

        let counts = store.request_counts().unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn test_busy_maps_to_transient() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db");
        let store = SqliteMatchStore::open(&path, Duration::from_millis(10)).unwrap();

        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let now = Utc::now();
        let session = Session::waiting("alice", now);
        let request = MatchRequest::pending("alice", Some(session.id), now);
        let err = store.open_request(session, request).unwrap_err();
        assert!(err.is_transient());

        blocker.execute_batch("ROLLBACK;").unwrap();
    }
}

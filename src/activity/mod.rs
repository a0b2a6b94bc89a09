//! Activity / online-status feed consumed by candidate scoring
//!
//! The feed is usually owned by another system. The engine reads it for
//! scoring and idle-session detection, and reports presence whenever a user
//! calls into it.

use crate::error::{MatchmakingError, Result};
use crate::types::{Activity, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Events older than this no longer count towards `recent_activity_count`
pub const ACTIVITY_WINDOW_DAYS: i64 = 7;

/// Source of last-seen timestamps and recent activity counts
#[async_trait]
pub trait ActivityFeed: Send + Sync {
    /// Activity for one user; unknown users have no activity
    async fn get_activity(&self, user_id: &str) -> Result<Activity>;

    /// Note that the user just called into the engine.
    ///
    /// Feeds fed by an external presence system can ignore this.
    async fn record_presence(&self, _user_id: &str, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct UserActivity {
    last_seen: Option<DateTime<Utc>>,
    /// Event timestamps, oldest first
    events: VecDeque<DateTime<Utc>>,
}

impl UserActivity {
    fn push_event(&mut self, at: DateTime<Utc>) {
        let index = self.events.partition_point(|e| *e <= at);
        self.events.insert(index, at);
    }

    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.events.front().is_some_and(|e| *e <= cutoff) {
            self.events.pop_front();
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> Activity {
        let cutoff = activity_cutoff(now);
        let recent = self.events.iter().filter(|e| **e > cutoff).count();
        Activity {
            last_seen: self.last_seen,
            recent_activity_count: u32::try_from(recent).unwrap_or(u32::MAX),
        }
    }
}

fn activity_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(ACTIVITY_WINDOW_DAYS)
}

/// Activity feed held in process memory
#[derive(Debug, Default)]
pub struct InMemoryActivityFeed {
    users: RwLock<HashMap<UserId, UserActivity>>,
}

impl InMemoryActivityFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a user was seen, counting it as one activity event
    pub fn record_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update(user_id, at, |entry| {
            entry.last_seen = Some(entry.last_seen.map_or(at, |seen| seen.max(at)));
            entry.push_event(at);
        })
    }

    /// Record an activity event without touching `last_seen`
    pub fn record_event(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update(user_id, at, |entry| entry.push_event(at))
    }

    /// Activity as of `now`
    pub fn activity_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<Activity> {
        let users = self
            .users
            .read()
            .map_err(|_| MatchmakingError::InternalError {
                message: "Failed to acquire activity read lock".to_string(),
            })?;
        Ok(users
            .get(user_id)
            .map(|entry| entry.snapshot(now))
            .unwrap_or_default())
    }

    fn update(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        apply: impl FnOnce(&mut UserActivity),
    ) -> Result<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| MatchmakingError::InternalError {
                message: "Failed to acquire activity write lock".to_string(),
            })?;
        let entry = users.entry(user_id.to_string()).or_default();
        apply(entry);
        // Keep memory bounded by the window of the newest write
        entry.prune(activity_cutoff(at.max(Utc::now())));
        Ok(())
    }
}

#[async_trait]
impl ActivityFeed for InMemoryActivityFeed {
    async fn get_activity(&self, user_id: &str) -> Result<Activity> {
        self.activity_at(user_id, Utc::now())
    }

    async fn record_presence(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.record_seen(user_id, at)
    }
}

//! Candidate scoring
//!
//! Scores reward recent presence, recent activity and a track record of
//! successful pairings. A small random jitter keeps equally-scored candidates
//! from always resolving in the same order.

use crate::types::Activity;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Starting score of every candidate
pub const BASE_SCORE: i64 = 100;
/// Bonus for being seen within the last 5 minutes
pub const ONLINE_BONUS: i64 = 50;
/// Bonus for being seen within the last 10 minutes
pub const RECENTLY_ONLINE_BONUS: i64 = 25;
/// Points per activity event in the last 7 days
pub const ACTIVITY_POINTS: i64 = 5;
pub const ACTIVITY_CAP: i64 = 50;
/// Points per prior successful match
pub const MATCH_HISTORY_POINTS: i64 = 10;
pub const MATCH_HISTORY_CAP: i64 = 30;

/// Inputs to a candidate's score
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreFactors {
    pub last_seen: Option<DateTime<Utc>>,
    pub recent_activity_count: u32,
    pub successful_matches: u32,
}

impl ScoreFactors {
    pub fn new(activity: Activity, successful_matches: u32) -> Self {
        Self {
            last_seen: activity.last_seen,
            recent_activity_count: activity.recent_activity_count,
            successful_matches,
        }
    }
}

/// Scores candidates; deterministic apart from the jitter term
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    jitter: i64,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(20)
    }
}

impl ScoringEngine {
    /// Jitter is drawn from `[-jitter, jitter]`; 0 disables it
    pub fn new(jitter: i64) -> Self {
        Self {
            jitter: jitter.max(0),
        }
    }

    pub fn jitter(&self) -> i64 {
        self.jitter
    }

    /// Score without jitter
    pub fn base_score(&self, factors: &ScoreFactors, now: DateTime<Utc>) -> i64 {
        let mut score = BASE_SCORE;

        // Presence bonus; a last_seen in the future counts as online
        if let Some(last_seen) = factors.last_seen {
            let idle = now - last_seen;
            if idle < Duration::minutes(5) {
                score += ONLINE_BONUS;
            } else if idle < Duration::minutes(10) {
                score += RECENTLY_ONLINE_BONUS;
            }
        }

        score += (i64::from(factors.recent_activity_count) * ACTIVITY_POINTS).min(ACTIVITY_CAP);
        score += (i64::from(factors.successful_matches) * MATCH_HISTORY_POINTS)
            .min(MATCH_HISTORY_CAP);

        score
    }

    /// Score with jitter applied
    pub fn score(&self, factors: &ScoreFactors, now: DateTime<Utc>) -> i64 {
        self.base_score(factors, now) + self.sample_jitter()
    }

    fn sample_jitter(&self) -> i64 {
        if self.jitter == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(-self.jitter..=self.jitter)
    }
}

/// Reorder the first `window` items by descending score, keeping the rest FIFO.
///
/// `scores` holds one score per windowed item; ties keep their original order.
pub fn reorder_window<T>(items: Vec<T>, scores: &[i64], window: usize) -> Vec<T> {
    let window = window.min(items.len()).min(scores.len());
    let mut items = items;
    let tail = items.split_off(window);

    let mut head: Vec<(i64, T)> = scores.iter().copied().zip(items).collect();
    head.sort_by(|a, b| b.0.cmp(&a.0));

    head.into_iter().map(|(_, item)| item).chain(tail).collect()
}

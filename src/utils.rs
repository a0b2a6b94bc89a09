//! Utility functions for the matchmaking service

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Generate a new unique session ID
pub fn generate_session_id() -> Uuid {
    Uuid::new_v4()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a std duration into a chrono duration, capped at a century
pub fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::weeks(52 * 100))
}

/// Whether the user id is usable at all
pub fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique_ids() {
        let id1 = generate_session_id();
        let id2 = generate_session_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_to_chrono() {
        assert_eq!(
            to_chrono(std::time::Duration::from_secs(600)),
            Duration::minutes(10)
        );
    }

    #[test]
    fn test_user_id_validation() {
        assert!(is_valid_user_id("alice"));
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id("   "));
    }
}

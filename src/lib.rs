//! Heart Link - pairwise matchmaking engine
//!
//! This crate pairs users who ask to be matched into private two-party
//! sessions. Requests move through a guarded claim and an atomic commit so
//! that no user is ever paired twice, and an expiry reaper cleans up
//! abandoned requests and idle sessions.

pub mod activity;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod matching;
pub mod metrics;
pub mod reaper;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, Result, StoreError};
pub use types::*;

// Re-export key components
pub use activity::{ActivityFeed, InMemoryActivityFeed};
pub use lifecycle::RequestLifecycleManager;
pub use store::{InMemoryMatchStore, MatchStore, SqliteMatchStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Expiry reaper: TTL sweeps and the periodic task that runs them

pub mod sweeper;
pub mod task;

pub use sweeper::{ExpiryReaper, ReaperConfig};
pub use task::ReaperTask;

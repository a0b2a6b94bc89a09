//! Configuration management for the heart-link service
//!
//! This module handles configuration loading from environment variables and
//! TOML files, validation, and default values for the matchmaking service.

pub mod app;

// Re-export commonly used types
pub use app::{
    validate_config, AppConfig, MatchingSettings, ReaperSettings, ServiceSettings, StoreBackend,
    StoreSettings,
};

//! Public request lifecycle operations

pub mod manager;

pub use manager::RequestLifecycleManager;

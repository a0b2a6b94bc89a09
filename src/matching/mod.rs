//! Candidate scoring and the pairing protocol

pub mod matcher;
pub mod scoring;

pub use matcher::{AttemptOutcome, Matcher, MatcherConfig};
pub use scoring::{ScoreFactors, ScoringEngine};

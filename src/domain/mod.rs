//! Domain types for Akari
//!
//! - Candidate / Engagement / ScoredCandidate: the posts flowing through the pipeline
//! - ComposeRequest / ComposeAttemptResult / Artifact: the composer boundary

pub mod candidate;
pub mod outcome;

pub use candidate::{Candidate, Engagement, ScoredCandidate};
pub use outcome::{Artifact, ComposeAttemptResult, ComposeRequest};

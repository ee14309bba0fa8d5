//! Candidate scoring and selection.

mod scorer;

pub use scorer::{
    DECAY_WINDOW_SECS, ELIGIBILITY_MULTIPLIER, PEAK_MULTIPLIER, QUALITY_PENALTY, QUALITY_THRESHOLD, Scorer,
    ScoringConfig, follower_median,
};

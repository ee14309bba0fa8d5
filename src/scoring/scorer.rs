//! Candidate ranking.
//!
//! Candidates are ranked by:
//! - Eligibility: the author needs at least `eligibility_multiplier` times
//!   the batch's median follower count (and more than zero followers)
//! - Engagement per follower: weighted favorites + reposts over followers
//! - Freshness: a decay multiplier falling linearly from `peak_multiplier`
//!   at age 0 to 1.0 at `decay_window_secs`
//! - Quality: text that is mostly non-Latin is divided by `quality_penalty`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Candidate, ScoredCandidate};
use crate::text::latin_ratio;

/// Author must have this many times the median follower count.
pub const ELIGIBILITY_MULTIPLIER: f64 = 1.5;
/// Freshness bonus fades out over 20 minutes.
pub const DECAY_WINDOW_SECS: f64 = 20.0 * 60.0;
/// Multiplier applied to a brand-new post.
pub const PEAK_MULTIPLIER: f64 = 3.0;
/// Minimum share of Latin letters before the penalty kicks in.
pub const QUALITY_THRESHOLD: f64 = 0.75;
/// Divisor for low-quality text.
pub const QUALITY_PENALTY: f64 = 10.0;

/// Scoring knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub eligibility_multiplier: f64,
    pub decay_window_secs: f64,
    pub peak_multiplier: f64,
    pub favorite_weight: f64,
    pub repost_weight: f64,
    pub quality_threshold: f64,
    pub quality_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            eligibility_multiplier: ELIGIBILITY_MULTIPLIER,
            decay_window_secs: DECAY_WINDOW_SECS,
            peak_multiplier: PEAK_MULTIPLIER,
            favorite_weight: 1.0,
            repost_weight: 1.0,
            quality_threshold: QUALITY_THRESHOLD,
            quality_penalty: QUALITY_PENALTY,
        }
    }
}

/// Median of the follower counts; mean of the middle pair for even lengths.
pub fn follower_median(candidates: &[Candidate]) -> Option<f64> {
    if candidates.is_empty() {
        return None;
    }
    let mut counts: Vec<u64> = candidates.iter().map(|c| c.engagement.follower_count).collect();
    counts.sort_unstable();

    let mid = counts.len() / 2;
    let median = if counts.len() % 2 == 0 {
        (counts[mid - 1] as f64 + counts[mid] as f64) / 2.0
    } else {
        counts[mid] as f64
    };
    Some(median)
}

/// Pure ranking function over a batch of candidates.
#[derive(Debug, Clone, Default)]
pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Freshness multiplier for a post `age_secs` old.
    pub fn decay(&self, age_secs: f64) -> f64 {
        let window = self.config.decay_window_secs;
        if window <= 0.0 {
            return 1.0;
        }
        let fresh = (window - age_secs.max(0.0)).max(0.0);
        1.0 + fresh * (self.config.peak_multiplier - 1.0) / window
    }

    /// Score one candidate against a precomputed median.
    ///
    /// Returns `None` when the candidate is ineligible.
    pub fn score_one(&self, candidate: &Candidate, median: f64, now: DateTime<Utc>) -> Option<f64> {
        let followers = candidate.engagement.follower_count as f64;
        if candidate.engagement.follower_count == 0 || followers < median * self.config.eligibility_multiplier {
            return None;
        }

        let engagement = candidate.engagement.favorites as f64 * self.config.favorite_weight
            + candidate.engagement.reposts as f64 * self.config.repost_weight;
        let mut score = self.decay(candidate.age_secs(now)) * engagement / followers;

        if latin_ratio(&candidate.cleaned_text) < self.config.quality_threshold {
            score /= self.config.quality_penalty;
        }

        Some(score)
    }

    /// Rank eligible candidates, best first.
    ///
    /// Ties keep their input order. Ineligible candidates are dropped, so an
    /// empty result means there is nothing worth acting on.
    pub fn score(&self, candidates: &[Candidate], now: DateTime<Utc>) -> Vec<ScoredCandidate> {
        let Some(median) = follower_median(candidates) else {
            return Vec::new();
        };

        let mut ranked: Vec<ScoredCandidate> = candidates
            .iter()
            .filter_map(|candidate| {
                let score = self.score_one(candidate, median, now);
                if score.is_none() {
                    log::debug!(
                        "Candidate {} ineligible ({} followers, median {})",
                        candidate.id,
                        candidate.engagement.follower_count,
                        median
                    );
                }
                score.map(|score| ScoredCandidate {
                    candidate: candidate.clone(),
                    score,
                })
            })
            .collect();

        // sort_by is stable
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }
}

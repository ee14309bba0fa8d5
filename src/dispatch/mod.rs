//! Driving candidates and requests through compose and post.
//!
//! - [`Dispatcher`]: the scheduled cycle over the candidate queue
//! - [`RequestHandler`]: one interactive request, answered with an image or
//!   a fallback message
//! - [`WorkerPool`]: keeps request handling off the listener

mod dispatcher;
mod request;
mod worker;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use dispatcher::{CycleReport, Dispatcher};
pub use request::{Blacklist, RateLimitTier, Reply, RequestHandler, RequestsConfig};
pub use worker::WorkerPool;

/// When the queue gives up its candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Read at cycle start, clear only after a successful post
    #[default]
    OnSuccess,
    /// Drain at cycle start; a missed cycle loses the batch
    AtCycleStart,
}

/// What a denied global rate-limit check does to the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStopPolicy {
    #[default]
    StopCycle,
    SkipCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub drain_policy: DrainPolicy,
    pub rate_limit_stop: RateLimitStopPolicy,
    /// Global gate: consulted before each candidate, one unit counted per post
    pub rate_limit_scope: String,
    pub rate_limit_identity: String,
    pub rate_limit_max: u32,
    pub rate_limit_ttl_secs: u64,
    /// Candidates composed concurrently; 1 is strictly sequential
    pub fan_out: usize,
    /// Pause between cycles for `run`
    pub cycle_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            drain_policy: DrainPolicy::OnSuccess,
            rate_limit_stop: RateLimitStopPolicy::StopCycle,
            rate_limit_scope: "timeline".to_string(),
            rate_limit_identity: "global".to_string(),
            rate_limit_max: 4,
            rate_limit_ttl_secs: 3600,
            fan_out: 1,
            cycle_interval_secs: 900,
        }
    }
}

impl DispatchConfig {
    pub fn rate_limit_ttl(&self) -> Duration {
        Duration::from_secs(self.rate_limit_ttl_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.drain_policy, DrainPolicy::OnSuccess);
        assert_eq!(config.rate_limit_stop, RateLimitStopPolicy::StopCycle);
        assert_eq!(config.fan_out, 1);
        assert_eq!(config.rate_limit_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn test_policies_deserialize() {
        let yaml = "drain_policy: at_cycle_start\nrate_limit_stop: skip_candidate\nfan_out: 3\n";
        let config: DispatchConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.drain_policy, DrainPolicy::AtCycleStart);
        assert_eq!(config.rate_limit_stop, RateLimitStopPolicy::SkipCandidate);
        assert_eq!(config.fan_out, 3);
        assert_eq!(config.rate_limit_scope, "timeline");
    }
}

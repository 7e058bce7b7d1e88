//! In-container ballast: output parsing, the shrink step, and the policy knobs.

pub mod adjuster;
pub mod parse;

use serde::Serialize;

use crate::core::config::BallastConfig;
use crate::core::size::StorageSize;

/// Ballast placement and shrink policy, resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BallastPolicy {
    /// Absolute path of the ballast file inside the container.
    pub path: String,
    /// Size allocated when a container is created.
    pub margin: StorageSize,
    /// Released per stop while headroom is low.
    pub shrink_step: StorageSize,
    /// Shrink when `capacity - used` in whole GB is at or below this.
    pub headroom_trigger_gb: u64,
}

impl BallastPolicy {
    #[must_use]
    pub fn from_config(config: &BallastConfig) -> Self {
        Self {
            path: config.path.clone(),
            margin: StorageSize::from_bytes(config.margin_bytes),
            shrink_step: StorageSize::from_bytes(config.shrink_step_bytes),
            headroom_trigger_gb: config.headroom_trigger_gb,
        }
    }

    /// Headroom in whole GB; negative when usage exceeds the recorded capacity.
    #[must_use]
    pub fn headroom_gb(capacity_gb: u64, used_gb: i64) -> i64 {
        i64::try_from(capacity_gb).unwrap_or(i64::MAX).saturating_sub(used_gb)
    }

    /// Whether a stop observing `headroom_gb` should shrink the ballast.
    #[must_use]
    pub fn should_shrink(&self, headroom_gb: i64) -> bool {
        headroom_gb <= i64::try_from(self.headroom_trigger_gb).unwrap_or(i64::MAX)
    }
}

impl Default for BallastPolicy {
    fn default() -> Self {
        Self::from_config(&BallastConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_config_defaults() {
        let policy = BallastPolicy::default();
        assert_eq!(policy.path, "/ballast");
        assert_eq!(policy.margin.bytes(), 5_000_000_000);
        assert_eq!(policy.shrink_step.bytes(), 500_000_000);
        assert_eq!(policy.headroom_trigger_gb, 1);
    }

    #[test]
    fn trigger_is_inclusive() {
        let policy = BallastPolicy::default();
        assert!(policy.should_shrink(BallastPolicy::headroom_gb(25, 24)));
        assert!(policy.should_shrink(BallastPolicy::headroom_gb(25, 25)));
        assert!(policy.should_shrink(BallastPolicy::headroom_gb(25, 30)));
        assert!(!policy.should_shrink(BallastPolicy::headroom_gb(25, 23)));
        assert!(!policy.should_shrink(BallastPolicy::headroom_gb(25, 20)));
    }
}

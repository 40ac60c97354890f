//! Action pacing and rate-limit backoff.
//!
//! Between actions the governor sleeps for a randomized interval so
//! the action cadence never forms a fixed pattern. When the surface
//! signals a rate limit, the cooldown doubles on each consecutive
//! signal up to a cap, and resets after the next successful action.

use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use flock_common::config::EngineConfig;

/// Maximum cooldown multiplier under repeated rate-limit signals.
const MAX_BACKOFF_MULTIPLIER: u32 = 8;

/// Paces actions and backs off on rate-limit signals.
#[derive(Debug)]
pub struct RateGovernor {
    min_delay_secs: u64,
    max_delay_secs: u64,
    cooldown_base_secs: u64,
    backoff_multiplier: u32,
}

impl RateGovernor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            min_delay_secs: config.min_action_delay_secs.min(config.max_action_delay_secs),
            max_delay_secs: config.max_action_delay_secs.max(config.min_action_delay_secs),
            cooldown_base_secs: config.rate_limit_cooldown_secs,
            backoff_multiplier: 1,
        }
    }

    /// A randomized inter-action delay in `[min, max]`.
    pub fn next_delay(&self) -> Duration {
        let secs = if self.min_delay_secs == self.max_delay_secs {
            self.min_delay_secs
        } else {
            rand::thread_rng().gen_range(self.min_delay_secs..=self.max_delay_secs)
        };
        Duration::from_secs(secs)
    }

    /// The current cooldown, scaled by the backoff multiplier.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_base_secs * u64::from(self.backoff_multiplier))
    }

    /// Record a rate-limit signal, doubling the cooldown up to the cap.
    pub fn record_rate_limit(&mut self) {
        self.backoff_multiplier = (self.backoff_multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
        warn!(
            multiplier = self.backoff_multiplier,
            cooldown_secs = self.cooldown().as_secs(),
            "Rate limit signaled, backing off"
        );
    }

    /// Record a successful action, resetting the backoff.
    pub fn record_success(&mut self) {
        if self.backoff_multiplier > 1 {
            debug!("Rate limit backoff reset");
        }
        self.backoff_multiplier = 1;
    }

    pub fn backoff_multiplier(&self) -> u32 {
        self.backoff_multiplier
    }

    /// Sleep for a randomized inter-action delay.
    pub async fn wait_between_actions(&self) {
        let delay = self.next_delay();
        debug!(delay_secs = delay.as_secs(), "Pacing delay");
        tokio::time::sleep(delay).await;
    }

    /// Sleep for the current cooldown.
    pub async fn wait_cooldown(&self) {
        tokio::time::sleep(self.cooldown()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(min: u64, max: u64, cooldown: u64) -> RateGovernor {
        let config = EngineConfig {
            min_action_delay_secs: min,
            max_action_delay_secs: max,
            rate_limit_cooldown_secs: cooldown,
            ..Default::default()
        };
        RateGovernor::new(&config)
    }

    #[test]
    fn test_delay_within_bounds() {
        let governor = governor(30, 90, 300);
        for _ in 0..50 {
            let delay = governor.next_delay().as_secs();
            assert!((30..=90).contains(&delay));
        }
    }

    #[test]
    fn test_equal_bounds_deterministic() {
        let governor = governor(45, 45, 300);
        assert_eq!(governor.next_delay(), Duration::from_secs(45));
    }

    #[test]
    fn test_inverted_bounds_normalized() {
        let governor = governor(90, 30, 300);
        let delay = governor.next_delay().as_secs();
        assert!((30..=90).contains(&delay));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut governor = governor(30, 90, 300);
        assert_eq!(governor.cooldown(), Duration::from_secs(300));

        governor.record_rate_limit();
        assert_eq!(governor.cooldown(), Duration::from_secs(600));
        governor.record_rate_limit();
        assert_eq!(governor.cooldown(), Duration::from_secs(1200));
        governor.record_rate_limit();
        assert_eq!(governor.cooldown(), Duration::from_secs(2400));
        // Capped at 8x
        governor.record_rate_limit();
        assert_eq!(governor.backoff_multiplier(), 8);
        assert_eq!(governor.cooldown(), Duration::from_secs(2400));
    }

    #[test]
    fn test_success_resets_backoff() {
        let mut governor = governor(30, 90, 300);
        governor.record_rate_limit();
        governor.record_rate_limit();
        governor.record_success();
        assert_eq!(governor.backoff_multiplier(), 1);
        assert_eq!(governor.cooldown(), Duration::from_secs(300));
    }
}

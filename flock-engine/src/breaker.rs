//! Consecutive-failure circuit breaker.
//!
//! The breaker counts consecutive action failures and trips once the
//! count reaches the configured threshold. Any success resets the
//! count to zero, so isolated failures never accumulate into a trip.

use std::collections::VecDeque;
use tracing::warn;

use flock_common::EngineError;

/// How many recent failure messages to retain for diagnostics.
const RETAINED_FAILURES: usize = 10;

/// Trips after N consecutive failures.
#[derive(Debug)]
pub struct FailureBreaker {
    threshold: u32,
    consecutive: u32,
    recent: VecDeque<String>,
}

impl FailureBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            recent: VecDeque::with_capacity(RETAINED_FAILURES),
        }
    }

    /// Record a failure. Returns true if this failure tripped the
    /// breaker.
    pub fn record_failure(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.consecutive += 1;

        if self.recent.len() == RETAINED_FAILURES {
            self.recent.pop_front();
        }
        self.recent.push_back(message);

        if self.is_tripped() {
            warn!(
                consecutive = self.consecutive,
                threshold = self.threshold,
                "Circuit breaker tripped"
            );
            true
        } else {
            false
        }
    }

    /// Record a success, resetting the consecutive counter.
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn is_tripped(&self) -> bool {
        self.consecutive >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    /// Recent failure messages, oldest first.
    pub fn failures(&self) -> Vec<String> {
        self.recent.iter().cloned().collect()
    }

    /// The error describing the trip state.
    pub fn trip_error(&self) -> EngineError {
        EngineError::CircuitBreakerTrip {
            count: self.consecutive,
            failures: self.failures(),
        }
    }
}

//! Error types for the Flock engine.

use thiserror::Error;

/// Result type alias using the engine error type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Unified error type for engine operations.
///
/// Rate limiting is deliberately absent here: a rate-limit signal from
/// the action surface is a pacing event handled by the rate governor,
/// not a failure surfaced to callers.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Surface not ready or not authenticated; aborts before any writes
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A single action failed; recorded and counted toward the breaker
    #[error("Action failed for {username}: {message}")]
    ActionFailed { username: String, message: String },

    /// Consecutive-failure threshold exceeded; the run stops
    #[error("Circuit breaker tripped after {count} consecutive failures")]
    CircuitBreakerTrip {
        count: u32,
        /// Most recent error messages, oldest first
        failures: Vec<String>,
    },

    /// Persistence failure; in-flight item state is unknown to the caller
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// Invalid input or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// Create a precondition failure.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Check if this error aborted the run before any writes.
    pub const fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }

    /// Check if this is a breaker trip.
    pub const fn is_breaker_trip(&self) -> bool {
        matches!(self, Self::CircuitBreakerTrip { .. })
    }

    /// Check if the caller should resume via the session manager
    /// rather than retry blindly.
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(EngineError::precondition("not logged in").is_precondition());
        assert!(EngineError::CircuitBreakerTrip {
            count: 5,
            failures: vec![],
        }
        .is_breaker_trip());
        assert!(EngineError::Storage(anyhow::anyhow!("db locked")).is_storage());
        assert!(!EngineError::NotFound("x".into()).is_precondition());
    }

    #[test]
    fn test_display() {
        let err = EngineError::ActionFailed {
            username: "alice".into(),
            message: "button not found".into(),
        };
        assert_eq!(err.to_string(), "Action failed for alice: button not found");
    }
}

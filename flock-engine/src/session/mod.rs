//! Checkpointed batch sessions.
//!
//! A session wraps a batch operation over an enumerated list of
//! usernames. Every item's status is persisted as it is processed, so
//! an interrupted batch resumes from exactly the items that were still
//! pending; a resumed run is behaviorally indistinguishable from one
//! that ran start-to-finish without interruption.
//!
//! # Database Schema
//!
//! Two tables back this module:
//! - `sessions`: one row per batch with aggregate counters
//! - `session_items`: one row per work item with its terminal status

pub mod manager;
pub mod store;

pub use manager::SessionManager;
pub use store::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Session lifecycle status. InProgress transitions to Completed
/// exactly once and is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
}

impl SessionStatus {
    /// Convert to database string
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    /// Parse from database string
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Work item status. Starts Pending and transitions exactly once to a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl ItemStatus {
    /// Convert to database string
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parse from database string
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Check whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One batch session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Batch kind, e.g. "batch_unfollow" or "auto_follow"
    pub kind: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_count: u32,
    pub success_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    pub metadata: HashMap<String, String>,
}

impl Session {
    /// Items not yet in a terminal state.
    pub fn remaining(&self) -> u32 {
        self.total_count
            .saturating_sub(self.success_count + self.failed_count + self.skipped_count)
    }
}

/// One work item within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionItem {
    pub session_id: String,
    pub username: String,
    pub status: ItemStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_db_roundtrip() {
        for status in [SessionStatus::InProgress, SessionStatus::Completed] {
            assert_eq!(
                SessionStatus::from_db_string(status.to_db_string()),
                Some(status)
            );
        }
        for status in [
            ItemStatus::Pending,
            ItemStatus::Success,
            ItemStatus::Failed,
            ItemStatus::Skipped,
        ] {
            assert_eq!(
                ItemStatus::from_db_string(status.to_db_string()),
                Some(status)
            );
        }
    }

    #[test]
    fn test_item_status_terminal() {
        assert!(!ItemStatus::Pending.is_terminal());
        assert!(ItemStatus::Success.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(ItemStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_session_remaining() {
        let session = Session {
            id: "s1".into(),
            kind: "batch_unfollow".into(),
            status: SessionStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            total_count: 10,
            success_count: 3,
            failed_count: 1,
            skipped_count: 2,
            metadata: HashMap::new(),
        };
        assert_eq!(session.remaining(), 4);
    }
}

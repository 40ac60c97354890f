//! Session lifecycle management on top of [`SessionStore`].
//!
//! The manager's main job is crash recovery: `get_or_resume` returns
//! the newest in-progress session of a kind instead of starting a new
//! one, so an interrupted batch picks up where it left off.

use anyhow::Result;
use std::collections::HashMap;
use tracing::info;

use super::store::SessionStore;
use super::Session;

/// High-level API for creating and resuming batch sessions.
#[derive(Clone)]
pub struct SessionManager {
    store: SessionStore,
}

impl SessionManager {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    /// Start a new session over the given usernames.
    pub fn create(
        &self,
        kind: &str,
        items: &[String],
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<Session> {
        let id = self.store.create_session(kind, items, metadata)?;
        let session = self
            .store
            .get_session(&id)?
            .ok_or_else(|| anyhow::anyhow!("Session {} vanished after creation", id))?;

        info!(
            session_id = %session.id,
            kind = %kind,
            total = session.total_count,
            "Session started"
        );
        Ok(session)
    }

    /// Resume the newest in-progress session of this kind, or create a
    /// new one from `items` if none exists. Returns the session and
    /// whether it was resumed.
    pub fn get_or_resume(
        &self,
        kind: &str,
        items: &[String],
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(Session, bool)> {
        if let Some(session) = self.store.get_pending_session(kind)? {
            info!(
                session_id = %session.id,
                kind = %kind,
                remaining = session.remaining(),
                "Resuming interrupted session"
            );
            return Ok((session, true));
        }

        Ok((self.create(kind, items, metadata)?, false))
    }

    /// Usernames still pending in a session.
    pub fn pending_items(&self, session_id: &str) -> Result<Vec<String>> {
        self.store.pending_items(session_id)
    }

    /// Mark the session completed.
    pub fn complete(&self, session_id: &str) -> Result<()> {
        self.store.complete_session(session_id)?;
        info!(session_id = %session_id, "Session completed");
        Ok(())
    }

    /// Access to the underlying store for item updates.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ItemStatus;
    use crate::store::Database;

    fn manager() -> SessionManager {
        SessionManager::new(Database::in_memory().unwrap().sessions())
    }

    fn users(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_then_resume() {
        let manager = manager();

        let (session, resumed) = manager
            .get_or_resume("batch_unfollow", &users(&["u1", "u2"]), None)
            .unwrap();
        assert!(!resumed);

        manager
            .store()
            .update_item(&session.id, "u1", ItemStatus::Success, None)
            .unwrap();

        // A second call resumes the same session rather than creating
        // a new one, and the new item list is ignored.
        let (resumed_session, resumed) = manager
            .get_or_resume("batch_unfollow", &users(&["other"]), None)
            .unwrap();
        assert!(resumed);
        assert_eq!(resumed_session.id, session.id);
        assert_eq!(
            manager.pending_items(&session.id).unwrap(),
            users(&["u2"])
        );
    }

    #[test]
    fn test_completed_session_not_resumed() {
        let manager = manager();

        let (session, _) = manager
            .get_or_resume("batch_follow", &users(&["u1"]), None)
            .unwrap();
        manager
            .store()
            .update_item(&session.id, "u1", ItemStatus::Success, None)
            .unwrap();
        manager.complete(&session.id).unwrap();

        let (fresh, resumed) = manager
            .get_or_resume("batch_follow", &users(&["u2"]), None)
            .unwrap();
        assert!(!resumed);
        assert_ne!(fresh.id, session.id);
    }

    #[test]
    fn test_kinds_isolated() {
        let manager = manager();

        let (follow, _) = manager
            .get_or_resume("batch_follow", &users(&["u1"]), None)
            .unwrap();
        let (unfollow, resumed) = manager
            .get_or_resume("batch_unfollow", &users(&["u2"]), None)
            .unwrap();

        assert!(!resumed);
        assert_ne!(follow.id, unfollow.id);
    }
}

//! SQLite persistence for batch sessions.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{ItemStatus, Session, SessionItem, SessionStatus};
use crate::store::normalize_username;

/// Store for sessions and their work items.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Create a session with one Pending item per username, in a
    /// single transaction. Usernames are normalized and deduplicated,
    /// preserving first occurrence order.
    pub fn create_session(
        &self,
        kind: &str,
        items: &[String],
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let metadata_json = match metadata {
            Some(m) => serde_json::to_string(m)?,
            None => "{}".to_string(),
        };

        let mut seen = std::collections::HashSet::new();
        let normalized: Vec<String> = items
            .iter()
            .map(|u| normalize_username(u))
            .filter(|u| !u.is_empty() && seen.insert(u.clone()))
            .collect();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO sessions (id, kind, status, started_at, total_count, metadata)
            VALUES (?1, ?2, 'in_progress', ?3, ?4, ?5)
            "#,
            params![id, kind, now.to_rfc3339(), normalized.len() as i64, metadata_json],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO session_items (session_id, username, status) VALUES (?1, ?2, 'pending')",
            )?;
            for username in &normalized {
                stmt.execute(params![id, username])?;
            }
        }

        tx.commit()?;

        debug!(session_id = %id, kind = %kind, total = normalized.len(), "Session created");
        Ok(id)
    }

    /// Get a session by ID.
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();

        let session = conn
            .query_row(
                r#"
                SELECT id, kind, status, started_at, completed_at,
                       total_count, success_count, failed_count, skipped_count, metadata
                FROM sessions WHERE id = ?1
                "#,
                params![session_id],
                Self::row_to_session,
            )
            .optional()?;

        Ok(session)
    }

    /// The most recent session of this kind still in progress, if any.
    pub fn get_pending_session(&self, kind: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();

        let session = conn
            .query_row(
                r#"
                SELECT id, kind, status, started_at, completed_at,
                       total_count, success_count, failed_count, skipped_count, metadata
                FROM sessions
                WHERE kind = ?1 AND status = 'in_progress'
                ORDER BY started_at DESC, rowid DESC
                LIMIT 1
                "#,
                params![kind],
                Self::row_to_session,
            )
            .optional()?;

        Ok(session)
    }

    /// Usernames of items not yet terminal, in insertion order. This
    /// is exactly the work remaining.
    pub fn pending_items(&self, session_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            r#"
            SELECT username FROM session_items
            WHERE session_id = ?1 AND status = 'pending'
            ORDER BY rowid ASC
            "#,
        )?;

        let items = stmt
            .query_map(params![session_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(items)
    }

    /// All items of a session, in insertion order.
    pub fn items(&self, session_id: &str) -> Result<Vec<SessionItem>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, username, status, processed_at, error_message
            FROM session_items
            WHERE session_id = ?1
            ORDER BY rowid ASC
            "#,
        )?;

        let items = stmt
            .query_map(params![session_id], |row| {
                let status_str: String = row.get(2)?;
                let processed_str: Option<String> = row.get(3)?;
                Ok(SessionItem {
                    session_id: row.get(0)?,
                    username: row.get(1)?,
                    status: ItemStatus::from_db_string(&status_str)
                        .unwrap_or(ItemStatus::Pending),
                    processed_at: processed_str.and_then(|s| {
                        DateTime::parse_from_rfc3339(&s)
                            .map(|dt| dt.with_timezone(&Utc))
                            .ok()
                    }),
                    error_message: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(items)
    }

    /// Transition a Pending item to a terminal status and increment
    /// the matching session counter, atomically.
    ///
    /// Fails when the session is unknown or already completed, when
    /// the item is unknown, or when the item is already terminal.
    pub fn update_item(
        &self,
        session_id: &str,
        username: &str,
        status: ItemStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            bail!("Cannot transition a session item back to pending");
        }
        let username = normalize_username(username);

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let session_status: Option<String> = tx
            .query_row(
                "SELECT status FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        match session_status.as_deref() {
            None => bail!("Unknown session {}", session_id),
            Some("completed") => bail!("Session {} is already completed", session_id),
            _ => {}
        }

        let updated = tx.execute(
            r#"
            UPDATE session_items
            SET status = ?1, processed_at = ?2, error_message = ?3
            WHERE session_id = ?4 AND username = ?5 AND status = 'pending'
            "#,
            params![
                status.to_db_string(),
                Utc::now().to_rfc3339(),
                error_message,
                session_id,
                username,
            ],
        )?;

        if updated == 0 {
            bail!(
                "Item {} in session {} is missing or already terminal",
                username,
                session_id
            );
        }

        let counter = match status {
            ItemStatus::Success => "success_count",
            ItemStatus::Failed => "failed_count",
            ItemStatus::Skipped => "skipped_count",
            ItemStatus::Pending => unreachable!(),
        };
        tx.execute(
            &format!("UPDATE sessions SET {} = {} + 1 WHERE id = ?1", counter, counter),
            params![session_id],
        )?;

        tx.commit()?;

        debug!(
            session_id = %session_id,
            username = %username,
            status = ?status,
            "Session item updated"
        );
        Ok(())
    }

    /// Transition the session to Completed. Fails when the session is
    /// unknown or already completed.
    pub fn complete_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let updated = conn.execute(
            r#"
            UPDATE sessions SET status = 'completed', completed_at = ?1
            WHERE id = ?2 AND status = 'in_progress'
            "#,
            params![Utc::now().to_rfc3339(), session_id],
        )?;

        if updated == 0 {
            bail!("Session {} is unknown or already completed", session_id);
        }

        debug!(session_id = %session_id, "Session completed");
        Ok(())
    }

    /// Recent sessions of any kind, newest first.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            r#"
            SELECT id, kind, status, started_at, completed_at,
                   total_count, success_count, failed_count, skipped_count, metadata
            FROM sessions
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?1
            "#,
        )?;

        let sessions = stmt
            .query_map(params![limit as i64], Self::row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    fn row_to_session(row: &rusqlite::Row) -> Result<Session, rusqlite::Error> {
        let status_str: String = row.get(2)?;
        let started_str: String = row.get(3)?;
        let completed_str: Option<String> = row.get(4)?;
        let metadata_json: String = row.get(9)?;

        Ok(Session {
            id: row.get(0)?,
            kind: row.get(1)?,
            status: SessionStatus::from_db_string(&status_str)
                .unwrap_or(SessionStatus::InProgress),
            started_at: DateTime::parse_from_rfc3339(&started_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            completed_at: completed_str.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
            }),
            total_count: row.get::<_, i64>(5)? as u32,
            success_count: row.get::<_, i64>(6)? as u32,
            failed_count: row.get::<_, i64>(7)? as u32,
            skipped_count: row.get::<_, i64>(8)? as u32,
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn store() -> SessionStore {
        Database::in_memory().unwrap().sessions()
    }

    fn users(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_and_get() {
        let store = store();
        let id = store
            .create_session("batch_unfollow", &users(&["u1", "u2", "u3"]), None)
            .unwrap();

        let session = store.get_session(&id).unwrap().unwrap();
        assert_eq!(session.kind, "batch_unfollow");
        assert_eq!(session.status, SessionStatus::InProgress);
        assert_eq!(session.total_count, 3);
        assert_eq!(session.remaining(), 3);

        assert_eq!(store.pending_items(&id).unwrap(), users(&["u1", "u2", "u3"]));
    }

    #[test]
    fn test_items_deduplicated_and_normalized() {
        let store = store();
        let id = store
            .create_session("batch_follow", &users(&["@Alice", "alice", "Bob"]), None)
            .unwrap();

        let session = store.get_session(&id).unwrap().unwrap();
        assert_eq!(session.total_count, 2);
        assert_eq!(store.pending_items(&id).unwrap(), users(&["alice", "bob"]));
    }

    #[test]
    fn test_resumability() {
        let store = store();
        let id = store
            .create_session("batch_unfollow", &users(&["u1", "u2", "u3"]), None)
            .unwrap();

        store
            .update_item(&id, "u1", ItemStatus::Success, None)
            .unwrap();

        // A fresh pending query returns exactly the remaining work
        assert_eq!(store.pending_items(&id).unwrap(), users(&["u2", "u3"]));

        store
            .update_item(&id, "u2", ItemStatus::Failed, Some("timeout"))
            .unwrap();
        store
            .update_item(&id, "u3", ItemStatus::Skipped, None)
            .unwrap();

        let session = store.get_session(&id).unwrap().unwrap();
        assert_eq!(
            session.success_count + session.failed_count + session.skipped_count,
            session.total_count
        );
        assert!(store.pending_items(&id).unwrap().is_empty());
    }

    #[test]
    fn test_item_transitions_exactly_once() {
        let store = store();
        let id = store
            .create_session("batch_follow", &users(&["u1"]), None)
            .unwrap();

        store
            .update_item(&id, "u1", ItemStatus::Success, None)
            .unwrap();

        // Terminal items reject further transitions
        assert!(store
            .update_item(&id, "u1", ItemStatus::Failed, None)
            .is_err());

        let session = store.get_session(&id).unwrap().unwrap();
        assert_eq!(session.success_count, 1);
        assert_eq!(session.failed_count, 0);
    }

    #[test]
    fn test_update_unknown_item_fails() {
        let store = store();
        let id = store
            .create_session("batch_follow", &users(&["u1"]), None)
            .unwrap();

        assert!(store
            .update_item(&id, "ghost", ItemStatus::Success, None)
            .is_err());
        assert!(store
            .update_item("no-such-session", "u1", ItemStatus::Success, None)
            .is_err());
    }

    #[test]
    fn test_complete_session_once() {
        let store = store();
        let id = store
            .create_session("batch_follow", &users(&["u1"]), None)
            .unwrap();

        store.complete_session(&id).unwrap();
        let session = store.get_session(&id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.completed_at.is_some());

        // Never reopened, never completed twice
        assert!(store.complete_session(&id).is_err());
        // Updates after completion are rejected
        assert!(store
            .update_item(&id, "u1", ItemStatus::Success, None)
            .is_err());
    }

    #[test]
    fn test_get_pending_session_newest_wins() {
        let store = store();
        let first = store
            .create_session("batch_unfollow", &users(&["u1"]), None)
            .unwrap();
        let second = store
            .create_session("batch_unfollow", &users(&["u2"]), None)
            .unwrap();

        let pending = store.get_pending_session("batch_unfollow").unwrap().unwrap();
        assert_eq!(pending.id, second);

        store.complete_session(&second).unwrap();
        let pending = store.get_pending_session("batch_unfollow").unwrap().unwrap();
        assert_eq!(pending.id, first);

        store.complete_session(&first).unwrap();
        assert!(store.get_pending_session("batch_unfollow").unwrap().is_none());

        assert!(store.get_pending_session("other_kind").unwrap().is_none());
    }

    #[test]
    fn test_items_listing() {
        let store = store();
        let id = store
            .create_session("batch_follow", &users(&["u1", "u2"]), None)
            .unwrap();
        store
            .update_item(&id, "u1", ItemStatus::Failed, Some("not found"))
            .unwrap();

        let items = store.items(&id).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].status, ItemStatus::Failed);
        assert_eq!(items[0].error_message.as_deref(), Some("not found"));
        assert!(items[0].processed_at.is_some());
        assert_eq!(items[1].status, ItemStatus::Pending);
        assert!(items[1].processed_at.is_none());
    }
}

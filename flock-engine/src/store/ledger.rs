//! Append-only action ledger.
//!
//! Every follow/unfollow the engine performs is recorded here and
//! never deleted. The most recent record for a username, by creation
//! time, decides whether the engine currently follows that user. The
//! ledger also owns the whitelist and the opportunistic profile cache
//! used as filter input without a live fetch.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::normalize_username;

/// Kind of relationship action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Follow,
    Unfollow,
}

impl ActionKind {
    /// Convert to database string
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Unfollow => "unfollow",
        }
    }

    /// Parse from database string
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "follow" => Some(Self::Follow),
            "unfollow" => Some(Self::Unfollow),
            _ => None,
        }
    }
}

/// One ledger entry. Immutable once written except the followed-back
/// fields, which a later reconciliation may set exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Record ID (UUID)
    pub id: String,
    /// Normalized subject username
    pub username: String,
    /// Follow or unfollow
    pub kind: ActionKind,
    /// Where the action originated (strategy name, "manual", ...)
    pub source: Option<String>,
    /// Free-form reason
    pub reason: Option<String>,
    /// Whether the subject followed back
    pub followed_back: bool,
    /// When the follow-back was observed
    pub followed_back_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Extra key-value context
    pub metadata: HashMap<String, String>,
}

/// Whitelist entry. Presence overrides every other filter decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub username: String,
    pub reason: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// Cached profile attributes, upserted whenever fresh data is observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedProfile {
    pub username: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub followers_count: Option<i64>,
    pub following_count: Option<i64>,
    pub post_count: Option<i64>,
    pub verified: bool,
    pub avatar_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Store for the action ledger, whitelist and profile cache.
#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    // ========================================================================
    // Action Records
    // ========================================================================

    /// Record an action. Also increments the daily counter for the
    /// current UTC date in the same transaction.
    pub fn record_action(
        &self,
        username: &str,
        kind: ActionKind,
        source: Option<&str>,
        reason: Option<&str>,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<String> {
        let username = normalize_username(username);
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let metadata_json = match metadata {
            Some(m) => serde_json::to_string(m)?,
            None => "{}".to_string(),
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO actions (id, username, kind, source, reason, followed_back, created_at, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)
            "#,
            params![
                id,
                username,
                kind.to_db_string(),
                source,
                reason,
                now.to_rfc3339(),
                metadata_json,
            ],
        )?;

        tx.execute(
            r#"
            INSERT INTO daily_counts (date, kind, count) VALUES (?1, ?2, 1)
            ON CONFLICT(date, kind) DO UPDATE SET count = count + 1
            "#,
            params![now.format("%Y-%m-%d").to_string(), kind.to_db_string()],
        )?;

        tx.commit()?;

        debug!(record_id = %id, username = %username, kind = ?kind, "Action recorded");
        Ok(id)
    }

    /// Mark the most recent unreconciled follow for this username as
    /// followed back. Returns false when no such record exists.
    pub fn mark_followed_back(&self, username: &str) -> Result<bool> {
        let username = normalize_username(username);
        let conn = self.conn.lock().unwrap();

        let updated = conn.execute(
            r#"
            UPDATE actions SET followed_back = 1, followed_back_at = ?1
            WHERE id = (
                SELECT id FROM actions
                WHERE username = ?2 AND kind = 'follow' AND followed_back = 0
                ORDER BY created_at DESC, rowid DESC
                LIMIT 1
            )
            "#,
            params![Utc::now().to_rfc3339(), username],
        )?;

        Ok(updated > 0)
    }

    /// True iff the most recent record for this username is a follow.
    pub fn is_currently_following(&self, username: &str) -> Result<bool> {
        let username = normalize_username(username);
        let conn = self.conn.lock().unwrap();

        let kind: Option<String> = conn
            .query_row(
                r#"
                SELECT kind FROM actions
                WHERE username = ?1
                ORDER BY created_at DESC, rowid DESC
                LIMIT 1
                "#,
                params![username],
                |row| row.get(0),
            )
            .optional()?;

        Ok(kind.as_deref() == Some("follow"))
    }

    /// True if any follow record exists for this username.
    pub fn was_ever_followed(&self, username: &str) -> Result<bool> {
        let username = normalize_username(username);
        let conn = self.conn.lock().unwrap();

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM actions WHERE username = ?1 AND kind = 'follow')",
            params![username],
            |row| row.get(0),
        )?;

        Ok(exists)
    }

    /// Full history for a username, oldest first.
    pub fn history(&self, username: &str) -> Result<Vec<ActionRecord>> {
        let username = normalize_username(username);
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            r#"
            SELECT id, username, kind, source, reason, followed_back, followed_back_at, created_at, metadata
            FROM actions
            WHERE username = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )?;

        let records = stmt
            .query_map(params![username], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Every ledger record, oldest first. Used by history export.
    pub fn export_all(&self) -> Result<Vec<ActionRecord>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            r#"
            SELECT id, username, kind, source, reason, followed_back, followed_back_at, created_at, metadata
            FROM actions
            ORDER BY created_at ASC, rowid ASC
            "#,
        )?;

        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Follows older than the cutoff that are still candidates for
    /// unfollowing: the latest follow per username, excluding users
    /// whose most recent record is already an unfollow and, when
    /// requested, those already reconciled as followed back. Oldest
    /// first.
    pub fn follows_older_than(
        &self,
        days: i64,
        exclude_followed_back: bool,
    ) -> Result<Vec<ActionRecord>> {
        let cutoff = Utc::now() - Duration::days(days);
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            r#"
            SELECT a.id, a.username, a.kind, a.source, a.reason, a.followed_back,
                   a.followed_back_at, a.created_at, a.metadata
            FROM actions a
            WHERE a.kind = 'follow'
              AND a.created_at < ?1
              AND (?2 = 0 OR a.followed_back = 0)
              AND a.rowid = (
                  SELECT b.rowid FROM actions b
                  WHERE b.username = a.username AND b.kind = 'follow'
                  ORDER BY b.created_at DESC, b.rowid DESC
                  LIMIT 1
              )
              AND (
                  SELECT c.kind FROM actions c
                  WHERE c.username = a.username
                  ORDER BY c.created_at DESC, c.rowid DESC
                  LIMIT 1
              ) != 'unfollow'
            ORDER BY a.created_at ASC, a.rowid ASC
            "#,
        )?;

        let records = stmt
            .query_map(
                params![cutoff.to_rfc3339(), exclude_followed_back as i64],
                Self::row_to_record,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Actions of this kind recorded today (UTC date bucket).
    pub fn actions_today(&self, kind: ActionKind) -> Result<u32> {
        let conn = self.conn.lock().unwrap();

        let count: Option<u32> = conn
            .query_row(
                "SELECT count FROM daily_counts WHERE date = ?1 AND kind = ?2",
                params![
                    Utc::now().format("%Y-%m-%d").to_string(),
                    kind.to_db_string()
                ],
                |row| row.get(0),
            )
            .optional()?;

        Ok(count.unwrap_or(0))
    }

    /// Actions of this kind recorded in the last hour.
    pub fn actions_in_last_hour(&self, kind: ActionKind) -> Result<u32> {
        let cutoff = Utc::now() - Duration::hours(1);
        let conn = self.conn.lock().unwrap();

        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM actions WHERE kind = ?1 AND created_at >= ?2",
            params![kind.to_db_string(), cutoff.to_rfc3339()],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<ActionRecord, rusqlite::Error> {
        let kind_str: String = row.get(2)?;
        let followed_back_at: Option<String> = row.get(6)?;
        let created_str: String = row.get(7)?;
        let metadata_json: String = row.get(8)?;

        Ok(ActionRecord {
            id: row.get(0)?,
            username: row.get(1)?,
            kind: ActionKind::from_db_string(&kind_str).unwrap_or(ActionKind::Follow),
            source: row.get(3)?,
            reason: row.get(4)?,
            followed_back: row.get::<_, i64>(5)? != 0,
            followed_back_at: followed_back_at.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
            }),
            created_at: DateTime::parse_from_rfc3339(&created_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        })
    }

    // ========================================================================
    // Whitelist
    // ========================================================================

    /// Add a username to the whitelist.
    pub fn whitelist_add(&self, username: &str, reason: Option<&str>) -> Result<()> {
        let username = normalize_username(username);
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            INSERT INTO whitelist (username, reason, added_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(username) DO UPDATE SET reason = excluded.reason
            "#,
            params![username, reason, Utc::now().to_rfc3339()],
        )?;

        debug!(username = %username, "Whitelist entry added");
        Ok(())
    }

    /// Remove a username from the whitelist. Returns whether an entry
    /// was removed.
    pub fn whitelist_remove(&self, username: &str) -> Result<bool> {
        let username = normalize_username(username);
        let conn = self.conn.lock().unwrap();

        let removed = conn.execute(
            "DELETE FROM whitelist WHERE username = ?1",
            params![username],
        )?;

        Ok(removed > 0)
    }

    /// Check whitelist membership.
    pub fn is_whitelisted(&self, username: &str) -> Result<bool> {
        let username = normalize_username(username);
        let conn = self.conn.lock().unwrap();

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM whitelist WHERE username = ?1)",
            params![username],
            |row| row.get(0),
        )?;

        Ok(exists)
    }

    /// List all whitelist entries, oldest first.
    pub fn whitelist(&self) -> Result<Vec<WhitelistEntry>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT username, reason, added_at FROM whitelist ORDER BY added_at ASC, rowid ASC",
        )?;

        let entries = stmt
            .query_map([], |row| {
                let added_str: String = row.get(2)?;
                Ok(WhitelistEntry {
                    username: row.get(0)?,
                    reason: row.get(1)?,
                    added_at: DateTime::parse_from_rfc3339(&added_str)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    // ========================================================================
    // Profile Cache
    // ========================================================================

    /// Upsert cached profile attributes.
    pub fn upsert_profile(&self, profile: &CachedProfile) -> Result<()> {
        let username = normalize_username(&profile.username);
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            INSERT INTO profiles (username, display_name, bio, followers_count, following_count,
                                  post_count, verified, avatar_url, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(username) DO UPDATE SET
                display_name = excluded.display_name,
                bio = excluded.bio,
                followers_count = excluded.followers_count,
                following_count = excluded.following_count,
                post_count = excluded.post_count,
                verified = excluded.verified,
                avatar_url = excluded.avatar_url,
                updated_at = excluded.updated_at
            "#,
            params![
                username,
                profile.display_name,
                profile.bio,
                profile.followers_count,
                profile.following_count,
                profile.post_count,
                profile.verified as i64,
                profile.avatar_url,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Fetch a cached profile, if any.
    pub fn get_profile(&self, username: &str) -> Result<Option<CachedProfile>> {
        let username = normalize_username(username);
        let conn = self.conn.lock().unwrap();

        let profile = conn
            .query_row(
                r#"
                SELECT username, display_name, bio, followers_count, following_count,
                       post_count, verified, avatar_url, updated_at
                FROM profiles WHERE username = ?1
                "#,
                params![username],
                |row| {
                    let updated_str: String = row.get(8)?;
                    Ok(CachedProfile {
                        username: row.get(0)?,
                        display_name: row.get(1)?,
                        bio: row.get(2)?,
                        followers_count: row.get(3)?,
                        following_count: row.get(4)?,
                        post_count: row.get(5)?,
                        verified: row.get::<_, i64>(6)? != 0,
                        avatar_url: row.get(7)?,
                        updated_at: DateTime::parse_from_rfc3339(&updated_str)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()
            .context("Failed to load cached profile")?;

        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn ledger() -> LedgerStore {
        Database::in_memory().unwrap().ledger()
    }

    #[test]
    fn test_action_kind_db_roundtrip() {
        for kind in [ActionKind::Follow, ActionKind::Unfollow] {
            assert_eq!(ActionKind::from_db_string(kind.to_db_string()), Some(kind));
        }
        assert_eq!(ActionKind::from_db_string("bogus"), None);
    }

    #[test]
    fn test_latest_record_wins() {
        let store = ledger();

        store
            .record_action("alice", ActionKind::Follow, Some("manual"), None, None)
            .unwrap();
        assert!(store.is_currently_following("alice").unwrap());

        store
            .record_action("alice", ActionKind::Unfollow, Some("manual"), None, None)
            .unwrap();
        assert!(!store.is_currently_following("alice").unwrap());
        assert!(store.was_ever_followed("alice").unwrap());

        store
            .record_action("alice", ActionKind::Follow, None, None, None)
            .unwrap();
        assert!(store.is_currently_following("alice").unwrap());
    }

    #[test]
    fn test_unknown_user_not_following() {
        let store = ledger();
        assert!(!store.is_currently_following("nobody").unwrap());
        assert!(!store.was_ever_followed("nobody").unwrap());
        assert!(store.history("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_username_normalization() {
        let store = ledger();
        store
            .record_action("@Alice", ActionKind::Follow, None, None, None)
            .unwrap();
        assert!(store.is_currently_following("alice").unwrap());
        assert!(store.is_currently_following("@ALICE").unwrap());
    }

    #[test]
    fn test_history_ordered() {
        let store = ledger();
        store
            .record_action("bob", ActionKind::Follow, None, None, None)
            .unwrap();
        store
            .record_action("bob", ActionKind::Unfollow, None, None, None)
            .unwrap();

        let history = store.history("bob").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, ActionKind::Follow);
        assert_eq!(history[1].kind, ActionKind::Unfollow);
        assert!(history[0].created_at <= history[1].created_at);
    }

    #[test]
    fn test_mark_followed_back_once() {
        let store = ledger();
        store
            .record_action("carol", ActionKind::Follow, None, None, None)
            .unwrap();

        assert!(store.mark_followed_back("carol").unwrap());
        // Already reconciled: no unreconciled follow remains
        assert!(!store.mark_followed_back("carol").unwrap());

        let history = store.history("carol").unwrap();
        assert!(history[0].followed_back);
        assert!(history[0].followed_back_at.is_some());
    }

    #[test]
    fn test_mark_followed_back_no_follow() {
        let store = ledger();
        assert!(!store.mark_followed_back("stranger").unwrap());
    }

    #[test]
    fn test_follows_older_than() {
        let store = ledger();
        store
            .record_action("old_follow", ActionKind::Follow, None, None, None)
            .unwrap();
        store
            .record_action("already_unfollowed", ActionKind::Follow, None, None, None)
            .unwrap();
        store
            .record_action("already_unfollowed", ActionKind::Unfollow, None, None, None)
            .unwrap();
        store
            .record_action("followed_back", ActionKind::Follow, None, None, None)
            .unwrap();
        store.mark_followed_back("followed_back").unwrap();

        // Cutoff in the future relative to creation: everything qualifies by age
        let candidates = store.follows_older_than(-1, true).unwrap();
        let usernames: Vec<&str> = candidates.iter().map(|r| r.username.as_str()).collect();

        assert!(usernames.contains(&"old_follow"));
        assert!(!usernames.contains(&"already_unfollowed"));
        assert!(!usernames.contains(&"followed_back"));

        // Without the followed-back exclusion the reconciled user returns
        let candidates = store.follows_older_than(-1, false).unwrap();
        let usernames: Vec<&str> = candidates.iter().map(|r| r.username.as_str()).collect();
        assert!(usernames.contains(&"followed_back"));

        // A large cutoff excludes recent follows
        assert!(store.follows_older_than(30, true).unwrap().is_empty());
    }

    #[test]
    fn test_daily_counter() {
        let store = ledger();
        assert_eq!(store.actions_today(ActionKind::Follow).unwrap(), 0);

        store
            .record_action("u1", ActionKind::Follow, None, None, None)
            .unwrap();
        store
            .record_action("u2", ActionKind::Follow, None, None, None)
            .unwrap();
        store
            .record_action("u3", ActionKind::Unfollow, None, None, None)
            .unwrap();

        assert_eq!(store.actions_today(ActionKind::Follow).unwrap(), 2);
        assert_eq!(store.actions_today(ActionKind::Unfollow).unwrap(), 1);
        assert_eq!(store.actions_in_last_hour(ActionKind::Follow).unwrap(), 2);
    }

    #[test]
    fn test_whitelist() {
        let store = ledger();
        assert!(!store.is_whitelisted("bestie").unwrap());

        store.whitelist_add("@Bestie", Some("close friend")).unwrap();
        assert!(store.is_whitelisted("bestie").unwrap());

        let entries = store.whitelist().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].username, "bestie");
        assert_eq!(entries[0].reason.as_deref(), Some("close friend"));

        assert!(store.whitelist_remove("bestie").unwrap());
        assert!(!store.whitelist_remove("bestie").unwrap());
        assert!(!store.is_whitelisted("bestie").unwrap());
    }

    #[test]
    fn test_profile_upsert() {
        let store = ledger();
        let mut profile = CachedProfile {
            username: "dave".into(),
            display_name: Some("Dave".into()),
            bio: Some("hello".into()),
            followers_count: Some(100),
            following_count: Some(50),
            post_count: Some(10),
            verified: false,
            avatar_url: None,
            updated_at: Utc::now(),
        };

        store.upsert_profile(&profile).unwrap();
        let loaded = store.get_profile("dave").unwrap().unwrap();
        assert_eq!(loaded.followers_count, Some(100));

        profile.followers_count = Some(150);
        profile.verified = true;
        store.upsert_profile(&profile).unwrap();

        let loaded = store.get_profile("dave").unwrap().unwrap();
        assert_eq!(loaded.followers_count, Some(150));
        assert!(loaded.verified);

        assert!(store.get_profile("missing").unwrap().is_none());
    }

    #[test]
    fn test_record_metadata_roundtrip() {
        let store = ledger();
        let mut metadata = HashMap::new();
        metadata.insert("strategy".to_string(), "followers_of:acme".to_string());

        store
            .record_action(
                "erin",
                ActionKind::Follow,
                Some("auto_follow"),
                Some("matched filters"),
                Some(&metadata),
            )
            .unwrap();

        let history = store.history("erin").unwrap();
        assert_eq!(history[0].source.as_deref(), Some("auto_follow"));
        assert_eq!(
            history[0].metadata.get("strategy").map(String::as_str),
            Some("followers_of:acme")
        );
    }
}

//! Versioned membership snapshots with set diffing.
//!
//! Each snapshot stores the full member set (not a delta), so a diff
//! is a pure set operation with no drift risk. A new capture is a new
//! row; history is retained until retention pruning removes it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::normalize_username;

/// Which membership set a snapshot captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Followers,
    Following,
}

impl MemberKind {
    /// Convert to database string
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Followers => "followers",
            Self::Following => "following",
        }
    }

    /// Parse from database string
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "followers" => Some(Self::Followers),
            "following" => Some(Self::Following),
            _ => None,
        }
    }
}

/// Snapshot metadata without the member set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub subject: String,
    pub kind: MemberKind,
    pub count: usize,
    pub created_at: DateTime<Utc>,
}

/// Result of comparing two member sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// Members present in the old set but not the new
    pub removed: BTreeSet<String>,
    /// Members present in the new set but not the old
    pub added: BTreeSet<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Plain set difference: `removed = old - new`, `added = new - old`.
pub fn compare(old: &BTreeSet<String>, new: &BTreeSet<String>) -> SnapshotDiff {
    SnapshotDiff {
        removed: old.difference(new).cloned().collect(),
        added: new.difference(old).cloned().collect(),
    }
}

/// Store for membership snapshots.
#[derive(Clone)]
pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Persist a new snapshot. Members are normalized and deduplicated.
    pub fn save_snapshot(
        &self,
        subject: &str,
        kind: MemberKind,
        members: &BTreeSet<String>,
    ) -> Result<String> {
        let subject = normalize_username(subject);
        let normalized: BTreeSet<String> =
            members.iter().map(|m| normalize_username(m)).collect();

        let id = uuid::Uuid::new_v4().to_string();
        let members_json = serde_json::to_string(&normalized)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO snapshots (id, subject, kind, members, count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                id,
                subject,
                kind.to_db_string(),
                members_json,
                normalized.len(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        debug!(
            snapshot_id = %id,
            subject = %subject,
            kind = ?kind,
            count = normalized.len(),
            "Snapshot saved"
        );
        Ok(id)
    }

    /// Load the most recent snapshot's member set, if any.
    pub fn load_latest(
        &self,
        subject: &str,
        kind: MemberKind,
    ) -> Result<Option<BTreeSet<String>>> {
        Ok(self
            .load_latest_with_metadata(subject, kind)?
            .map(|(_, members)| members))
    }

    /// Load the most recent snapshot with its metadata.
    pub fn load_latest_with_metadata(
        &self,
        subject: &str,
        kind: MemberKind,
    ) -> Result<Option<(SnapshotMeta, BTreeSet<String>)>> {
        let subject = normalize_username(subject);
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                r#"
                SELECT id, subject, kind, members, count, created_at
                FROM snapshots
                WHERE subject = ?1 AND kind = ?2
                ORDER BY created_at DESC, rowid DESC
                LIMIT 1
                "#,
                params![subject, kind.to_db_string()],
                Self::row_to_snapshot,
            )
            .optional()?;

        Ok(row)
    }

    /// Load a snapshot by ID.
    pub fn load_by_id(&self, snapshot_id: &str) -> Result<Option<(SnapshotMeta, BTreeSet<String>)>> {
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                r#"
                SELECT id, subject, kind, members, count, created_at
                FROM snapshots WHERE id = ?1
                "#,
                params![snapshot_id],
                Self::row_to_snapshot,
            )
            .optional()?;

        Ok(row)
    }

    /// List snapshot metadata, newest first.
    pub fn list_snapshots(
        &self,
        subject: &str,
        kind: Option<MemberKind>,
        limit: usize,
    ) -> Result<Vec<SnapshotMeta>> {
        let subject = normalize_username(subject);
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            r#"
            SELECT id, subject, kind, count, created_at
            FROM snapshots
            WHERE subject = ?1 AND (?2 IS NULL OR kind = ?2)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?3
            "#,
        )?;

        let metas = stmt
            .query_map(
                params![subject, kind.map(|k| k.to_db_string()), limit as i64],
                |row| {
                    let kind_str: String = row.get(2)?;
                    let created_str: String = row.get(4)?;
                    Ok(SnapshotMeta {
                        id: row.get(0)?,
                        subject: row.get(1)?,
                        kind: MemberKind::from_db_string(&kind_str)
                            .unwrap_or(MemberKind::Followers),
                        count: row.get::<_, i64>(3)? as usize,
                        created_at: DateTime::parse_from_rfc3339(&created_str)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(metas)
    }

    /// Delete all but the `keep_count` most recent snapshots for this
    /// (subject, kind) pair. Returns the number deleted.
    pub fn cleanup_old(
        &self,
        subject: &str,
        kind: MemberKind,
        keep_count: usize,
    ) -> Result<usize> {
        let subject = normalize_username(subject);
        let conn = self.conn.lock().unwrap();

        let deleted = conn.execute(
            r#"
            DELETE FROM snapshots
            WHERE subject = ?1 AND kind = ?2 AND id NOT IN (
                SELECT id FROM snapshots
                WHERE subject = ?1 AND kind = ?2
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?3
            )
            "#,
            params![subject, kind.to_db_string(), keep_count as i64],
        )?;

        if deleted > 0 {
            debug!(subject = %subject, kind = ?kind, deleted, "Old snapshots pruned");
        }
        Ok(deleted)
    }

    fn row_to_snapshot(
        row: &rusqlite::Row,
    ) -> Result<(SnapshotMeta, BTreeSet<String>), rusqlite::Error> {
        let kind_str: String = row.get(2)?;
        let members_json: String = row.get(3)?;
        let created_str: String = row.get(5)?;

        let meta = SnapshotMeta {
            id: row.get(0)?,
            subject: row.get(1)?,
            kind: MemberKind::from_db_string(&kind_str).unwrap_or(MemberKind::Followers),
            count: row.get::<_, i64>(4)? as usize,
            created_at: DateTime::parse_from_rfc3339(&created_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        };
        let members: BTreeSet<String> =
            serde_json::from_str(&members_json).unwrap_or_default();

        Ok((meta, members))
    }
}

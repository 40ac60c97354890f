//! Follower change detection.
//!
//! A detection pass captures the current follower set, diffs it
//! against the last stored snapshot, and turns the difference into
//! ledger reconciliation, time-series points, and notifier events.
//! The first pass for an account establishes a baseline and emits
//! nothing.

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use flock_common::config::DetectionConfig;
use flock_common::{EngineError, Result};

use crate::notify::Notifier;
use crate::store::snapshot::{compare, SnapshotStore};
use crate::store::{normalize_username, Database, LedgerStore, MemberKind, TimeSeriesStore};
use crate::surface::ActionSurface;

/// Outcome of one detection pass.
#[derive(Debug, Clone)]
pub struct DetectionReport {
    pub follower_count: usize,
    pub new_followers: Vec<String>,
    pub unfollowers: Vec<String>,
    /// Lowest milestone crossed by this pass, if any.
    pub milestone: Option<u64>,
    /// Ledger follows newly confirmed as followed back.
    pub reconciled: u32,
    /// True when no previous snapshot existed.
    pub baseline: bool,
    pub snapshots_pruned: usize,
}

/// Runs detection passes for one account.
pub struct ChangeDetector {
    ledger: LedgerStore,
    snapshots: SnapshotStore,
    timeseries: TimeSeriesStore,
    surface: Arc<dyn ActionSurface>,
    notifier: Arc<dyn Notifier>,
    config: DetectionConfig,
    account: String,
}

impl ChangeDetector {
    pub fn new(
        db: &Database,
        surface: Arc<dyn ActionSurface>,
        notifier: Arc<dyn Notifier>,
        config: DetectionConfig,
        account: &str,
    ) -> Self {
        Self {
            ledger: db.ledger(),
            snapshots: db.snapshots(),
            timeseries: db.timeseries(),
            surface,
            notifier,
            config,
            account: normalize_username(account),
        }
    }

    /// One full pass: capture, diff, persist, reconcile, notify, prune.
    pub async fn run_pass(&self) -> Result<DetectionReport> {
        if self.account.is_empty() {
            return Err(EngineError::precondition("no account configured"));
        }

        let current = self.capture().await?;
        let previous = self
            .snapshots
            .load_latest(&self.account, MemberKind::Followers)?;

        let mut report = DetectionReport {
            follower_count: current.len(),
            new_followers: Vec::new(),
            unfollowers: Vec::new(),
            milestone: None,
            reconciled: 0,
            baseline: previous.is_none(),
            snapshots_pruned: 0,
        };

        self.snapshots
            .save_snapshot(&self.account, MemberKind::Followers, &current)?;
        self.timeseries
            .record("followers", &self.account, current.len() as f64)?;

        if let Some(previous) = previous {
            let diff = compare(&previous, &current);
            report.new_followers = diff.added.iter().cloned().collect();
            report.unfollowers = diff.removed.iter().cloned().collect();
            report.milestone = self.crossed_milestone(previous.len(), current.len());

            report.reconciled = self.reconcile(&report.new_followers)?;
            self.emit_events(&report).await;
        } else {
            info!(
                account = %self.account,
                followers = current.len(),
                "Baseline snapshot recorded"
            );
        }

        report.snapshots_pruned = self.snapshots.cleanup_old(
            &self.account,
            MemberKind::Followers,
            self.config.snapshot_keep_count,
        )?;

        info!(
            account = %self.account,
            followers = report.follower_count,
            new = report.new_followers.len(),
            lost = report.unfollowers.len(),
            milestone = ?report.milestone,
            "Detection pass finished"
        );
        Ok(report)
    }

    async fn capture(&self) -> Result<BTreeSet<String>> {
        let members = self
            .surface
            .list_members(&self.account, MemberKind::Followers, self.config.member_page_limit)
            .await
            .map_err(|e| EngineError::precondition(e.to_string()))?;

        Ok(members.iter().map(|m| normalize_username(m)).collect())
    }

    /// The lowest milestone with `previous < m <= current`, if any.
    /// One event per pass even when several bands are crossed at once.
    fn crossed_milestone(&self, previous: usize, current: usize) -> Option<u64> {
        let (previous, current) = (previous as u64, current as u64);
        self.config
            .milestones
            .iter()
            .copied()
            .filter(|&m| previous < m && m <= current)
            .min()
    }

    /// Mark ledger follows among the new followers as followed back.
    fn reconcile(&self, new_followers: &[String]) -> Result<u32> {
        let mut reconciled = 0;
        for username in new_followers {
            if self.ledger.mark_followed_back(username)? {
                debug!(username = %username, "Follow-back confirmed");
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    async fn emit_events(&self, report: &DetectionReport) {
        for username in &report.new_followers {
            self.notifier
                .notify(
                    "new_follower",
                    &format!("@{} started following", username),
                    json!({ "username": username, "account": self.account }),
                )
                .await;
        }
        for username in &report.unfollowers {
            self.notifier
                .notify(
                    "unfollower",
                    &format!("@{} unfollowed", username),
                    json!({ "username": username, "account": self.account }),
                )
                .await;
        }
        if let Some(milestone) = report.milestone {
            self.notifier
                .notify(
                    "milestone",
                    &format!("Crossed {} followers", milestone),
                    json!({
                        "milestone": milestone,
                        "followers": report.follower_count,
                        "account": self.account,
                    }),
                )
                .await;
        }
    }
}

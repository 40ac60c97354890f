//! The execution loop.
//!
//! [`ActionRunner`] drives one action at a time against the surface,
//! inside a resumable session. Between actions it honors pause and
//! cancel signals, the rate governor's pacing delay, daily and hourly
//! follow caps, an optional per-run quota and time budget, and the
//! consecutive-failure circuit breaker. A rate-limit signal from the
//! surface puts the loop into cooldown and retries the same item; the
//! item is never marked terminal by a rate limit alone.
//!
//! In dry-run mode the full state machine runs, surface mutations are
//! skipped, and outcomes land in the session and report exactly as in
//! a real run. The action ledger only ever records actions that were
//! actually performed.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use flock_common::config::EngineConfig;
use flock_common::{EngineError, Result};

use crate::breaker::FailureBreaker;
use crate::rate::RateGovernor;
use crate::session::{ItemStatus, SessionManager};
use crate::store::{ActionKind, Database, LedgerStore};
use crate::surface::{ActionSurface, SurfaceError};

// ============================================================================
// Control and state
// ============================================================================

/// Loop state, visible through the [`ControlHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    RateLimited = 3,
    Cancelled = 4,
    Completed = 5,
}

impl ExecState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::RateLimited,
            4 => Self::Cancelled,
            5 => Self::Completed,
            _ => Self::Idle,
        }
    }
}

#[derive(Default)]
struct ControlInner {
    cancelled: AtomicBool,
    paused: AtomicBool,
    state: AtomicU8,
}

/// Shared handle for observing and steering a run. Clones refer to
/// the same underlying signals.
#[derive(Clone, Default)]
pub struct ControlHandle {
    inner: Arc<ControlInner>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the next checkpoint; the
    /// item in flight is never interrupted mid-action.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ExecState {
        ExecState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ExecState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }
}

// ============================================================================
// Options and report
// ============================================================================

/// Per-run knobs. Defaults run unbounded within the config's caps.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Stop after this many performed actions.
    pub max_actions: Option<u32>,
    /// Stop when this much wall time has elapsed.
    pub time_budget: Option<Duration>,
    /// How often pause/cancel signals are polled while waiting.
    pub pause_poll: Duration,
    /// Recorded as the `source` of each ledger entry.
    pub source: Option<String>,
    /// Recorded as the `reason` of each ledger entry.
    pub reason: Option<String>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_actions: None,
            time_budget: None,
            pause_poll: Duration::from_millis(250),
            source: None,
            reason: None,
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every item reached a terminal status.
    Completed,
    /// Cancelled via the control handle; remaining items stay pending.
    Cancelled,
    /// The consecutive-failure breaker tripped.
    BreakerTripped,
    /// The per-run time budget expired.
    TimeBudgetExpired,
    /// The per-run quota or a follow cap was reached.
    QuantityReached,
}

/// Result of one run. Identical in shape for dry and real runs.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub session_id: String,
    pub outcome: RunOutcome,
    pub success_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

enum Performed {
    Done,
    AlreadyInState,
}

// ============================================================================
// Runner
// ============================================================================

/// Drives batch follow/unfollow sessions against a surface.
pub struct ActionRunner {
    ledger: LedgerStore,
    sessions: SessionManager,
    surface: Arc<dyn ActionSurface>,
    config: EngineConfig,
}

impl ActionRunner {
    pub fn new(db: &Database, surface: Arc<dyn ActionSurface>, config: EngineConfig) -> Self {
        Self {
            ledger: db.ledger(),
            sessions: SessionManager::new(db.sessions()),
            surface,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Run a batch of the given kind over `usernames`. If an
    /// interrupted session of the same kind exists it is resumed and
    /// `usernames` is ignored; otherwise a new session is created.
    pub async fn run_batch(
        &self,
        kind: ActionKind,
        usernames: &[String],
        handle: &ControlHandle,
        options: &RunnerOptions,
    ) -> Result<BatchReport> {
        if !self.surface.is_ready().await {
            return Err(EngineError::precondition("action surface is not ready"));
        }

        let session_kind = match kind {
            ActionKind::Follow => "batch_follow",
            ActionKind::Unfollow => "batch_unfollow",
        };
        let (session, resumed) = self.sessions.get_or_resume(session_kind, usernames, None)?;
        if resumed {
            info!(session_id = %session.id, "Continuing from previous interruption");
        }

        self.run_items(&session.id, kind, handle, options).await
    }

    async fn run_items(
        &self,
        session_id: &str,
        kind: ActionKind,
        handle: &ControlHandle,
        options: &RunnerOptions,
    ) -> Result<BatchReport> {
        let pending = self.sessions.pending_items(session_id)?;
        let started = Instant::now();
        let mut governor = RateGovernor::new(&self.config);
        let mut breaker = FailureBreaker::new(self.config.stop_on_error_count);

        let mut report = BatchReport {
            session_id: session_id.to_string(),
            outcome: RunOutcome::Completed,
            success_count: 0,
            failed_count: 0,
            skipped_count: 0,
            errors: Vec::new(),
            dry_run: self.config.dry_run,
        };

        handle.set_state(ExecState::Running);
        info!(
            session_id = %session_id,
            kind = ?kind,
            pending = pending.len(),
            dry_run = self.config.dry_run,
            "Run started"
        );

        let mut idx = 0;
        while idx < pending.len() {
            let username = &pending[idx];

            if handle.is_cancelled() {
                report.outcome = RunOutcome::Cancelled;
                break;
            }
            if self.block_while_paused(handle, options).await {
                report.outcome = RunOutcome::Cancelled;
                break;
            }
            handle.set_state(ExecState::Running);

            if let Some(budget) = options.time_budget {
                if started.elapsed() >= budget {
                    report.outcome = RunOutcome::TimeBudgetExpired;
                    break;
                }
            }
            if let Some(max) = options.max_actions {
                if report.success_count >= max {
                    report.outcome = RunOutcome::QuantityReached;
                    break;
                }
            }
            if kind == ActionKind::Follow && self.follow_caps_reached()? {
                report.outcome = RunOutcome::QuantityReached;
                break;
            }

            // Whitelist always wins for unfollows; no delay consumed.
            if kind == ActionKind::Unfollow && self.ledger.is_whitelisted(username)? {
                self.sessions.store().update_item(
                    session_id,
                    username,
                    ItemStatus::Skipped,
                    Some("whitelisted"),
                )?;
                report.skipped_count += 1;
                info!(session_id = %session_id, username = %username, "Skipped whitelisted user");
                idx += 1;
                continue;
            }
            if kind == ActionKind::Follow && self.ledger.is_currently_following(username)? {
                self.sessions.store().update_item(
                    session_id,
                    username,
                    ItemStatus::Skipped,
                    Some("already following"),
                )?;
                report.skipped_count += 1;
                idx += 1;
                continue;
            }

            if self
                .wait_or_cancel(governor.next_delay(), handle, options.pause_poll)
                .await
            {
                report.outcome = RunOutcome::Cancelled;
                break;
            }

            match self.perform(username, kind).await {
                Ok(Performed::Done) => {
                    if !self.config.dry_run {
                        self.ledger.record_action(
                            username,
                            kind,
                            options.source.as_deref(),
                            options.reason.as_deref(),
                            None,
                        )?;
                        self.cache_profile(username).await;
                    }
                    self.sessions.store().update_item(
                        session_id,
                        username,
                        ItemStatus::Success,
                        None,
                    )?;
                    report.success_count += 1;
                    breaker.record_success();
                    governor.record_success();
                    info!(
                        session_id = %session_id,
                        username = %username,
                        kind = ?kind,
                        dry_run = self.config.dry_run,
                        "Action done"
                    );
                    idx += 1;
                }
                Ok(Performed::AlreadyInState) => {
                    self.sessions.store().update_item(
                        session_id,
                        username,
                        ItemStatus::Skipped,
                        Some("already in desired state"),
                    )?;
                    report.skipped_count += 1;
                    idx += 1;
                }
                Err(SurfaceError::RateLimited) => {
                    governor.record_rate_limit();
                    let message = format!("rate limited at {}", username);
                    report.errors.push(message.clone());
                    if breaker.record_failure(message) {
                        report.outcome = RunOutcome::BreakerTripped;
                        break;
                    }
                    // Cooldown, then retry the same item.
                    handle.set_state(ExecState::RateLimited);
                    if self
                        .wait_or_cancel(governor.cooldown(), handle, options.pause_poll)
                        .await
                    {
                        report.outcome = RunOutcome::Cancelled;
                        break;
                    }
                }
                Err(err) => {
                    let message = format!("{}: {}", username, err);
                    warn!(session_id = %session_id, username = %username, error = %err, "Action failed");
                    self.sessions.store().update_item(
                        session_id,
                        username,
                        ItemStatus::Failed,
                        Some(&err.to_string()),
                    )?;
                    report.failed_count += 1;
                    report.errors.push(message.clone());
                    idx += 1;
                    if breaker.record_failure(message) {
                        report.outcome = RunOutcome::BreakerTripped;
                        break;
                    }
                }
            }
        }

        if report.outcome == RunOutcome::Completed {
            let session = self
                .sessions
                .store()
                .get_session(session_id)?
                .ok_or_else(|| EngineError::NotFound(format!("session {}", session_id)))?;
            if session.remaining() == 0 {
                self.sessions.complete(session_id)?;
            }
        }

        handle.set_state(match report.outcome {
            RunOutcome::Cancelled => ExecState::Cancelled,
            _ => ExecState::Completed,
        });

        info!(
            session_id = %session_id,
            outcome = ?report.outcome,
            success = report.success_count,
            failed = report.failed_count,
            skipped = report.skipped_count,
            "Run finished"
        );

        if report.outcome == RunOutcome::BreakerTripped {
            warn!(
                session_id = %session_id,
                failures = breaker.consecutive_failures(),
                "Run halted by circuit breaker"
            );
        }

        Ok(report)
    }

    async fn perform(
        &self,
        username: &str,
        kind: ActionKind,
    ) -> std::result::Result<Performed, SurfaceError> {
        self.surface.navigate_to_profile(username).await?;

        match kind {
            ActionKind::Follow => {
                if self.surface.is_following(username).await? {
                    return Ok(Performed::AlreadyInState);
                }
                if !self.config.dry_run {
                    self.surface.follow(username).await?;
                }
            }
            ActionKind::Unfollow => {
                if !self.surface.is_following(username).await? {
                    return Ok(Performed::AlreadyInState);
                }
                if !self.config.dry_run {
                    self.surface.unfollow(username).await?;
                }
            }
        }
        Ok(Performed::Done)
    }

    /// Opportunistic profile caching; failures are not actionable.
    async fn cache_profile(&self, username: &str) {
        if let Ok(Some(profile)) = self.surface.fetch_profile(username).await {
            if let Err(err) = self.ledger.upsert_profile(&profile) {
                warn!(username = %username, error = %err, "Profile cache update failed");
            }
        }
    }

    fn follow_caps_reached(&self) -> Result<bool> {
        if self.ledger.actions_today(ActionKind::Follow)? >= self.config.daily_follow_limit {
            info!("Daily follow limit reached");
            return Ok(true);
        }
        if self.ledger.actions_in_last_hour(ActionKind::Follow)? >= self.config.hourly_follow_limit
        {
            info!("Hourly follow limit reached");
            return Ok(true);
        }
        Ok(false)
    }

    /// Block while paused. Returns true if cancelled while waiting.
    async fn block_while_paused(&self, handle: &ControlHandle, options: &RunnerOptions) -> bool {
        while handle.is_paused() {
            handle.set_state(ExecState::Paused);
            if handle.is_cancelled() {
                return true;
            }
            tokio::time::sleep(options.pause_poll).await;
        }
        false
    }

    /// Sleep `total`, polling for cancellation. Returns true if
    /// cancelled before the sleep finished.
    async fn wait_or_cancel(
        &self,
        total: Duration,
        handle: &ControlHandle,
        poll: Duration,
    ) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if handle.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let chunk = poll.min(deadline - now);
            tokio::time::sleep(chunk).await;
        }
    }
}

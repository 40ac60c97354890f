//! Weighted rule scheduling.
//!
//! The scheduler repeatedly picks one enabled rule by weighted random
//! draw, computes a per-run action quota from the global and per-rule
//! budgets, gathers candidates for the rule's strategy, and hands the
//! batch to the execution loop. Between ticks it sleeps a randomized
//! interval; outside the configured active hours it waits for the
//! window to open. A circuit-breaker trip ends the scheduling loop.

use chrono::{NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use flock_common::config::{DetectionConfig, EngineConfig};
use flock_common::Result;

use crate::exec::{ActionRunner, BatchReport, ControlHandle, RunOutcome, RunnerOptions};
use crate::filters::FilterSet;
use crate::store::{ActionKind, Database, LedgerStore, MemberKind};
use crate::surface::ActionSurface;

// ============================================================================
// Rules
// ============================================================================

/// What a rule does when it fires. One variant per strategy, each
/// carrying only its own typed parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    /// Follow accounts that follow `target`.
    FollowersOf {
        target: String,
        #[serde(default)]
        filters: FilterSet,
    },
    /// Follow accounts that `target` follows.
    FollowingOf {
        target: String,
        #[serde(default)]
        filters: FilterSet,
    },
    /// Unfollow accounts followed more than `older_than_days` ago.
    UnfollowAged {
        older_than_days: i64,
        #[serde(default)]
        exclude_followed_back: bool,
    },
}

impl Strategy {
    pub fn action_kind(&self) -> ActionKind {
        match self {
            Self::FollowersOf { .. } | Self::FollowingOf { .. } => ActionKind::Follow,
            Self::UnfollowAged { .. } => ActionKind::Unfollow,
        }
    }
}

/// One scheduling rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub strategy: Strategy,
    /// Relative selection weight; zero never fires.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Cap on actions this rule may perform per UTC day.
    #[serde(default)]
    pub daily_limit: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> u32 {
    1
}
fn default_enabled() -> bool {
    true
}

/// Per-rule runtime counters, reset at UTC midnight.
#[derive(Debug, Clone)]
struct RuleState {
    actions_today: u32,
    date: NaiveDate,
}

impl RuleState {
    fn new() -> Self {
        Self {
            actions_today: 0,
            date: Utc::now().date_naive(),
        }
    }

    fn roll_date(&mut self) {
        let today = Utc::now().date_naive();
        if self.date != today {
            self.date = today;
            self.actions_today = 0;
        }
    }
}

/// Aggregated outcomes per rule.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerStats {
    pub runs: u32,
    pub success_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
}

/// What one tick did.
#[derive(Debug)]
pub enum TickOutcome {
    /// Outside active hours; wait this long before retrying.
    Inactive(Duration),
    /// No enabled rule with remaining budget.
    NoEligibleRule,
    /// The chosen rule produced no candidates.
    NoCandidates { rule: String },
    /// A batch ran.
    Ran { rule: String, report: BatchReport },
}

// ============================================================================
// Scheduler
// ============================================================================

/// Weighted-random rule scheduler over an [`ActionRunner`].
pub struct RuleScheduler {
    runner: ActionRunner,
    ledger: LedgerStore,
    surface: Arc<dyn ActionSurface>,
    config: EngineConfig,
    detection: DetectionConfig,
    rules: Vec<Rule>,
    states: Vec<RuleState>,
    stats: HashMap<String, SchedulerStats>,
    rng: StdRng,
}

impl RuleScheduler {
    pub fn new(
        db: &Database,
        surface: Arc<dyn ActionSurface>,
        config: EngineConfig,
        detection: DetectionConfig,
        rules: Vec<Rule>,
    ) -> Self {
        Self::with_rng(db, surface, config, detection, rules, StdRng::from_entropy())
    }

    /// Construct with an explicit RNG for deterministic selection.
    pub fn with_rng(
        db: &Database,
        surface: Arc<dyn ActionSurface>,
        config: EngineConfig,
        detection: DetectionConfig,
        rules: Vec<Rule>,
        rng: StdRng,
    ) -> Self {
        let states = rules.iter().map(|_| RuleState::new()).collect();
        Self {
            runner: ActionRunner::new(db, Arc::clone(&surface), config.clone()),
            ledger: db.ledger(),
            surface,
            config,
            detection,
            rules,
            states,
            stats: HashMap::new(),
            rng,
        }
    }

    pub fn stats(&self) -> &HashMap<String, SchedulerStats> {
        &self.stats
    }

    /// Run ticks until cancelled or the breaker trips.
    pub async fn run(&mut self, handle: &ControlHandle) -> Result<()> {
        info!(rules = self.rules.len(), "Scheduler started");

        loop {
            if handle.is_cancelled() {
                info!("Scheduler cancelled");
                return Ok(());
            }

            let wait = match self.tick(handle).await? {
                TickOutcome::Inactive(wait) => {
                    info!(wait_secs = wait.as_secs(), "Outside active hours");
                    wait
                }
                TickOutcome::NoEligibleRule => {
                    info!("No rule with remaining budget, waiting for next tick");
                    self.tick_interval()
                }
                TickOutcome::NoCandidates { rule } => {
                    info!(rule = %rule, "No candidates this tick");
                    self.tick_interval()
                }
                TickOutcome::Ran { rule, report } => {
                    if report.outcome == RunOutcome::BreakerTripped {
                        warn!(rule = %rule, "Scheduler stopping after circuit breaker trip");
                        return Ok(());
                    }
                    self.tick_interval()
                }
            };

            if wait_or_cancel(wait, handle).await {
                info!("Scheduler cancelled");
                return Ok(());
            }
        }
    }

    /// One scheduling decision: gate, pick, budget, gather, run.
    pub async fn tick(&mut self, handle: &ControlHandle) -> Result<TickOutcome> {
        let now = Utc::now().time();
        if !self.config.active_hours.contains(now) {
            let wait = self.config.active_hours.seconds_until_open(now);
            return Ok(TickOutcome::Inactive(Duration::from_secs(wait)));
        }

        for state in &mut self.states {
            state.roll_date();
        }

        let Some(idx) = self.pick_rule() else {
            return Ok(TickOutcome::NoEligibleRule);
        };
        let rule = self.rules[idx].clone();

        let quota = self.quota_for(idx)?;
        if quota == 0 {
            return Ok(TickOutcome::NoEligibleRule);
        }

        let candidates = self.gather_candidates(&rule.strategy).await?;
        if candidates.is_empty() {
            return Ok(TickOutcome::NoCandidates { rule: rule.name });
        }

        info!(
            rule = %rule.name,
            quota,
            candidates = candidates.len(),
            "Rule selected"
        );

        let options = RunnerOptions {
            max_actions: Some(quota),
            source: Some(format!("rule:{}", rule.name)),
            ..Default::default()
        };
        let report = self
            .runner
            .run_batch(rule.strategy.action_kind(), &candidates, handle, &options)
            .await?;

        self.states[idx].actions_today += report.success_count;
        let stats = self.stats.entry(rule.name.clone()).or_default();
        stats.runs += 1;
        stats.success_count += report.success_count;
        stats.failed_count += report.failed_count;
        stats.skipped_count += report.skipped_count;

        Ok(TickOutcome::Ran {
            rule: rule.name,
            report,
        })
    }

    /// Weighted random draw over enabled rules under their daily caps.
    fn pick_rule(&mut self) -> Option<usize> {
        let eligible: Vec<usize> = (0..self.rules.len())
            .filter(|&i| {
                let rule = &self.rules[i];
                rule.enabled
                    && rule.weight > 0
                    && rule
                        .daily_limit
                        .map_or(true, |cap| self.states[i].actions_today < cap)
            })
            .collect();

        let total: u32 = eligible.iter().map(|&i| self.rules[i].weight).sum();
        if total == 0 {
            return None;
        }

        let mut roll = self.rng.gen_range(0..total);
        for &i in &eligible {
            let weight = self.rules[i].weight;
            if roll < weight {
                return Some(i);
            }
            roll -= weight;
        }
        None
    }

    /// Per-run quota: the smallest of the rule's remaining daily
    /// budget and, for follow strategies, the global daily and hourly
    /// remainders.
    fn quota_for(&self, idx: usize) -> Result<u32> {
        let rule = &self.rules[idx];
        let mut quota = rule
            .daily_limit
            .map_or(u32::MAX, |cap| cap.saturating_sub(self.states[idx].actions_today));

        if rule.strategy.action_kind() == ActionKind::Follow {
            let today = self.ledger.actions_today(ActionKind::Follow)?;
            let hour = self.ledger.actions_in_last_hour(ActionKind::Follow)?;
            quota = quota
                .min(self.config.daily_follow_limit.saturating_sub(today))
                .min(self.config.hourly_follow_limit.saturating_sub(hour));
        }

        Ok(quota)
    }

    async fn gather_candidates(&self, strategy: &Strategy) -> Result<Vec<String>> {
        match strategy {
            Strategy::FollowersOf { target, filters } => {
                self.follow_candidates(target, MemberKind::Followers, filters)
                    .await
            }
            Strategy::FollowingOf { target, filters } => {
                self.follow_candidates(target, MemberKind::Following, filters)
                    .await
            }
            Strategy::UnfollowAged {
                older_than_days,
                exclude_followed_back,
            } => {
                let records = self
                    .ledger
                    .follows_older_than(*older_than_days, *exclude_followed_back)?;
                Ok(records.into_iter().map(|r| r.username).collect())
            }
        }
    }

    /// Enumerate members of the target and keep the ones worth
    /// following: never followed before and accepted by the filters.
    async fn follow_candidates(
        &self,
        target: &str,
        kind: MemberKind,
        filters: &FilterSet,
    ) -> Result<Vec<String>> {
        let members = self
            .surface
            .list_members(target, kind, self.detection.member_page_limit)
            .await
            .map_err(|e| flock_common::EngineError::precondition(e.to_string()))?;

        let mut candidates = Vec::new();
        for username in members {
            if self.ledger.was_ever_followed(&username)? {
                continue;
            }
            let profile = match self.ledger.get_profile(&username)? {
                Some(profile) => Some(profile),
                None => {
                    let fetched = self.surface.fetch_profile(&username).await.ok().flatten();
                    if let Some(profile) = &fetched {
                        self.ledger.upsert_profile(profile)?;
                    }
                    fetched
                }
            };
            if filters.accepts(profile.as_ref()) {
                candidates.push(username);
            }
        }
        Ok(candidates)
    }

    /// Randomized sleep between ticks, in configured minute bounds.
    fn tick_interval(&mut self) -> Duration {
        let min = self
            .config
            .min_interval_minutes
            .min(self.config.max_interval_minutes);
        let max = self
            .config
            .max_interval_minutes
            .max(self.config.min_interval_minutes);
        let minutes = if min == max {
            min
        } else {
            self.rng.gen_range(min..=max)
        };
        Duration::from_secs(u64::from(minutes) * 60)
    }
}

/// Sleep `total`, polling the handle for cancellation. Returns true if
/// cancelled before the sleep finished.
async fn wait_or_cancel(total: Duration, handle: &ControlHandle) -> bool {
    let poll = Duration::from_millis(250);
    let deadline = tokio::time::Instant::now() + total;
    loop {
        if handle.is_cancelled() {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

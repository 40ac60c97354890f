//! Flock Engine
//!
//! Action tracking and resumable execution for bulk relationship
//! automation against a social-graph surface. The engine guarantees
//! that it never repeats, loses, or runs away with an action.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       RuleScheduler                          │
//! │   weighted strategy selection · active hours · daily caps    │
//! └────────────────────────────┬─────────────────────────────────┘
//!                              │ per-run quota
//! ┌────────────────────────────▼─────────────────────────────────┐
//! │                        ActionRunner                          │
//! │   rate governor · circuit breaker · pause/cancel · dry-run   │
//! └───────┬──────────────────────────────────────────┬───────────┘
//!         │ outcomes                                 │ actions
//! ┌───────▼───────────┐                    ┌─────────▼──────────┐
//! │  SessionManager   │                    │   ActionSurface    │
//! │  checkpointed,    │                    │   (external)       │
//! │  resumable items  │                    └────────────────────┘
//! └───────┬───────────┘
//! ┌───────▼──────────────────────────────────────────────────────┐
//! │  SQLite stores: action ledger · snapshots · time series      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Guarantees
//!
//! - The action ledger is append-only and is the sole source of truth
//!   for "am I currently following this user".
//! - A batch session interrupted at any point resumes from its pending
//!   items and is behaviorally indistinguishable from an uninterrupted
//!   run.
//! - The execution loop halts after a configurable number of
//!   consecutive failures rather than retrying indefinitely.

#![warn(clippy::all)]

pub mod breaker;
pub mod detect;
pub mod exec;
pub mod filters;
pub mod notify;
pub mod rate;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod surface;

pub use breaker::FailureBreaker;
pub use detect::{ChangeDetector, DetectionReport};
pub use exec::{ActionRunner, BatchReport, ControlHandle, ExecState, RunOutcome, RunnerOptions};
pub use filters::FilterSet;
pub use notify::{Notifier, NullNotifier, WebhookNotifier};
pub use rate::RateGovernor;
pub use scheduler::{Rule, RuleScheduler, SchedulerStats, Strategy};
pub use session::{ItemStatus, Session, SessionItem, SessionManager, SessionStatus};
pub use store::ledger::{ActionKind, ActionRecord, CachedProfile, WhitelistEntry};
pub use store::snapshot::{MemberKind, SnapshotDiff, SnapshotMeta};
pub use store::Database;
pub use surface::{ActionSurface, StaticSurface, SurfaceError};

//! End-to-end flows through the public engine API.

use std::sync::Arc;

use flock_common::config::{DetectionConfig, EngineConfig};
use flock_engine::notify::RecordingNotifier;
use flock_engine::surface::SurfaceCall;
use flock_engine::{
    ActionKind, ActionRunner, ActionSurface, ChangeDetector, ControlHandle, Database, MemberKind,
    RunOutcome, RunnerOptions, StaticSurface,
};

fn fast_config() -> EngineConfig {
    EngineConfig {
        min_action_delay_secs: 0,
        max_action_delay_secs: 0,
        rate_limit_cooldown_secs: 0,
        ..Default::default()
    }
}

fn users(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// A batch unfollow that is interrupted mid-way resumes and finishes
/// with the same end state as an uninterrupted run, skipping the
/// whitelisted user both times.
#[tokio::test]
async fn interrupted_unfollow_batch_resumes_cleanly() {
    let db = Database::in_memory().unwrap();
    let surface = Arc::new(StaticSurface::new());
    for u in ["u1", "u2", "u3", "u4"] {
        surface.set_following(u);
        db.ledger()
            .record_action(u, ActionKind::Follow, Some("import"), None, None)
            .unwrap();
    }
    db.ledger().whitelist_add("u2", Some("mutual")).unwrap();

    let runner = ActionRunner::new(&db, Arc::clone(&surface) as _, fast_config());

    // First run stops after one performed action.
    let first = runner
        .run_batch(
            ActionKind::Unfollow,
            &users(&["u1", "u2", "u3", "u4"]),
            &ControlHandle::new(),
            &RunnerOptions {
                max_actions: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(first.outcome, RunOutcome::QuantityReached);

    // Second run resumes the same session to completion.
    let second = runner
        .run_batch(
            ActionKind::Unfollow,
            &[],
            &ControlHandle::new(),
            &RunnerOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(second.outcome, RunOutcome::Completed);

    // u2 was protected; everyone else was unfollowed exactly once.
    let calls = surface.calls();
    let unfollows: Vec<_> = calls
        .iter()
        .filter(|c| matches!(c, SurfaceCall::Unfollow(_)))
        .collect();
    assert_eq!(unfollows.len(), 3);
    assert!(surface.is_following("u2").await.unwrap());

    assert!(db.ledger().is_currently_following("u2").unwrap());
    for u in ["u1", "u3", "u4"] {
        assert!(!db.ledger().is_currently_following(u).unwrap());
    }

    let session = runner
        .sessions()
        .store()
        .get_session(&first.session_id)
        .unwrap()
        .unwrap();
    assert_eq!(session.success_count, 3);
    assert_eq!(session.skipped_count, 1);
    assert_eq!(session.remaining(), 0);
}

/// Follows performed by the runner show up as reconciled follow-backs
/// once a detection pass sees the user following back.
#[tokio::test]
async fn follow_then_detect_reconciles_follow_back() {
    let db = Database::in_memory().unwrap();
    let surface = Arc::new(StaticSurface::new());
    let notifier = Arc::new(RecordingNotifier::new());

    // Baseline: nobody follows us yet.
    surface.set_members("me", MemberKind::Followers, vec![]);
    let detector = ChangeDetector::new(
        &db,
        Arc::clone(&surface) as _,
        Arc::clone(&notifier) as _,
        DetectionConfig::default(),
        "me",
    );
    detector.run_pass().await.unwrap();

    let runner = ActionRunner::new(&db, Arc::clone(&surface) as _, fast_config());
    let report = runner
        .run_batch(
            ActionKind::Follow,
            &users(&["alice"]),
            &ControlHandle::new(),
            &RunnerOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(report.success_count, 1);

    // alice follows back before the next pass.
    surface.set_members("me", MemberKind::Followers, users(&["alice"]));
    let report = detector.run_pass().await.unwrap();

    assert_eq!(report.new_followers, users(&["alice"]));
    assert_eq!(report.reconciled, 1);
    assert!(notifier
        .event_names()
        .contains(&"new_follower".to_string()));

    let history = db.ledger().history("alice").unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].followed_back);
    assert!(history[0].followed_back_at.is_some());

    // Aged-unfollow selection now excludes alice when asked to spare
    // follow-backs.
    let spared = db.ledger().follows_older_than(-1, true).unwrap();
    assert!(spared.is_empty());
    let all = db.ledger().follows_older_than(-1, false).unwrap();
    assert_eq!(all.len(), 1);
}

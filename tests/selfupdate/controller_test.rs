//! Self-update decision and apply ordering.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use guildsync::selfupdate::{SelfUpdater, UpdateError, UpdateOutcome};

use crate::fakes::{calls, image, CallLog, FakeEngine, FakeRegistry, HangingEngine};

fn updater(log: &CallLog, remote: &str, engine: FakeEngine) -> SelfUpdater {
    let registry = FakeRegistry {
        digest: Some(remote.to_owned()),
        log: Arc::clone(log),
    };
    SelfUpdater::new(Arc::new(registry), Arc::new(engine), image())
}

#[tokio::test]
async fn matching_digests_are_a_no_op() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut engine = FakeEngine::new(Arc::clone(&log));
    engine.local = Some("sha256:AAA".to_owned());

    let outcome = updater(&log, "sha256:AAA", engine)
        .check_and_apply()
        .await
        .expect("pass");

    assert_eq!(outcome, UpdateOutcome::UpToDate);
    assert_eq!(calls(&log), vec!["remote_digest", "local_digest"]);
}

#[tokio::test]
async fn differing_digest_pulls_then_restarts() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut engine = FakeEngine::new(Arc::clone(&log));
    engine.local = Some("sha256:BBB".to_owned());

    let outcome = updater(&log, "sha256:AAA", engine)
        .check_and_apply()
        .await
        .expect("pass");

    assert_eq!(
        outcome,
        UpdateOutcome::Restarted {
            container_id: "0123456789abcdef0123".to_owned()
        }
    );
    assert_eq!(
        calls(&log),
        vec![
            "remote_digest",
            "local_digest",
            "pull ghcr.io/guildsync/guildsync:latest",
            "find_container",
            "restart 0123456789abcdef0123 t=10",
        ]
    );
}

#[tokio::test]
async fn absent_local_image_triggers_update() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let engine = FakeEngine::new(Arc::clone(&log));

    let outcome = updater(&log, "sha256:AAA", engine)
        .with_restart_grace(3)
        .check_and_apply()
        .await
        .expect("pass");

    assert!(matches!(outcome, UpdateOutcome::Restarted { .. }));
    assert!(calls(&log).contains(&"restart 0123456789abcdef0123 t=3".to_owned()));
}

#[tokio::test]
async fn missing_target_container_is_terminal_and_skips_restart() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut engine = FakeEngine::new(Arc::clone(&log));
    engine.local = Some("sha256:BBB".to_owned());
    engine.container = None;

    let err = updater(&log, "sha256:AAA", engine)
        .check_and_apply()
        .await
        .expect_err("no target container");

    assert!(matches!(err, UpdateError::NoTargetContainer { .. }));
    assert!(err.is_terminal());
    assert!(!calls(&log).iter().any(|c| c.starts_with("restart")));
}

#[tokio::test]
async fn restart_failure_is_terminal() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut engine = FakeEngine::new(Arc::clone(&log));
    engine.restart_fails = true;

    let err = updater(&log, "sha256:AAA", engine)
        .check_and_apply()
        .await
        .expect_err("restart fails");

    assert!(matches!(err, UpdateError::RestartFailed { .. }));
    assert!(err.is_terminal());
}

#[tokio::test]
async fn pull_error_event_aborts_before_listing_containers() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut engine = FakeEngine::new(Arc::clone(&log));
    engine.pull_error = Some("manifest unknown".to_owned());

    let err = updater(&log, "sha256:AAA", engine)
        .check_and_apply()
        .await
        .expect_err("pull fails");

    assert!(matches!(err, UpdateError::Pull(_)));
    assert!(!err.is_terminal());
    assert!(!calls(&log).contains(&"find_container".to_owned()));
}

#[tokio::test]
async fn registry_failure_touches_nothing_local() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let registry = FakeRegistry {
        digest: None,
        log: Arc::clone(&log),
    };
    let engine = FakeEngine::new(Arc::clone(&log));
    let updater = SelfUpdater::new(Arc::new(registry), Arc::new(engine), image());

    let err = updater.check_and_apply().await.expect_err("registry fails");

    assert!(matches!(err, UpdateError::Registry(_)));
    assert!(!err.is_terminal());
    assert_eq!(calls(&log), vec!["remote_digest"]);
}

#[tokio::test]
async fn check_reports_decision_without_side_effects() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut engine = FakeEngine::new(Arc::clone(&log));
    engine.local = Some("sha256:BBB".to_owned());

    let check = updater(&log, "sha256:AAA", engine)
        .check()
        .await
        .expect("check");

    assert!(!check.is_current());
    assert_eq!(check.remote.as_str(), "sha256:AAA");
    assert_eq!(calls(&log), vec!["remote_digest", "local_digest"]);
}

#[tokio::test(start_paused = true)]
async fn pass_is_bounded_by_deadline() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let registry = FakeRegistry {
        digest: Some("sha256:AAA".to_owned()),
        log: Arc::clone(&log),
    };
    let updater = SelfUpdater::new(Arc::new(registry), Arc::new(HangingEngine), image())
        .with_deadline(Duration::from_secs(300));

    let err = updater.check_and_apply().await.expect_err("deadline elapses");

    assert!(matches!(err, UpdateError::DeadlineExceeded(_)));
    assert!(!err.is_terminal());
}

#[tokio::test(start_paused = true)]
async fn deadline_during_restart_after_pull_is_terminal() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut engine = FakeEngine::new(Arc::clone(&log));
    engine.local = Some("sha256:BBB".to_owned());
    engine.restart_hangs = true;

    let err = updater(&log, "sha256:AAA", engine)
        .with_deadline(Duration::from_secs(300))
        .check_and_apply()
        .await
        .expect_err("restart never completes");

    assert!(matches!(err, UpdateError::RestartTimedOut(_)));
    assert!(err.is_terminal());
    assert!(calls(&log).contains(&"pull ghcr.io/guildsync/guildsync:latest".to_owned()));
}

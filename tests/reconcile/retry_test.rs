//! Bounded retry of transient profile fetches.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use guildsync::reconcile::RosterReconciler;
use guildsync::retry::{retry_transient, RetryError, RetryPolicy, Transient};

use crate::fakes::{profile, record, Behavior, FakeRoster, MemoryStore, GUILD, REALM};

#[derive(Debug)]
struct TestError {
    transient: bool,
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test error (transient={})", self.transient)
    }
}

impl Transient for TestError {
    fn is_transient(&self) -> bool {
        self.transient
    }
}

#[test]
fn default_policy_is_three_attempts_with_linear_backoff() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.max_attempts(), 3);
    assert_eq!(policy.backoff(1), Duration::from_millis(100));
    assert_eq!(policy.backoff(2), Duration::from_millis(200));
}

#[test]
fn zero_attempts_is_clamped_to_one() {
    assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_sleeps_attempt_times_unit_between_tries() {
    let calls = AtomicU32::new(0);
    let start = tokio::time::Instant::now();

    let result: Result<(), RetryError<TestError>> =
        retry_transient(&RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { transient: true }) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "waited {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "waited {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn non_transient_error_stops_immediately() {
    let calls = AtomicU32::new(0);

    let result: Result<(), RetryError<TestError>> =
        retry_transient(&RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { transient: false }) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(result, Err(RetryError::Failed { attempt: 1, .. })));
}

#[tokio::test(start_paused = true)]
async fn success_after_transient_failure_is_returned() {
    let result: Result<u32, RetryError<TestError>> =
        retry_transient(&RetryPolicy::default(), |attempt| async move {
            if attempt < 2 {
                Err(TestError { transient: true })
            } else {
                Ok(attempt)
            }
        })
        .await;

    assert!(matches!(result, Ok(2)));
}

#[tokio::test(start_paused = true)]
async fn member_without_response_is_tried_three_times_then_skipped() {
    let roster = Arc::new(FakeRoster::with_members(&[(1, "Aelis"), (2, "Borin")]));
    roster.script("Borin", vec![Behavior::NoResponse]);
    let stored = record(2, "Borin");
    let store = Arc::new(MemoryStore::with_records(vec![stored.clone()]));

    let reconciler = RosterReconciler::new(
        Arc::clone(&roster) as _,
        Arc::clone(&store) as _,
        GUILD,
        REALM,
    );
    let report = reconciler.reconcile().await.expect("pass");

    assert_eq!(roster.calls("Borin"), 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(store.get("2"), Some(stored));
}

#[tokio::test(start_paused = true)]
async fn transient_failure_then_success_writes_the_record() {
    let roster = Arc::new(FakeRoster::with_members(&[(5, "Ember")]));
    roster.script(
        "Ember",
        vec![
            Behavior::NoResponse,
            Behavior::Profile(profile(5, "Ember", REALM)),
        ],
    );
    let store = Arc::new(MemoryStore::new());

    let reconciler = RosterReconciler::new(
        Arc::clone(&roster) as _,
        Arc::clone(&store) as _,
        GUILD,
        REALM,
    );
    let report = reconciler.reconcile().await.expect("pass");

    assert_eq!(roster.calls("Ember"), 2);
    assert_eq!(report.created, 1);
    assert_eq!(report.skipped, 0);
}

#[tokio::test(start_paused = true)]
async fn custom_policy_bounds_attempts() {
    let roster = Arc::new(FakeRoster::with_members(&[(1, "Aelis")]));
    roster.script("Aelis", vec![Behavior::NoResponse]);
    let store = Arc::new(MemoryStore::new());

    let reconciler = RosterReconciler::new(
        Arc::clone(&roster) as _,
        Arc::clone(&store) as _,
        GUILD,
        REALM,
    )
    .with_retry_policy(RetryPolicy::new(5, Duration::from_millis(10)));
    let report = reconciler.reconcile().await.expect("pass");

    assert_eq!(roster.calls("Aelis"), 5);
    assert_eq!(report.skipped, 1);
    assert!(store.ids().is_empty());
}

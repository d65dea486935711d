use std::sync::{Arc, Mutex};
use std::time::Duration;

use stampede::cache::{
    CacheConfig, CacheScope, MutateOptions, Producer, ProducerError, QueryState, UpdaterError,
};

fn unreachable_producer() -> Producer<u32> {
    Producer::new(|| async { Err(ProducerError::msg("producer must not run")) })
}

#[tokio::test]
async fn increment_reaches_every_subscriber() {
    let scope = CacheScope::with_entries(CacheConfig::default(), [("/counter", 1_u32)]);
    let first = scope.observe_with("/counter", unreachable_producer());
    let second = scope.observe_with("/counter", unreachable_producer());
    assert_eq!(first.state(), QueryState::Success(1));

    let written = scope
        .mutation("/counter")
        .mutate(|previous| async move { Ok(previous.map(|value| value + 1)) })
        .await
        .expect("updater succeeds");

    assert_eq!(written, Some(2));
    assert_eq!(scope.peek(&"/counter"), Some(2));
    assert_eq!(first.state(), QueryState::Success(2));
    assert_eq!(second.state(), QueryState::Success(2));
    assert_eq!(scope.in_flight(), 0);
}

#[tokio::test]
async fn rejected_updater_leaves_cache_and_observers_alone() {
    let scope = CacheScope::with_entries(CacheConfig::default(), [("/counter", 1_u32)]);
    let observer = scope.observe_with("/counter", unreachable_producer());

    let error = scope
        .mutation("/counter")
        .mutate(|_| async { Err(UpdaterError::msg("validation failed")) })
        .await
        .expect_err("updater rejects");

    assert_eq!(error.to_string(), "validation failed");
    assert_eq!(scope.peek(&"/counter"), Some(1));
    assert_eq!(observer.state(), QueryState::Success(1));
}

#[tokio::test]
async fn rejected_updater_on_unset_key_keeps_it_unset() {
    let scope = CacheScope::<&str, u32>::new(CacheConfig::default());

    let outcome = scope
        .mutate(
            "/missing",
            |_| async { Err(UpdaterError::msg("nope")) },
            MutateOptions::new(),
        )
        .await;

    assert!(outcome.is_err());
    assert!(scope.peek(&"/missing").is_none());
}

#[tokio::test]
async fn declining_updater_writes_nothing() {
    let scope = CacheScope::with_entries(CacheConfig::default(), [("/counter", 5_u32)]);

    let outcome = scope
        .mutation("/counter")
        .mutate(|_| async { Ok(None) })
        .await
        .expect("updater succeeds");

    assert_eq!(outcome, None);
    assert_eq!(scope.peek(&"/counter"), Some(5));
}

#[tokio::test]
async fn success_hook_runs_before_observers_are_notified() {
    let scope = CacheScope::with_entries(CacheConfig::default(), [("/counter", 1_u32)]);
    let observer = scope.observe_with("/counter", unreachable_producer());
    let observed_in_hook = Arc::new(Mutex::new(None));

    let watch = observer.watch();
    let seen = Arc::clone(&observed_in_hook);
    let options = MutateOptions::new().on_success(move |value: &u32, store| {
        let during = (*value, store.get(&"/counter"), watch.borrow().clone());
        *seen.lock().expect("hook lock") = Some(during);
    });

    scope
        .mutate(
            "/counter",
            |previous| async move { Ok(previous.map(|value| value * 10)) },
            options,
        )
        .await
        .expect("updater succeeds");

    let (value, stored, state) = observed_in_hook
        .lock()
        .expect("hook lock")
        .clone()
        .expect("hook ran");
    assert_eq!(value, 10);
    assert_eq!(stored, Some(10));
    assert_eq!(state, QueryState::Success(1));
    assert_eq!(observer.state(), QueryState::Success(10));
}

#[tokio::test]
async fn detached_observers_are_not_notified() {
    let scope = CacheScope::with_entries(CacheConfig::default(), [("/counter", 1_u32)]);
    let kept = scope.observe_with("/counter", unreachable_producer());
    let detached = scope.observe_with("/counter", unreachable_producer());
    let detached_watch = detached.watch();
    drop(detached);
    assert_eq!(scope.subscriber_count(&"/counter"), 1);

    scope.mutation("/counter").set(7).await;

    assert_eq!(kept.state(), QueryState::Success(7));
    assert_eq!(*detached_watch.borrow(), QueryState::Success(1));
}

#[tokio::test(start_paused = true)]
async fn mutation_recovers_failed_observers() {
    let scope = CacheScope::<&str, u32>::new(CacheConfig::default());
    let mut observer = scope.observe("/counter", || async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err(ProducerError::msg("offline"))
    });
    assert!(matches!(observer.settled().await, QueryState::Error(_)));

    let written = scope
        .mutation("/counter")
        .update(|previous| Some(previous.unwrap_or_default() + 1))
        .await;

    assert_eq!(written, Some(1));
    assert_eq!(observer.state(), QueryState::Success(1));

    // A successful write clears the failure history, so a fresh key observer
    // is served from the cache instead of the held error.
    let late = scope.observe_with("/counter", unreachable_producer());
    assert_eq!(late.state(), QueryState::Success(1));
}

#[tokio::test]
async fn mutations_on_other_keys_do_not_disturb_observers() {
    let scope = CacheScope::with_entries(CacheConfig::default(), [("/a", 1_u32), ("/b", 2)]);
    let on_a = scope.observe_with("/a", unreachable_producer());

    scope.mutation("/b").set(20).await;

    assert_eq!(on_a.state(), QueryState::Success(1));
    assert_eq!(scope.peek(&"/b"), Some(20));
}

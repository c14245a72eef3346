
use std::time::Duration;

use cron_lite::error::CronError;
use cron_lite::keys::Keyspace;
use cron_lite::store::CoordinationStore;
use cron_lite::worker::JobLock;
use test_harness::{assert_eventually, test_store};

const TTL: Duration = Duration::from_millis(300);

#[tokio::test]
async fn test_lock_and_unlock() {
    let (memory, store) = test_store();
    let keys = Keyspace::default();
    let mut lock = JobLock::new(store.clone(), &keys, "backup", TTL);

    lock.try_lock().await.unwrap();
    assert!(lock.is_locked());
    assert!(lock.lease_id().is_some());

    let snapshot = store.get_prefix(&keys.lock_key("backup")).await.unwrap();
    assert_eq!(snapshot.kvs.len(), 1);
    assert_eq!(snapshot.kvs[0].lease, lock.lease_id());

    lock.unlock().await;
    assert!(!lock.is_locked());
    let snapshot = store.get_prefix(&keys.lock_key("backup")).await.unwrap();
    assert!(snapshot.kvs.is_empty());
    assert_eq!(memory.lease_count().await, 0);
}

#[tokio::test]
async fn test_second_holder_is_rejected() {
    let (memory, store) = test_store();
    let keys = Keyspace::default();
    let mut first = JobLock::new(store.clone(), &keys, "backup", TTL);
    let mut second = JobLock::new(store.clone(), &keys, "backup", TTL);

    first.try_lock().await.unwrap();
    let err = second.try_lock().await.unwrap_err();

    assert!(matches!(err, CronError::LockAlreadyHeld(ref name) if name == "backup"));
    assert!(err.is_lock_contention());
    assert!(!second.is_locked());
    // The losing attempt's lease was revoked.
    assert_eq!(memory.lease_count().await, 1);

    first.unlock().await;
    second.try_lock().await.unwrap();
    assert!(second.is_locked());
    second.unlock().await;
}

#[tokio::test]
async fn test_different_jobs_lock_independently() {
    let (_memory, store) = test_store();
    let keys = Keyspace::default();
    let mut a = JobLock::new(store.clone(), &keys, "a", TTL);
    let mut b = JobLock::new(store.clone(), &keys, "b", TTL);

    a.try_lock().await.unwrap();
    b.try_lock().await.unwrap();

    a.unlock().await;
    b.unlock().await;
}

#[tokio::test]
async fn test_held_lock_survives_past_ttl() {
    let (_memory, store) = test_store();
    let keys = Keyspace::default();
    let mut lock = JobLock::new(store.clone(), &keys, "long", TTL);
    lock.try_lock().await.unwrap();

    // Renewal keeps the key alive well beyond one TTL.
    tokio::time::sleep(TTL * 4).await;

    let snapshot = store.get_prefix(&keys.lock_key("long")).await.unwrap();
    assert_eq!(snapshot.kvs.len(), 1);
    lock.unlock().await;
}

#[tokio::test]
async fn test_dropped_lock_expires_after_ttl() {
    let (_memory, store) = test_store();
    let keys = Keyspace::default();

    {
        let mut crashed = JobLock::new(store.clone(), &keys, "crashy", TTL);
        crashed.try_lock().await.unwrap();
        // Dropped without unlock, as if the worker died mid-run.
    }

    let mut next = JobLock::new(store.clone(), &keys, "crashy", TTL);
    assert!(matches!(
        next.try_lock().await,
        Err(CronError::LockAlreadyHeld(_))
    ));

    let key = keys.lock_key("crashy");
    let probe = store.clone();
    assert_eventually(
        || {
            let probe = probe.clone();
            let key = key.clone();
            async move { probe.get_prefix(&key).await.unwrap().kvs.is_empty() }
        },
        TTL * 5,
        "abandoned lock should expire",
    )
    .await;

    next.try_lock().await.unwrap();
    next.unlock().await;
}

#[tokio::test]
async fn test_unlock_without_lock_is_noop() {
    let (memory, store) = test_store();
    let mut lock = JobLock::new(store, &Keyspace::default(), "idle", TTL);

    lock.unlock().await;

    assert!(!lock.is_locked());
    assert_eq!(lock.job_name(), "idle");
    assert_eq!(memory.lease_count().await, 0);
}

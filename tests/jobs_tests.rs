
use std::time::Duration;

use cron_lite::error::CronError;
use cron_lite::jobs::JobStore;
use cron_lite::keys::Keyspace;
use cron_lite::scheduler::Job;
use cron_lite::store::{CoordinationStore, WatchEventKind};
use test_harness::{assert_eventually, test_store};

#[tokio::test]
async fn test_save_returns_previous_definition() {
    let (_memory, store) = test_store();
    let jobs = JobStore::new(store, Keyspace::default());

    let v1 = Job::new("backup", "echo v1", "0 */5 * * * *");
    let v2 = Job::new("backup", "echo v2", "0 */10 * * * *");

    assert_eq!(jobs.save(&v1).await.unwrap(), None);
    assert_eq!(jobs.save(&v2).await.unwrap(), Some(v1));
    assert_eq!(jobs.list().await.unwrap(), vec![v2]);
}

#[tokio::test]
async fn test_save_rejects_invalid_jobs() {
    let (_memory, store) = test_store();
    let jobs = JobStore::new(store, Keyspace::default());

    let bad_cron = jobs.save(&Job::new("a", "echo a", "whenever")).await;
    assert!(matches!(bad_cron, Err(CronError::InvalidCron { .. })));

    let bad_name = jobs.save(&Job::new("a/b", "echo a", "* * * * * *")).await;
    assert!(matches!(bad_name, Err(CronError::InvalidJob(_))));

    assert!(jobs.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_returns_removed_definition() {
    let (_memory, store) = test_store();
    let jobs = JobStore::new(store, Keyspace::default());
    let job = Job::new("tmp", "rm -rf /tmp/cache", "0 0 * * * *");
    jobs.save(&job).await.unwrap();

    assert_eq!(jobs.delete("tmp").await.unwrap(), Some(job));
    assert_eq!(jobs.delete("tmp").await.unwrap(), None);
}

#[tokio::test]
async fn test_list_skips_undecodable_entries() {
    let (_memory, store) = test_store();
    let keys = Keyspace::default();
    let jobs = JobStore::new(store.clone(), keys.clone());

    jobs.save(&Job::new("b", "echo b", "* * * * * *")).await.unwrap();
    jobs.save(&Job::new("a", "echo a", "* * * * * *")).await.unwrap();
    store
        .put(&keys.job_key("broken"), b"[1,2,3]".to_vec(), None)
        .await
        .unwrap();

    let names: Vec<_> = jobs
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.name)
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn test_kill_writes_short_lived_marker() {
    let (_memory, store) = test_store();
    let keys = Keyspace::default();
    let jobs = JobStore::new(store.clone(), keys.clone());
    let mut events = store.watch_prefix(&keys.killer_prefix(), 1).await.unwrap();

    jobs.kill("stuck").await.unwrap();

    let put = events.recv().await.unwrap();
    assert_eq!(put.kind, WatchEventKind::Put);
    assert_eq!(put.key, "/cron/killer/stuck");
    assert!(put.value.is_empty());

    let probe = store.clone();
    let prefix = keys.killer_prefix();
    assert_eventually(
        || {
            let probe = probe.clone();
            let prefix = prefix.clone();
            async move { probe.get_prefix(&prefix).await.unwrap().kvs.is_empty() }
        },
        Duration::from_secs(3),
        "kill marker should expire with its lease",
    )
    .await;
}

#[tokio::test]
async fn test_list_workers_returns_ips() {
    let (_memory, store) = test_store();
    let keys = Keyspace::default();
    let jobs = JobStore::new(store.clone(), keys.clone());
    let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();

    store
        .put(&keys.worker_key("10.0.0.2"), b"online".to_vec(), Some(lease.id))
        .await
        .unwrap();
    store
        .put(&keys.worker_key("10.0.0.1"), b"online".to_vec(), Some(lease.id))
        .await
        .unwrap();

    assert_eq!(
        jobs.list_workers().await.unwrap(),
        vec!["10.0.0.1", "10.0.0.2"]
    );
}

#[tokio::test]
async fn test_custom_root_isolates_keyspaces() {
    let (_memory, store) = test_store();
    let prod = JobStore::new(store.clone(), Keyspace::new("/prod/"));
    let staging = JobStore::new(store, Keyspace::new("/staging/"));

    prod.save(&Job::new("a", "echo prod", "* * * * * *")).await.unwrap();

    assert_eq!(prod.list().await.unwrap().len(), 1);
    assert!(staging.list().await.unwrap().is_empty());
}

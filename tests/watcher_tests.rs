
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron_lite::jobs::JobStore;
use cron_lite::keys::Keyspace;
use cron_lite::scheduler::{Job, Scheduler};
use cron_lite::store::{CoordinationStore, MemoryStore};
use cron_lite::worker::JobWatcher;
use test_harness::{spawn_log_sink, test_executor, test_store};
use tokio_util::sync::CancellationToken;

/// A hand-driven scheduler fed by a real watcher.
struct Fixture {
    memory: MemoryStore,
    store: Arc<dyn CoordinationStore>,
    jobs: JobStore,
    scheduler: Scheduler,
    watcher: JobWatcher,
}

fn fixture() -> Fixture {
    let (memory, store) = test_store();
    let logs = spawn_log_sink(&Default::default(), CancellationToken::new());
    let (scheduler, handle) = Scheduler::new(test_executor(store.clone()), logs.handle);
    let watcher = JobWatcher::new(
        store.clone(),
        Keyspace::default(),
        handle,
        Duration::from_millis(50),
    );
    Fixture {
        memory,
        jobs: JobStore::new(store.clone(), Keyspace::default()),
        store,
        scheduler,
        watcher,
    }
}

/// Keep applying incoming events until `done` holds.
async fn settle<F>(scheduler: &mut Scheduler, done: F, message: &str)
where
    F: Fn(&Scheduler) -> bool,
{
    for _ in 0..150 {
        scheduler.apply_pending_events(Utc::now());
        if done(scheduler) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{}", message);
}

#[tokio::test]
async fn test_bootstrap_replays_existing_jobs() {
    let mut f = fixture();
    f.jobs.save(&Job::new("a", "echo a", "*/5 * * * * *")).await.unwrap();
    f.jobs.save(&Job::new("b", "echo b", "*/7 * * * * *")).await.unwrap();
    // Malformed definitions are skipped, not fatal.
    f.store
        .put(&Keyspace::default().job_key("junk"), b"{not json".to_vec(), None)
        .await
        .unwrap();

    let revision = f.watcher.bootstrap().await.unwrap();
    assert_eq!(revision, f.memory.revision().await);

    assert_eq!(f.scheduler.apply_pending_events(Utc::now()), 2);
    assert_eq!(f.scheduler.plan_count(), 2);
    assert!(f.scheduler.plan("a").is_some());
    assert!(f.scheduler.plan("b").is_some());
}

#[tokio::test]
async fn test_changes_after_start_are_streamed() {
    let mut f = fixture();
    f.jobs.save(&Job::new("a", "echo a", "*/5 * * * * *")).await.unwrap();

    let shutdown = CancellationToken::new();
    let task = f.watcher.clone().start(shutdown.clone()).await.unwrap();

    f.jobs.save(&Job::new("b", "echo b", "*/5 * * * * *")).await.unwrap();
    f.jobs.save(&Job::new("a", "echo a2", "*/5 * * * * *")).await.unwrap();
    f.jobs.delete("b").await.unwrap();

    settle(
        &mut f.scheduler,
        |s| {
            s.plan("b").is_none()
                && s.plan("a").is_some_and(|p| p.job.command == "echo a2")
        },
        "updates and deletes should reach the scheduler",
    )
    .await;
    assert_eq!(f.scheduler.plan_count(), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("watcher should stop on shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_bootstrap_and_watch_do_not_duplicate_or_miss() {
    let mut f = fixture();
    f.jobs.save(&Job::new("a", "echo a", "*/5 * * * * *")).await.unwrap();

    let revision = f.watcher.bootstrap().await.unwrap();
    // Written between listing and watching: must still be seen.
    f.jobs.delete("a").await.unwrap();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(f.watcher.clone().run(revision + 1, shutdown.clone()));

    settle(
        &mut f.scheduler,
        |s| s.plan_count() == 0,
        "delete written after the listing should be replayed",
    )
    .await;

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_malformed_update_is_skipped() {
    let mut f = fixture();
    let shutdown = CancellationToken::new();
    let _task = f.watcher.clone().start(shutdown.clone()).await.unwrap();

    f.store
        .put(&Keyspace::default().job_key("bad"), b"garbage".to_vec(), None)
        .await
        .unwrap();
    f.jobs.save(&Job::new("good", "echo ok", "*/5 * * * * *")).await.unwrap();

    settle(
        &mut f.scheduler,
        |s| s.plan("good").is_some(),
        "watch should continue past a malformed job",
    )
    .await;
    assert!(f.scheduler.plan("bad").is_none());
    shutdown.cancel();
}

#[tokio::test]
async fn test_kill_request_cancels_running_execution() {
    let mut f = fixture();
    f.jobs.save(&Job::new("long", "sleep 10", "* * * * * *")).await.unwrap();

    let shutdown = CancellationToken::new();
    let _task = f.watcher.clone().start(shutdown.clone()).await.unwrap();
    f.scheduler.apply_pending_events(Utc::now());

    let due = f.scheduler.plan("long").unwrap().next_time;
    f.scheduler.try_schedule(due);
    assert!(f.scheduler.executing("long").is_some());

    f.jobs.kill("long").await.unwrap();

    settle(
        &mut f.scheduler,
        |s| s.executing("long").is_some_and(|r| r.cancel.is_cancelled()),
        "kill marker should cancel the running execution",
    )
    .await;

    let finished = f.scheduler.handle_next_result(Duration::from_secs(5)).await;
    assert_eq!(finished.as_deref(), Some("long"));
    // The marker's lease deletes it again; that delete is not a job event.
    assert!(f.scheduler.plan("long").is_some());
    shutdown.cancel();
}

#[tokio::test]
async fn test_watch_is_reestablished_after_stream_loss() {
    let mut f = fixture();
    let shutdown = CancellationToken::new();
    let _task = f.watcher.clone().start(shutdown.clone()).await.unwrap();

    f.jobs.save(&Job::new("before", "echo 1", "*/5 * * * * *")).await.unwrap();
    settle(
        &mut f.scheduler,
        |s| s.plan("before").is_some(),
        "initial watch should deliver",
    )
    .await;

    // Connection drop: every stream closes. A write lands before the watcher
    // has re-opened and must be replayed from the last seen revision.
    f.memory.close_watches().await;
    f.jobs.save(&Job::new("during", "echo 2", "*/5 * * * * *")).await.unwrap();

    settle(
        &mut f.scheduler,
        |s| s.plan("during").is_some(),
        "write made while the watch was down should be replayed",
    )
    .await;

    f.jobs.delete("before").await.unwrap();
    settle(
        &mut f.scheduler,
        |s| s.plan("before").is_none(),
        "re-established watch should keep delivering",
    )
    .await;
    shutdown.cancel();
}

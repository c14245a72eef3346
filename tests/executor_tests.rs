
use std::sync::Arc;
use std::time::Duration;

use cron_lite::error::CronError;
use cron_lite::keys::Keyspace;
use cron_lite::scheduler::Job;
use cron_lite::store::CoordinationStore;
use test_harness::{record_for, test_executor, test_store};
use tokio::sync::mpsc;

fn job(command: &str) -> Job {
    Job::new("exec-test", command, "* * * * * *")
}

fn output_text(output: &[u8]) -> String {
    String::from_utf8_lossy(output).into_owned()
}

#[tokio::test]
async fn test_execute_simple_command() {
    let (_memory, store) = test_store();
    let executor = test_executor(store);

    let result = executor.run(record_for(job("echo hello"))).await;

    assert_eq!(result.job_name(), "exec-test");
    assert!(result.error.is_none());
    assert_eq!(output_text(&result.output), "hello\n");
    assert!(result.start_time <= result.end_time);
}

#[tokio::test]
async fn test_execute_empty_output() {
    let (_memory, store) = test_store();
    let executor = test_executor(store);

    let result = executor.run(record_for(job("true"))).await;

    assert!(result.error.is_none());
    assert!(result.output.is_empty());
}

#[tokio::test]
async fn test_execute_large_output() {
    let (_memory, store) = test_store();
    let executor = test_executor(store);

    let result = executor.run(record_for(job("seq 1 1000"))).await;

    assert!(result.error.is_none());
    assert_eq!(output_text(&result.output).lines().count(), 1000);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let (_memory, store) = test_store();
    let executor = test_executor(store);

    let result = executor.run(record_for(job("exit 3"))).await;

    assert!(matches!(result.error, Some(CronError::ExitStatus(Some(3)))));
}

#[tokio::test]
async fn test_execute_captures_stderr() {
    let (_memory, store) = test_store();
    let executor = test_executor(store);

    let result = executor
        .run(record_for(job("echo out; echo 'error message' >&2; exit 1")))
        .await;

    let output = output_text(&result.output);
    assert!(output.contains("out"));
    assert!(output.contains("error message"));
    assert!(matches!(result.error, Some(CronError::ExitStatus(Some(1)))));
}

#[tokio::test]
async fn test_execute_keeps_stdout_and_stderr_in_write_order() {
    let (_memory, store) = test_store();
    let executor = test_executor(store);

    let result = executor
        .run(record_for(job("echo a; echo b >&2; echo c; echo d >&2")))
        .await;

    assert!(result.error.is_none());
    assert_eq!(output_text(&result.output), "a\nb\nc\nd\n");
}

#[tokio::test]
async fn test_execute_invalid_command() {
    let (_memory, store) = test_store();
    let executor = test_executor(store);

    let result = executor.run(record_for(job("nonexistent_command_12345"))).await;

    // The shell starts fine and reports "command not found" as 127
    assert!(matches!(result.error, Some(CronError::ExitStatus(Some(127)))));
}

#[tokio::test]
async fn test_execute_missing_shell() {
    let (_memory, store) = test_store();
    let executor = cron_lite::worker::Executor::new(
        store,
        Keyspace::default(),
        test_harness::test_lock_config(),
        "/nonexistent/shell",
    );

    let result = executor.run(record_for(job("echo hi"))).await;

    assert!(matches!(result.error, Some(CronError::Io(_))));
}

#[tokio::test]
async fn test_execute_piped_commands() {
    let (_memory, store) = test_store();
    let executor = test_executor(store);

    let result = executor
        .run(record_for(job("echo 'hello world' | wc -w")))
        .await;

    assert!(result.error.is_none());
    assert_eq!(output_text(&result.output).trim(), "2");
}

#[tokio::test]
async fn test_cancel_kills_running_command() {
    let (_memory, store) = test_store();
    let executor = test_executor(store);
    let record = record_for(job("sleep 10"));
    let cancel = record.cancel.clone();

    let started = tokio::time::Instant::now();
    let run = tokio::spawn({
        let executor = executor.clone();
        async move { executor.run(record).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let result = run.await.unwrap();
    assert!(matches!(result.error, Some(CronError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_lock_released_after_run() {
    let (memory, store) = test_store();
    let executor = test_executor(store.clone());

    let result = executor.run(record_for(job("echo done"))).await;
    assert!(result.error.is_none());

    let key = Keyspace::default().lock_key("exec-test");
    let snapshot = store.get_prefix(&key).await.unwrap();
    assert!(snapshot.kvs.is_empty(), "lock key should be gone after unlock");
    assert_eq!(memory.lease_count().await, 0);
}

#[tokio::test]
async fn test_lock_contention_skips_command() {
    let (_memory, store) = test_store();
    let executor = test_executor(store.clone());

    // Someone else holds the lock.
    let lease = store.grant_lease(Duration::from_secs(30)).await.unwrap();
    let key = Keyspace::default().lock_key("exec-test");
    assert!(store.create_if_absent(&key, Vec::new(), lease.id).await.unwrap());

    let result = executor.run(record_for(job("echo should-not-run"))).await;

    assert!(matches!(result.error, Some(CronError::LockAlreadyHeld(_))));
    assert!(result.output.is_empty());
    assert!(!result.ran());
}

#[tokio::test]
async fn test_execute_reports_once_per_dispatch() {
    let (_memory, store) = test_store();
    let executor = test_executor(store);
    let (tx, mut rx) = mpsc::unbounded_channel();

    executor.execute(record_for(Job::new("a", "echo a", "* * * * * *")), tx.clone());
    executor.execute(record_for(Job::new("b", "exit 1", "* * * * * *")), tx.clone());
    executor.execute(record_for(Job::new("c", "echo c", "* * * * * *")), tx);
    executor.wait_idle().await;

    let mut names = Vec::new();
    while let Ok(result) = rx.try_recv() {
        names.push(result.job_name().to_string());
    }
    names.sort();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(executor.in_flight(), 0);
}

#[tokio::test]
async fn test_distributed_exclusion_between_executors() {
    let (_memory, store) = test_store();
    let first = test_executor(store.clone());
    let second = test_executor(Arc::clone(&store));

    let job = Job::new("shared", "sleep 0.3; echo ran", "* * * * * *");
    let (a, b) = tokio::join!(
        first.run(record_for(job.clone())),
        second.run(record_for(job)),
    );

    let ran = [&a, &b].iter().filter(|r| r.ran()).count();
    assert_eq!(ran, 1, "exactly one worker should run the firing");
    let lost = [&a, &b]
        .iter()
        .filter(|r| matches!(r.error, Some(CronError::LockAlreadyHeld(_))))
        .count();
    assert_eq!(lost, 1);
}

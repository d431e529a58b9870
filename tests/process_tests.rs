#![cfg(unix)]

use orchestra_pool::{Job, PoolConfig, PoolError, ProcessJob, ShutdownMode, WorkerPool};
use std::sync::Arc;
use tokio::runtime::Handle as TokioHandle;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,orchestra_pool=debug"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn new_pool(name: &str, workers: usize) -> Arc<WorkerPool> {
  WorkerPool::new(PoolConfig::new(name).workers(workers), TokioHandle::current())
}

fn shell(script: &str) -> ProcessJob {
  ProcessJob::new("sh").arg("-c").arg(script)
}

#[tokio::test]
async fn test_process_job_adds_arguments() {
  setup_tracing_for_test();
  let pool = new_pool("test_process_add", 2);

  let mut handles = Vec::new();
  for (a, b) in [(2, 3), (10, 32), (-4, 4)] {
    let job = shell("echo $(( $1 + $2 ))").args(["sh".to_string(), a.to_string(), b.to_string()]);
    handles.push(pool.submit(Job::process(job)).await.unwrap());
  }

  let mut sums = Vec::new();
  for handle in handles {
    let output = handle.await_result().await.unwrap();
    assert_eq!(output.exit_code, Some(0));
    assert!(output.stderr.is_empty());
    sums.push(output.stdout);
  }
  assert_eq!(sums, vec!["5\n", "42\n", "0\n"]);

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_process_non_zero_exit_fails_unless_allowed() {
  setup_tracing_for_test();
  let pool = new_pool("test_process_exit_code", 1);

  let failing = pool
    .submit(shell("echo broken >&2; exit 3").into_job())
    .await
    .unwrap();
  match failing.await_result().await {
    Err(PoolError::TaskFailed(message)) => {
      assert!(message.contains("`sh` exited with"), "unexpected message: {}", message);
      assert!(message.ends_with("broken"), "stderr should be reported: {}", message);
    }
    other => panic!("expected TaskFailed, got {:?}", other),
  }

  let tolerated = pool
    .submit(shell("echo partial; exit 3").allow_failure(true).into_job())
    .await
    .unwrap();
  let output = tolerated.await_result().await.unwrap();
  assert_eq!(output.exit_code, Some(3));
  assert_eq!(output.stdout, "partial\n");

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_process_stdin_is_piped_through() {
  setup_tracing_for_test();
  let pool = new_pool("test_process_stdin", 1);

  let handle = pool
    .submit(ProcessJob::new("cat").stdin("line one\nline two\n").into_job())
    .await
    .unwrap();
  let output = handle.await_result().await.unwrap();
  assert_eq!(output.stdout, "line one\nline two\n");

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_process_environment_is_isolated() {
  setup_tracing_for_test();
  let pool = new_pool("test_process_env", 1);
  let key = "ORCHESTRA_POOL_PROCESS_TEST_VALUE";

  let handle = pool
    .submit(
      shell("echo \"in=$ORCHESTRA_POOL_PROCESS_TEST_VALUE\"; export ORCHESTRA_POOL_PROCESS_TEST_VALUE=changed")
        .env(key, "from_parent")
        .into_job(),
    )
    .await
    .unwrap();
  let output = handle.await_result().await.unwrap();

  assert_eq!(output.stdout, "in=from_parent\n");
  assert!(std::env::var(key).is_err(), "child environment must not leak into the pool");

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_process_current_dir_is_applied() {
  setup_tracing_for_test();
  let pool = new_pool("test_process_cwd", 1);
  let dir = std::env::temp_dir().canonicalize().unwrap();

  let handle = pool
    .submit(ProcessJob::new("pwd").arg("-P").current_dir(&dir).into_job())
    .await
    .unwrap();
  let output = handle.await_result().await.unwrap();
  assert_eq!(output.stdout.trim_end(), dir.to_string_lossy());

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_process_spawn_failure_is_a_task_failure() {
  setup_tracing_for_test();
  let pool = new_pool("test_process_spawn_failure", 1);

  let handle = pool
    .submit(ProcessJob::new("/definitely/not/a/real/binary").into_job())
    .await
    .unwrap();
  let task_id = handle.id();
  match handle.await_result().await {
    Err(PoolError::TaskFailed(message)) => assert!(message.starts_with("failed to spawn"), "{}", message),
    other => panic!("task {} expected spawn failure, got {:?}", task_id, other),
  }

  // The worker is free again for the next job.
  let next = pool.submit(shell("true").into_job()).await.unwrap();
  assert_eq!(next.await_result().await.unwrap().exit_code, Some(0));

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

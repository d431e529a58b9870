use orchestra_pool::{
  Job, PoolConfig, PoolError, ShutdownMode, TaskCompletionInfo, TaskCompletionStatus, TaskHandle, WorkerPool,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn sleepy_task(id: usize, delay_ms: u64, should_panic: bool) -> String {
  info!("Task {}: starting, will sleep for {}ms. Panic: {}", id, delay_ms, should_panic);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  if should_panic {
    panic!("Task {} panicked!", id);
  }
  format!("Task {} finished after {}ms", id, delay_ms)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Callbacks and Cancellation Example ---");

  let pool = WorkerPool::new(PoolConfig::new("callback_pool").workers(1), Handle::current());

  let successes = Arc::new(AtomicUsize::new(0));
  let others = Arc::new(AtomicUsize::new(0));
  pool.add_completion_handler({
    let successes = successes.clone();
    let others = others.clone();
    move |info: TaskCompletionInfo| {
      info!(
        "[Handler] Task {} (pool {}, labels {:?}) -> {:?} on thread {:?}",
        info.task_id,
        info.pool_name,
        info.labels,
        info.status,
        std::thread::current().name()
      );
      match info.status {
        TaskCompletionStatus::Success => successes.fetch_add(1, Ordering::SeqCst),
        _ => others.fetch_add(1, Ordering::SeqCst),
      };
    }
  });

  let mut handles: Vec<TaskHandle<String>> = Vec::new();
  for i in 0..3 {
    let job = Job::future(sleepy_task(i, 300, i == 1)).with_label("first_wave");
    handles.push(pool.submit(job).await.unwrap());
  }
  for i in 3..6 {
    let job = Job::future(sleepy_task(i, 300, false)).with_label("second_wave");
    handles.push(pool.submit(job).await.unwrap());
  }

  // Per-task callback, in addition to the pool-wide handler.
  pool.add_completion_callback(&handles[0], |info| {
    info!("[Callback] First task settled with {:?}", info.status);
  });

  tokio::time::sleep(Duration::from_millis(100)).await;

  // Task 0 is running with one worker, so this is rejected.
  info!("Cancel running task {}: {}", handles[0].id(), pool.cancel(&handles[0]));
  // Task 2 has not started yet.
  info!("Cancel queued task {}: {}", handles[2].id(), handles[2].cancel());
  let cancelled = pool.cancel_tasks_by_label(&"second_wave".to_string());
  info!("Cancelled {} task(s) labelled 'second_wave'", cancelled);

  for handle in handles {
    let task_id = handle.id();
    match handle.await_result().await {
      Ok(result) => info!("Task {} result: {}", task_id, result),
      Err(PoolError::TaskCancelled) => info!("Task {} was cancelled before it started.", task_id),
      Err(e) => info!("Task {} error: {}", task_id, e),
    }
  }

  pool
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Pool shutdown failed");
  info!(
    "Handler counted {} success(es) and {} other outcome(s).",
    successes.load(Ordering::SeqCst),
    others.load(Ordering::SeqCst)
  );
  info!("--- Callbacks and Cancellation Example Finished ---");
}

use orchestra_pool::{Job, PoolConfig, ShutdownMode, WorkerPool};
use tokio::runtime::Handle;
use tracing::info;

const TASKS: usize = 8;
const INCREMENTS_PER_TASK: usize = 10_000;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Shared State Example ---");

  let pool = WorkerPool::new(PoolConfig::new("shared_pool").workers(4), Handle::current());

  // 1. A counter every task writes to. Each increment takes the lock.
  let counter = pool.shared_counter(0);
  let mut handles = Vec::new();
  for task_no in 0..TASKS {
    let counter = counter.clone();
    let job = Job::blocking(move || {
      for _ in 0..INCREMENTS_PER_TASK {
        counter.increment();
      }
      task_no
    })
    .with_label("counter");
    handles.push(pool.submit(job).await.expect("submit failed"));
  }
  for handle in handles {
    let task_id = handle.id();
    match handle.await_result().await {
      Ok(task_no) => info!("Task {} (#{}) finished its increments", task_id, task_no),
      Err(e) => info!("Task {} error: {:?}", task_id, e),
    }
  }
  info!(
    "Shared counter = {} (expected {})",
    counter.get(),
    TASKS * INCREMENTS_PER_TASK
  );

  // 2. A histogram in a shared buffer.
  let histogram = pool.shared_buffer(5, 0u32);
  let buckets = histogram.clone();
  pool
    .map(
      move |value: u32| {
        if let Err(e) = buckets.update((value % 5) as usize, |bucket| *bucket += 1) {
          tracing::warn!("Histogram update failed: {}", e);
        }
      },
      0..1_000u32,
      Some(50),
    )
    .await
    .expect("histogram map failed");
  info!("Histogram buckets: {:?}", histogram.snapshot());

  // 3. The same count without any shared state.
  let total = pool
    .map_reduce(|_task: usize| INCREMENTS_PER_TASK as i64, 0..TASKS, Some(1), 0, |a, b| a + b)
    .await
    .expect("map_reduce failed");
  info!("Reduced count = {} (matches counter: {})", total, total == counter.get());

  // 4. Moved inputs: a task mutating its copy leaves ours alone.
  let data = vec![1, 2, 3];
  let mut local = data.clone();
  let handle = pool
    .submit(Job::blocking(move || {
      local.iter_mut().for_each(|v| *v *= 100);
      local
    }))
    .await
    .expect("submit failed");
  let mutated = handle.await_result().await.expect("task failed");
  info!("Task's copy: {:?}, our copy: {:?}", mutated, data);

  pool
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Pool shutdown failed");
  info!("--- Shared State Example Finished ---");
}

use orchestra_pool::{Job, PoolConfig, ProcessJob, ShutdownMode, WorkerPool};
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Process Isolation Example ---");

  let pool = WorkerPool::new(PoolConfig::new("process_pool").workers(2), Handle::current());

  let mut handles = Vec::new();
  for (a, b) in [(1, 2), (20, 22), (7, 8)] {
    let job = ProcessJob::new("sh")
      .args(["-c", "echo $(( $1 + $2 ))", "sh"])
      .arg(a.to_string())
      .arg(b.to_string());
    handles.push(pool.submit(Job::process(job).with_label("adder")).await.unwrap());
  }

  // The child changes its own environment; ours is untouched.
  let env_job = ProcessJob::new("sh")
    .args(["-c", "export POOL_DEMO=child; echo \"child sees $POOL_DEMO\""])
    .env("POOL_DEMO", "parent");
  handles.push(pool.submit(env_job.into_job()).await.unwrap());

  let failing = ProcessJob::new("sh").args(["-c", "echo 'no such input' >&2; exit 2"]);
  handles.push(pool.submit(failing.into_job()).await.unwrap());

  for handle in handles {
    let task_id = handle.id();
    match handle.await_result().await {
      Ok(output) => info!(
        "Task {} exit {:?}, stdout {:?}",
        task_id,
        output.exit_code,
        output.stdout.trim_end()
      ),
      Err(e) => info!("Task {} failed: {}", task_id, e),
    }
  }
  info!("Parent POOL_DEMO after children ran: {:?}", std::env::var("POOL_DEMO").ok());

  pool
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Pool shutdown failed");
  info!("--- Process Isolation Example Finished ---");
}

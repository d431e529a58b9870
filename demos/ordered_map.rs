use orchestra_pool::{PoolConfig, ShutdownMode, WorkerPool};
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::info;

// A deliberately slow pairwise sum so that chunks finish out of order.
fn slow_sum((a, b): (u64, u64)) -> u64 {
  let delay = rand::rng().random_range(10..120);
  std::thread::sleep(Duration::from_millis(delay));
  a + b
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Ordered Map Example ---");

  let pool = WorkerPool::new(PoolConfig::new("map_pool").workers(4), Handle::current());

  let pairs: Vec<(u64, u64)> = (0..10).map(|i| (2 * i, 2 * i + 1)).collect();
  info!("Input pairs: {:?}", pairs);

  let started = Instant::now();
  match pool.map(slow_sum, pairs, Some(1)).await {
    Ok(sums) => info!("Sums in input order: {:?} (took {:?})", sums, started.elapsed()),
    Err(e) => tracing::error!("Map failed: {}", e),
  }

  // Partial sums per chunk, combined here. No shared state involved.
  let started = Instant::now();
  match pool
    .map_reduce(|x: u64| x * x, 1..=1_000_000u64, None, 0u64, |a, b| a + b)
    .await
  {
    Ok(total) => info!("Sum of squares 1..=1_000_000 = {} (took {:?})", total, started.elapsed()),
    Err(e) => tracing::error!("Map/reduce failed: {}", e),
  }

  info!("Shutting down pool.");
  pool
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Pool shutdown failed");
  info!("--- Ordered Map Example Finished ---");
}

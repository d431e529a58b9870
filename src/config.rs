use tokio::sync::Semaphore;
use tracing::warn;

/// Upper bound on the worker count: the worker loop holds one semaphore permit
/// per worker and reclaims all of them at once while draining.
pub(crate) const MAX_WORKERS: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
  Semaphore::MAX_PERMITS
} else {
  u32::MAX as usize
};

/// Construction-time settings for a [`WorkerPool`](crate::WorkerPool).
///
/// Nothing here can change once the pool exists; the worker count in
/// particular is fixed for the pool's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  pub(crate) name: String,
  pub(crate) workers: usize,
  pub(crate) queue_capacity: Option<usize>,
}

impl PoolConfig {
  /// A config with one worker per logical CPU and an unbounded queue.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      workers: num_cpus::get(),
      queue_capacity: None,
    }
  }

  /// Maximum number of tasks executing at once. Zero is raised to one, and
  /// counts above the semaphore limit are lowered to it.
  pub fn workers(mut self, workers: usize) -> Self {
    if workers == 0 {
      warn!(pool_name = %self.name, "A pool needs at least one worker; using 1.");
    } else if workers > MAX_WORKERS {
      warn!(pool_name = %self.name, requested = workers, "Worker count too large; using {}.", MAX_WORKERS);
    }
    self.workers = workers.clamp(1, MAX_WORKERS);
    self
  }

  /// Bounds the number of queued (not yet started) tasks; `submit` waits for a
  /// free slot once it is reached. Zero is raised to one.
  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    if capacity == 0 {
      warn!(pool_name = %self.name, "Queue capacity must be at least 1; using 1.");
    } else if capacity > Semaphore::MAX_PERMITS {
      warn!(pool_name = %self.name, requested = capacity, "Queue capacity too large; using {}.", Semaphore::MAX_PERMITS);
    }
    self.queue_capacity = Some(capacity.clamp(1, Semaphore::MAX_PERMITS));
    self
  }

  pub fn unbounded_queue(mut self) -> Self {
    self.queue_capacity = None;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn worker_count(&self) -> usize {
    self.workers
  }

  pub fn capacity(&self) -> Option<usize> {
    self.queue_capacity
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self::new("worker_pool")
  }
}

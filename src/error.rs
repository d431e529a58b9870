use thiserror::Error;

/// Errors that can occur within the `orchestra_pool` pool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolClosed,

  #[error("Task failed: {0}")]
  TaskFailed(String),

  #[error("Task panicked: {0}")]
  TaskPanicked(String),

  #[error("Task was cancelled before it started")]
  TaskCancelled,

  #[error("Task result channel error (sender dropped before a result was produced): {0}")]
  ResultChannelError(String),

  #[error("Task result already taken")]
  ResultUnavailable,

  #[error("Pool's internal task queue was closed unexpectedly")]
  QueueSendChannelClosed,

  #[error("Index {index} is out of bounds for shared buffer of length {len}")]
  IndexOutOfBounds { index: usize, len: usize },
}

impl PoolError {
  /// True for the two variants that carry a failure raised by the task body itself.
  pub fn is_task_failure(&self) -> bool {
    matches!(self, PoolError::TaskFailed(_) | PoolError::TaskPanicked(_))
  }
}

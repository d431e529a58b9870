use crate::control::{TaskControl, TaskState};
use crate::error::PoolError;
use crate::notifier::TaskCompletionInfo;
use crate::task::TaskLabel;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot::{self, error::TryRecvError};

/// A handle to a task submitted to the [`WorkerPool`](crate::WorkerPool).
///
/// This is the task's future: it can be polled, awaited, cancelled before the
/// task starts, and observed through completion callbacks.
pub struct TaskHandle<R: Send + 'static> {
  pub(crate) control: Arc<TaskControl>,
  pub(crate) result_receiver: Option<oneshot::Receiver<Result<R, PoolError>>>,
}

impl<R: Send + 'static> TaskHandle<R> {
  pub(crate) fn new(control: Arc<TaskControl>, result_receiver: oneshot::Receiver<Result<R, PoolError>>) -> Self {
    Self {
      control,
      result_receiver: Some(result_receiver),
    }
  }

  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.control.task_id()
  }

  /// Returns a clone of the labels associated with this task.
  pub fn labels(&self) -> HashSet<TaskLabel> {
    (**self.control.labels()).clone()
  }

  pub fn state(&self) -> TaskState {
    self.control.state()
  }

  /// True once the task has reached a terminal state.
  pub fn is_done(&self) -> bool {
    self.state().is_terminal()
  }

  /// Cancels the task if it has not started yet.
  ///
  /// On success the task body never runs and the handle resolves to
  /// [`PoolError::TaskCancelled`]. Returns `false`, leaving the task untouched,
  /// when it is already running or finished.
  pub fn cancel(&self) -> bool {
    let cancelled = self.control.cancel();
    tracing::debug!(task_id = %self.id(), cancelled, "TaskHandle: Cancellation requested.");
    cancelled
  }

  /// Registers `callback` to run once this task reaches a terminal state.
  ///
  /// Callbacks run on the pool's notifier thread in registration order. A
  /// callback added after the task settled is still invoked, after the earlier
  /// ones. Once the pool has shut down it runs on the calling thread instead.
  pub fn on_complete<F>(&self, callback: F)
  where
    F: FnOnce(TaskCompletionInfo) + Send + 'static,
  {
    self.control.add_callback(Box::new(callback));
  }

  /// Non-waiting poll. `None` while the task has no result yet; never `None`
  /// once [`is_done`](Self::is_done) has returned `true`.
  ///
  /// Once a result has been returned, later calls yield
  /// `Some(Err(PoolError::ResultUnavailable))`.
  pub fn try_result(&mut self) -> Option<Result<R, PoolError>> {
    let rx = match self.result_receiver.as_mut() {
      Some(rx) => rx,
      None => return Some(Err(PoolError::ResultUnavailable)),
    };
    loop {
      match rx.try_recv() {
        Ok(outcome) => {
          self.result_receiver = None;
          return Some(outcome);
        }
        Err(TryRecvError::Empty) => {
          if !self.control.state().is_terminal() {
            return None;
          }
          // Settled, and the settling thread is handing the outcome over right now.
          std::thread::yield_now();
        }
        Err(TryRecvError::Closed) => {
          self.result_receiver = None;
          return Some(Err(self.channel_closed_error()));
        }
      }
    }
  }

  /// Awaits the completion of the task and returns its result.
  ///
  /// # Errors
  /// - `PoolError::TaskFailed` if the task body returned an error.
  /// - `PoolError::TaskPanicked` if the task panicked.
  /// - `PoolError::TaskCancelled` if the task was cancelled before it started.
  /// - `PoolError::ResultChannelError` if the task was torn down without producing a result.
  /// - `PoolError::ResultUnavailable` if the result was already taken via `try_result`.
  pub async fn await_result(mut self) -> Result<R, PoolError> {
    match self.result_receiver.take() {
      Some(rx) => match rx.await {
        Ok(task_outcome_result) => task_outcome_result,
        Err(recv_error) => {
          tracing::warn!(task_id = %self.id(), "Result channel receive error: {}", recv_error);
          Err(self.channel_closed_error())
        }
      },
      None => Err(PoolError::ResultUnavailable),
    }
  }

  fn channel_closed_error(&self) -> PoolError {
    PoolError::ResultChannelError(format!(
      "Task (id: {}) result channel closed in state {:?}",
      self.id(),
      self.state()
    ))
  }
}

impl<R: Send + 'static> fmt::Debug for TaskHandle<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskHandle")
      .field("task_id", &self.id())
      .field("state", &self.state())
      .field("result_taken", &self.result_receiver.is_none())
      .finish()
  }
}

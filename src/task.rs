use crate::control::TaskControl;
use crate::error::PoolError;
use crate::notifier::TaskCompletionStatus;

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A descriptive label for a task, typically a `String`.
pub type TaskLabel = String;

/// A boxed future the pool can drive. It must be `Send` and `'static`.
pub type TaskToExecute<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

pub(crate) type TaskOutcome<R> = Result<R, PoolError>;

/// A unit of work ready to be submitted to a [`WorkerPool`](crate::WorkerPool).
///
/// Every constructor normalizes its body into a future yielding
/// `Result<R, PoolError>`, so async work, blocking closures and child processes
/// all travel through the same queue and count against the same concurrency limit.
pub struct Job<R: Send + 'static> {
  pub(crate) labels: HashSet<TaskLabel>,
  pub(crate) body: TaskToExecute<TaskOutcome<R>>,
}

impl<R: Send + 'static> Job<R> {
  /// Async work that cannot fail on its own (it may still panic).
  pub fn future<F>(future: F) -> Self
  where
    F: Future<Output = R> + Send + 'static,
  {
    Self::from_body(async move { Ok(future.await) })
  }

  /// Async work whose `Err` is captured as [`PoolError::TaskFailed`].
  pub fn try_future<F, E>(future: F) -> Self
  where
    F: Future<Output = Result<R, E>> + Send + 'static,
    E: fmt::Display,
  {
    Self::from_body(async move { future.await.map_err(|e| PoolError::TaskFailed(e.to_string())) })
  }

  /// CPU-bound work executed on Tokio's blocking thread pool.
  pub fn blocking<F>(work: F) -> Self
  where
    F: FnOnce() -> R + Send + 'static,
  {
    Self::from_body(run_blocking(work))
  }

  /// Fallible CPU-bound work; an `Err` is captured as [`PoolError::TaskFailed`].
  pub fn try_blocking<F, E>(work: F) -> Self
  where
    F: FnOnce() -> Result<R, E> + Send + 'static,
    E: fmt::Display + Send + 'static,
  {
    Self::from_body(async move {
      run_blocking(work)
        .await?
        .map_err(|e| PoolError::TaskFailed(e.to_string()))
    })
  }

  /// Adds a label used for bulk cancellation and reported to completion observers.
  pub fn with_label(mut self, label: impl Into<TaskLabel>) -> Self {
    self.labels.insert(label.into());
    self
  }

  pub fn with_labels<I>(mut self, labels: I) -> Self
  where
    I: IntoIterator,
    I::Item: Into<TaskLabel>,
  {
    self.labels.extend(labels.into_iter().map(Into::into));
    self
  }

  pub fn labels(&self) -> &HashSet<TaskLabel> {
    &self.labels
  }

  pub(crate) fn from_body<F>(body: F) -> Self
  where
    F: Future<Output = TaskOutcome<R>> + Send + 'static,
  {
    Self {
      labels: HashSet::new(),
      body: Box::pin(body),
    }
  }
}

impl<R: Send + 'static> fmt::Debug for Job<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("labels", &self.labels)
      .finish_non_exhaustive()
  }
}

async fn run_blocking<F, R>(work: F) -> TaskOutcome<R>
where
  F: FnOnce() -> R + Send + 'static,
  R: Send + 'static,
{
  match tokio::task::spawn_blocking(work).await {
    Ok(value) => Ok(value),
    Err(join_error) if join_error.is_panic() => {
      Err(PoolError::TaskPanicked(panic_message(join_error.into_panic().as_ref())))
    }
    Err(join_error) => Err(PoolError::TaskFailed(format!(
      "blocking task did not run to completion: {}",
      join_error
    ))),
  }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

/// The single-use sender half of a task's result channel.
///
/// Shared between the running body and the cancellation hook; whichever
/// side fills it first wins, the other finds it empty.
pub(crate) struct ResultSlot<R> {
  sender: Mutex<Option<oneshot::Sender<TaskOutcome<R>>>>,
}

impl<R: Send + 'static> ResultSlot<R> {
  pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<TaskOutcome<R>>) {
    let (tx, rx) = oneshot::channel();
    (
      Arc::new(Self {
        sender: Mutex::new(Some(tx)),
      }),
      rx,
    )
  }

  /// Returns `false` if the slot was already filled or the receiver is gone.
  pub(crate) fn fill(&self, outcome: TaskOutcome<R>) -> bool {
    let sender = self.sender.lock().take();
    match sender {
      Some(tx) => tx.send(outcome).is_ok(),
      None => false,
    }
  }
}

pub(crate) type ErasedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Internal, type-erased representation of a queued task.
pub(crate) struct ManagedTaskInternal {
  pub(crate) control: Arc<TaskControl>,
  future: Option<ErasedTask>,
}

impl ManagedTaskInternal {
  pub(crate) fn new<R: Send + 'static>(
    control: Arc<TaskControl>,
    body: TaskToExecute<TaskOutcome<R>>,
    slot: Arc<ResultSlot<R>>,
  ) -> Self {
    let run_control = control.clone();
    let future: ErasedTask = Box::pin(async move {
      let outcome = match AssertUnwindSafe(body).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(PoolError::TaskPanicked(panic_message(payload.as_ref()))),
      };
      let status = TaskCompletionStatus::from(&outcome);
      run_control.complete(status, move || {
        slot.fill(outcome);
      });
    });
    Self {
      control,
      future: Some(future),
    }
  }

  pub(crate) fn take_future(&mut self) -> Option<ErasedTask> {
    self.future.take()
  }
}

impl fmt::Debug for ManagedTaskInternal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ManagedTaskInternal")
      .field("task_id", &self.control.task_id())
      .field("state", &self.control.state())
      .finish_non_exhaustive()
  }
}

impl Drop for ManagedTaskInternal {
  fn drop(&mut self) {
    if !self.control.is_accepted() {
      // The submission was rejected or abandoned; no handle exists.
      self.control.discard();
    } else if self.control.cancel() {
      // Queue torn down with the runtime while the task was still pending.
      tracing::debug!(task_id = %self.control.task_id(), "Pending task dropped before it started; marked cancelled.");
    }
  }
}

use crate::error::PoolError;
use crate::task::TaskLabel;

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

// --- Public Event Structs for Handlers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskCompletionStatus {
  Success,
  /// The task body returned an error.
  Failed,
  Panicked,
  /// Cancelled before it started running.
  Cancelled,
}

impl<R> From<&Result<R, PoolError>> for TaskCompletionStatus {
  fn from(result: &Result<R, PoolError>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Success,
      Err(PoolError::TaskCancelled) => TaskCompletionStatus::Cancelled,
      Err(PoolError::TaskPanicked(_)) => TaskCompletionStatus::Panicked,
      Err(_) => TaskCompletionStatus::Failed,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub pool_name: Arc<String>,
  pub labels: Arc<HashSet<TaskLabel>>,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

pub(crate) type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;
pub(crate) type CompletionCallback = Box<dyn FnOnce(TaskCompletionInfo) + Send + 'static>;
type HandlerList = Arc<RwLock<Vec<CompletionHandler>>>;

// --- Internal Messages (crate-public) ---

pub(crate) struct InternalCompletionMessage {
  pub(crate) info: TaskCompletionInfo,
  /// Per-task callbacks, consumed by this delivery.
  pub(crate) callbacks: Vec<CompletionCallback>,
  /// `false` for late per-task callbacks, whose pool-wide delivery already happened.
  pub(crate) notify_handlers: bool,
}

pub(crate) enum NotifierMessage {
  Completed(InternalCompletionMessage),
  Stop,
}

/// Cheap, cloneable entry point into the notifier, held by every task.
///
/// Once the notifier thread has stopped, deliveries run on the calling thread.
#[derive(Clone)]
pub(crate) struct NotifierSender {
  tx: mpsc::UnboundedSender<NotifierMessage>,
  handlers: HandlerList,
}

impl NotifierSender {
  /// Queues a delivery for the notifier thread. Hands the message back if the
  /// notifier has stopped; the caller then runs it with [`Self::deliver_inline`].
  pub(crate) fn enqueue(
    &self,
    info: TaskCompletionInfo,
    callbacks: Vec<CompletionCallback>,
    notify_handlers: bool,
  ) -> Result<(), InternalCompletionMessage> {
    let message = InternalCompletionMessage {
      info,
      callbacks,
      notify_handlers,
    };
    match self.tx.send(NotifierMessage::Completed(message)) {
      Ok(()) => Ok(()),
      Err(mpsc::error::SendError(NotifierMessage::Completed(message))) => Err(message),
      Err(mpsc::error::SendError(NotifierMessage::Stop)) => Ok(()),
    }
  }

  pub(crate) fn deliver_inline(&self, message: InternalCompletionMessage) {
    trace!(task_id = %message.info.task_id, "Notifier stopped; delivering completion inline.");
    deliver(message, &self.handlers);
  }

  #[cfg(test)]
  pub(crate) fn dispatch(&self, info: TaskCompletionInfo, callbacks: Vec<CompletionCallback>, notify_handlers: bool) {
    if let Err(message) = self.enqueue(info, callbacks, notify_handlers) {
      self.deliver_inline(message);
    }
  }
}

// --- CompletionNotifier Struct ---

/// Runs completion handlers and per-task callbacks on a dedicated OS thread
/// named `<pool>-notifier`, one delivery at a time.
pub(crate) struct CompletionNotifier {
  handlers: HandlerList,
  tx: mpsc::UnboundedSender<NotifierMessage>,
  pool_name: Arc<String>,
  worker_done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("pool_name", &self.pool_name)
      .field("handler_count", &self.handlers.read().len())
      .field("stopped", &self.tx.is_closed())
      .finish()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(pool_name: Arc<String>) -> Arc<Self> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let handlers: HandlerList = Arc::new(RwLock::new(Vec::new()));

    let worker_handlers = handlers.clone();
    let worker_pool_name = pool_name.clone();
    let spawn_result = thread::Builder::new()
      .name(format!("{}-notifier", pool_name))
      .spawn(move || {
        let _done = done_tx;
        Self::run_notification_worker_loop(rx, worker_handlers, worker_pool_name);
      });

    if let Err(e) = spawn_result {
      // The receiver went down with the closure, so every dispatch falls back to inline delivery.
      error!(pool_name = %*pool_name, "Failed to spawn notifier thread: {}. Completions will be delivered inline.", e);
    }

    Arc::new(Self {
      handlers,
      tx,
      pool_name,
      worker_done_rx: Mutex::new(Some(done_rx)),
    })
  }

  pub(crate) fn sender(&self) -> NotifierSender {
    NotifierSender {
      tx: self.tx.clone(),
      handlers: self.handlers.clone(),
    }
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(pool_name = %*self.pool_name, "Notifier: Added new completion handler. Total handlers: {}", handlers_guard.len());
  }

  /// Asks the notifier thread to finish every delivery queued so far and exit.
  pub(crate) fn stop(&self) {
    if self.tx.send(NotifierMessage::Stop).is_err() {
      trace!(pool_name = %*self.pool_name, "Notifier: Already stopped.");
    }
  }

  fn run_notification_worker_loop(
    mut queue_rx: mpsc::UnboundedReceiver<NotifierMessage>,
    handlers: HandlerList,
    pool_name: Arc<String>,
  ) {
    info!(pool_name = %*pool_name, "Notification worker started.");

    while let Some(message) = queue_rx.blocking_recv() {
      match message {
        NotifierMessage::Completed(message) => deliver(message, &handlers),
        NotifierMessage::Stop => {
          info!(pool_name = %*pool_name, "Notification worker: Stop requested. Draining remaining messages.");
          // After close() new sends fail and fall back to inline delivery; anything
          // already queued is still ours to deliver.
          queue_rx.close();
          while let Ok(message) = queue_rx.try_recv() {
            if let NotifierMessage::Completed(message) = message {
              deliver(message, &handlers);
            }
          }
          break;
        }
      }
    }

    info!(pool_name = %*pool_name, "Notification worker stopped.");
  }

  pub(crate) async fn await_shutdown(&self) {
    let done_rx = self.worker_done_rx.lock().take();
    match done_rx {
      Some(rx) => {
        info!(pool_name = %*self.pool_name, "Notifier: Waiting for notification worker to exit.");
        // The sender is dropped, never used, when the thread exits.
        let _ = rx.await;
        debug!(pool_name = %*self.pool_name, "Notifier: Notification worker exited.");
      }
      None => {
        trace!(pool_name = %*self.pool_name, "Notifier: Shutdown already awaited elsewhere.");
      }
    }
  }
}

fn deliver(message: InternalCompletionMessage, handlers: &HandlerList) {
  let InternalCompletionMessage {
    info,
    callbacks,
    notify_handlers,
  } = message;

  if notify_handlers {
    // Snapshot so a handler may register further handlers without deadlocking.
    let snapshot: Vec<CompletionHandler> = handlers.read().iter().cloned().collect();
    if !snapshot.is_empty() {
      debug!(task_id = %info.task_id, "Dispatching notification to {} handlers.", snapshot.len());
    }
    for handler in snapshot {
      let handler_info = info.clone();
      if catch_unwind(AssertUnwindSafe(|| handler(handler_info))).is_err() {
        error!(
          "A completion handler panicked during execution. Pool: {}, Task ID: {}",
          info.pool_name, info.task_id
        );
      }
    }
  }

  for callback in callbacks {
    let callback_info = info.clone();
    if catch_unwind(AssertUnwindSafe(move || callback(callback_info))).is_err() {
      warn!(
        "A task completion callback panicked. Pool: {}, Task ID: {}",
        info.pool_name, info.task_id
      );
    }
  }
}

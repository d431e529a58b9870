use crate::notifier::{CompletionCallback, NotifierSender, TaskCompletionInfo, TaskCompletionStatus};
use crate::task::TaskLabel;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const SUCCEEDED: u8 = 2;
const FAILED: u8 = 3;
const PANICKED: u8 = 4;
const CANCELLED: u8 = 5;

/// Lifecycle of a submitted task.
///
/// `Pending → Running → {Completed, Failed, Cancelled}`, or `Pending → Cancelled`
/// when cancelled before a worker picked it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl TaskState {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
  }

  fn from_code(code: u8) -> Self {
    match code {
      PENDING => TaskState::Pending,
      RUNNING => TaskState::Running,
      SUCCEEDED => TaskState::Completed,
      FAILED | PANICKED => TaskState::Failed,
      _ => TaskState::Cancelled,
    }
  }
}

fn status_code(status: &TaskCompletionStatus) -> u8 {
  match status {
    TaskCompletionStatus::Success => SUCCEEDED,
    TaskCompletionStatus::Failed => FAILED,
    TaskCompletionStatus::Panicked => PANICKED,
    TaskCompletionStatus::Cancelled => CANCELLED,
  }
}

type CancelHook = Box<dyn FnOnce() + Send + 'static>;

enum Observers {
  Waiting(Vec<CompletionCallback>),
  Fired(TaskCompletionInfo),
}

/// Shared, type-erased state of one task: its lifecycle, its per-task completion
/// callbacks and the hook that settles its handle on pre-start cancellation.
///
/// Every transition out of `Pending`/`Running` goes through a single
/// compare-and-swap, so a task settles exactly once.
pub(crate) struct TaskControl {
  task_id: u64,
  labels: Arc<HashSet<TaskLabel>>,
  pool_name: Arc<String>,
  state: AtomicU8,
  accepted: AtomicBool,
  cancel_hook: Mutex<Option<CancelHook>>,
  observers: Mutex<Observers>,
  notifier: NotifierSender,
}

impl TaskControl {
  pub(crate) fn new(
    task_id: u64,
    labels: Arc<HashSet<TaskLabel>>,
    pool_name: Arc<String>,
    notifier: NotifierSender,
    cancel_hook: CancelHook,
  ) -> Arc<Self> {
    Arc::new(Self {
      task_id,
      labels,
      pool_name,
      state: AtomicU8::new(PENDING),
      accepted: AtomicBool::new(false),
      cancel_hook: Mutex::new(Some(cancel_hook)),
      observers: Mutex::new(Observers::Waiting(Vec::new())),
      notifier,
    })
  }

  pub(crate) fn task_id(&self) -> u64 {
    self.task_id
  }

  pub(crate) fn labels(&self) -> &Arc<HashSet<TaskLabel>> {
    &self.labels
  }

  pub(crate) fn state(&self) -> TaskState {
    TaskState::from_code(self.state.load(Ordering::Acquire))
  }

  /// Marks the task as handed to the caller. A task that was never accepted is
  /// discarded on drop instead of being reported as cancelled.
  pub(crate) fn accept(&self) {
    self.accepted.store(true, Ordering::Release);
  }

  pub(crate) fn is_accepted(&self) -> bool {
    self.accepted.load(Ordering::Acquire)
  }

  /// `Pending → Cancelled` for a task whose submission was rejected. Nobody holds
  /// a handle to it, so no observer is told.
  pub(crate) fn discard(&self) -> bool {
    let discarded = self
      .state
      .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
      .is_ok();
    if discarded {
      drop(self.cancel_hook.lock().take());
      tracing::trace!(task_id = %self.task_id, "Rejected task discarded.");
    }
    discarded
  }

  /// `Pending → Running`. Returns `false` if the task was cancelled first.
  pub(crate) fn try_start(&self) -> bool {
    let started = self
      .state
      .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
      .is_ok();
    if started {
      // Once running, the result can only come from the body.
      drop(self.cancel_hook.lock().take());
    }
    started
  }

  /// `Pending → Cancelled`. Settles the handle with `TaskCancelled` and notifies
  /// observers. Returns `false`, with no effect, once the task has started.
  pub(crate) fn cancel(&self) -> bool {
    self.settle(PENDING, CANCELLED, || {
      let hook = self.cancel_hook.lock().take();
      if let Some(hook) = hook {
        hook();
      }
    })
  }

  /// `Running → terminal`. `deliver` hands the outcome to the handle after the
  /// state is published and before observers run.
  pub(crate) fn complete(&self, status: TaskCompletionStatus, deliver: impl FnOnce()) -> bool {
    let settled = self.settle(RUNNING, status_code(&status), deliver);
    if !settled {
      tracing::warn!(task_id = %self.task_id, state = ?self.state(), "Completion ignored: task was not running.");
    }
    settled
  }

  /// Registers a callback for this task. If the task already settled, the
  /// callback is dispatched right away with the recorded completion info.
  pub(crate) fn add_callback(&self, callback: CompletionCallback) {
    let mut guard = self.observers.lock();
    let info = match &mut *guard {
      Observers::Waiting(callbacks) => {
        callbacks.push(callback);
        return;
      }
      Observers::Fired(info) => info.clone(),
    };
    // Queued under the lock so it lands behind the settle-time delivery.
    let rejected = self.notifier.enqueue(info, vec![callback], false);
    drop(guard);
    if let Err(message) = rejected {
      self.notifier.deliver_inline(message);
    }
  }

  fn settle(&self, from: u8, to: u8, deliver: impl FnOnce()) -> bool {
    if self
      .state
      .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return false;
    }

    let status = match to {
      SUCCEEDED => TaskCompletionStatus::Success,
      FAILED => TaskCompletionStatus::Failed,
      PANICKED => TaskCompletionStatus::Panicked,
      _ => TaskCompletionStatus::Cancelled,
    };
    let info = TaskCompletionInfo {
      task_id: self.task_id,
      pool_name: self.pool_name.clone(),
      labels: self.labels.clone(),
      status,
      completion_time: SystemTime::now(),
    };
    let mut guard = self.observers.lock();
    let callbacks = match std::mem::replace(&mut *guard, Observers::Fired(info.clone())) {
      Observers::Waiting(callbacks) => callbacks,
      Observers::Fired(_) => Vec::new(),
    };

    // The outcome reaches the handle before observers hear about it, and the
    // delivery is queued before a late `add_callback` can queue its own.
    deliver();
    tracing::trace!(task_id = %self.task_id, status = ?info.status, "Task settled.");
    let rejected = self.notifier.enqueue(info, callbacks, true);
    drop(guard);
    if let Err(message) = rejected {
      self.notifier.deliver_inline(message);
    }
    true
  }
}

impl fmt::Debug for TaskControl {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskControl")
      .field("task_id", &self.task_id)
      .field("labels", &self.labels)
      .field("state", &self.state())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notifier::CompletionNotifier;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn control_with_hook(notifier: &CompletionNotifier, hook_hits: Arc<AtomicUsize>) -> Arc<TaskControl> {
    TaskControl::new(
      7,
      Arc::new(HashSet::from(["unit".to_string()])),
      Arc::new("control_tests".to_string()),
      notifier.sender(),
      Box::new(move || {
        hook_hits.fetch_add(1, Ordering::SeqCst);
      }),
    )
  }

  #[test]
  fn cancel_before_start_wins_and_runs_hook_once() {
    let notifier = CompletionNotifier::new(Arc::new("control_tests".to_string()));
    let hook_hits = Arc::new(AtomicUsize::new(0));
    let control = control_with_hook(&notifier, hook_hits.clone());

    assert!(control.cancel());
    assert!(!control.cancel());
    assert!(!control.try_start());
    assert_eq!(control.state(), TaskState::Cancelled);
    assert_eq!(hook_hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn cancel_after_start_is_rejected() {
    let notifier = CompletionNotifier::new(Arc::new("control_tests".to_string()));
    let hook_hits = Arc::new(AtomicUsize::new(0));
    let control = control_with_hook(&notifier, hook_hits.clone());

    assert!(control.try_start());
    assert!(!control.cancel());
    assert_eq!(control.state(), TaskState::Running);
    assert_eq!(hook_hits.load(Ordering::SeqCst), 0);

    let mut delivered = false;
    assert!(control.complete(TaskCompletionStatus::Panicked, || delivered = true));
    assert!(delivered);
    assert_eq!(control.state(), TaskState::Failed);
    assert!(!control.complete(TaskCompletionStatus::Success, || {}));
    assert_eq!(control.state(), TaskState::Failed);
  }

  #[test]
  fn discard_settles_without_notifying() {
    let notifier = CompletionNotifier::new(Arc::new("control_tests".to_string()));
    let hook_hits = Arc::new(AtomicUsize::new(0));
    let control = control_with_hook(&notifier, hook_hits.clone());
    let (tx, rx) = std::sync::mpsc::channel();
    control.add_callback(Box::new(move |info| {
      let _ = tx.send(info.task_id);
    }));

    assert!(!control.is_accepted());
    assert!(control.discard());
    assert!(!control.discard());
    assert!(!control.cancel());
    assert!(!control.try_start());
    assert_eq!(control.state(), TaskState::Cancelled);
    assert_eq!(hook_hits.load(Ordering::SeqCst), 0);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
  }

  #[test]
  fn late_callback_runs_after_earlier_ones() {
    let notifier = CompletionNotifier::new(Arc::new("control_tests".to_string()));
    for _ in 0..200 {
      let control = control_with_hook(&notifier, Arc::new(AtomicUsize::new(0)));
      let (tx, rx) = std::sync::mpsc::channel();
      let early_tx = tx.clone();
      control.add_callback(Box::new(move |_| {
        let _ = early_tx.send(0);
      }));
      assert!(control.try_start());

      let completing = control.clone();
      let completer = std::thread::spawn(move || {
        completing.complete(TaskCompletionStatus::Success, || {});
      });
      control.add_callback(Box::new(move |_| {
        let _ = tx.send(1);
      }));
      completer.join().unwrap();

      let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
      let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
      assert_eq!((first, second), (0, 1));
    }
  }

  #[test]
  fn late_callback_still_fires() {
    let notifier = CompletionNotifier::new(Arc::new("control_tests".to_string()));
    let control = control_with_hook(&notifier, Arc::new(AtomicUsize::new(0)));
    assert!(control.try_start());
    assert!(control.complete(TaskCompletionStatus::Success, || {}));

    let (tx, rx) = std::sync::mpsc::channel();
    control.add_callback(Box::new(move |info| {
      let _ = tx.send(info.status);
    }));
    let status = rx.recv_timeout(Duration::from_secs(2)).expect("late callback was not invoked");
    assert_eq!(status, TaskCompletionStatus::Success);
  }
}

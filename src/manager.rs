use crate::config::{PoolConfig, MAX_WORKERS};
use crate::control::{TaskControl, TaskState};
use crate::error::PoolError;
use crate::handle::TaskHandle;
use crate::notifier::{CompletionNotifier, TaskCompletionInfo};
use crate::shared::{SharedBuffer, SharedCounter};
use crate::task::{Job, ManagedTaskInternal, ResultSlot, TaskLabel};
use crate::task_queue::{QueueConsumer, QueueProducer, TaskQueue};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines what happens to queued work when the pool shuts down.
///
/// In both modes running tasks finish normally, and no submitted task is
/// dropped without reaching a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Every queued task still runs before the pool stops.
  Graceful,
  /// Tasks that have not started are cancelled.
  CancelPending,
}

type TaskRegistry = Arc<DashMap<u64, Arc<TaskControl>>>;

struct Registration<'a> {
  tasks: &'a TaskRegistry,
  control: Arc<TaskControl>,
  committed: bool,
}

impl Drop for Registration<'_> {
  fn drop(&mut self) {
    if !self.committed {
      self.control.discard();
      self.tasks.remove(&self.control.task_id());
    }
  }
}

/// A fixed-size pool executing submitted jobs with bounded concurrency.
pub struct WorkerPool {
  pool_name: Arc<String>,
  workers: usize,
  producer: QueueProducer,
  tasks: TaskRegistry,
  shutdown_token: CancellationToken,
  drained_token: CancellationToken,
  notifier: Arc<CompletionNotifier>,
}

impl WorkerPool {
  pub fn new(config: PoolConfig, tokio_handle: TokioHandle) -> Arc<Self> {
    let PoolConfig {
      name,
      workers,
      queue_capacity,
    } = config;
    let workers = workers.clamp(1, MAX_WORKERS);
    let pool_name = Arc::new(name);
    let (producer, consumer) = TaskQueue::new(queue_capacity).split();
    let notifier = CompletionNotifier::new(pool_name.clone());

    let manager_arc = Arc::new(Self {
      pool_name: pool_name.clone(),
      workers,
      producer,
      tasks: Arc::new(DashMap::new()),
      shutdown_token: CancellationToken::new(),
      drained_token: CancellationToken::new(),
      notifier,
    });

    let worker_pool_name = manager_arc.pool_name.clone();
    let worker_tasks = manager_arc.tasks.clone();
    let worker_notifier = manager_arc.notifier.clone();
    let worker_drained_token = manager_arc.drained_token.clone();
    let worker_tokio_handle = tokio_handle.clone();

    tokio_handle.spawn(
      async move {
        Self::run_worker_loop(
          worker_pool_name,
          workers,
          consumer,
          worker_tokio_handle,
          worker_tasks,
          worker_notifier,
          worker_drained_token,
        )
        .await;
      }
      .instrument(info_span!("worker_pool_loop", name = %pool_name)),
    );

    info!(pool_name = %*manager_arc.pool_name, workers, capacity = ?queue_capacity, "Worker pool created.");
    manager_arc
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// The fixed concurrency limit.
  pub fn worker_count(&self) -> usize {
    self.workers
  }

  /// Number of tasks currently executing.
  pub fn active_task_count(&self) -> usize {
    self.count_in_state(TaskState::Running)
  }

  /// Number of submitted tasks that have not started yet.
  pub fn queued_task_count(&self) -> usize {
    self.count_in_state(TaskState::Pending)
  }

  pub fn is_shutting_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Enqueues `job` and returns its handle.
  ///
  /// Waits for a queue slot only if the pool was configured with a finite
  /// capacity. Fails with [`PoolError::PoolClosed`] once shutdown has begun.
  pub async fn submit<R: Send + 'static>(&self, job: Job<R>) -> Result<TaskHandle<R>, PoolError> {
    if self.shutdown_token.is_cancelled() || self.producer.is_closed() {
      warn!(pool_name = %self.pool_name, "Submit: Attempted to submit task to a pool that is shutting down or closed.");
      return Err(PoolError::PoolClosed);
    }

    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let Job { labels, body } = job;
    let labels = Arc::new(labels);
    let (slot, result_rx) = ResultSlot::new();

    let cancel_slot = slot.clone();
    let control = TaskControl::new(
      task_id,
      labels.clone(),
      self.pool_name.clone(),
      self.notifier.sender(),
      Box::new(move || {
        cancel_slot.fill(Err(PoolError::TaskCancelled));
      }),
    );
    let managed_task = ManagedTaskInternal::new(control.clone(), body, slot);

    debug!(pool_name = %self.pool_name, %task_id, labels = ?labels, "Submitting task to queue.");
    self.tasks.insert(task_id, control.clone());
    // Removes the entry again if the send fails or this future is dropped mid-wait.
    let mut registration = Registration {
      tasks: &self.tasks,
      control: control.clone(),
      committed: false,
    };

    match self.producer.send(managed_task, &self.shutdown_token).await {
      Ok(()) => {
        control.accept();
        registration.committed = true;
        Ok(TaskHandle::new(control, result_rx))
      }
      Err(send_error) => {
        error!(pool_name = %self.pool_name, %task_id, "Submit: Failed to enqueue task: {}", send_error);
        Err(send_error)
      }
    }
  }

  /// Cancels `handle`'s task if it has not started. See [`TaskHandle::cancel`].
  pub fn cancel<R: Send + 'static>(&self, handle: &TaskHandle<R>) -> bool {
    handle.cancel()
  }

  /// Registers a per-task callback. See [`TaskHandle::on_complete`].
  pub fn add_completion_callback<R, F>(&self, handle: &TaskHandle<R>, callback: F)
  where
    R: Send + 'static,
    F: FnOnce(TaskCompletionInfo) + Send + 'static,
  {
    handle.on_complete(callback);
  }

  /// Registers a pool-wide observer, invoked on the notifier thread for every
  /// task that reaches a terminal state from now on.
  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Cancels every pending task carrying `label_to_cancel`. Returns how many were cancelled.
  pub fn cancel_tasks_by_label(&self, label_to_cancel: &TaskLabel) -> usize {
    self.cancel_tasks_by_labels_internal(&HashSet::from_iter([label_to_cancel.clone()]))
  }

  /// Cancels every pending task carrying any of `labels_to_cancel`.
  pub fn cancel_tasks_by_labels(&self, labels_to_cancel: &HashSet<TaskLabel>) -> usize {
    self.cancel_tasks_by_labels_internal(labels_to_cancel)
  }

  /// A counter shared by every job that holds a clone of it.
  pub fn shared_counter(&self, initial: i64) -> SharedCounter {
    debug!(pool_name = %self.pool_name, initial, "Creating shared counter.");
    SharedCounter::new(initial)
  }

  /// A fixed-length buffer shared by every job that holds a clone of it.
  pub fn shared_buffer<T: Clone + Send>(&self, len: usize, fill: T) -> SharedBuffer<T> {
    debug!(pool_name = %self.pool_name, len, "Creating shared buffer.");
    SharedBuffer::new(len, fill)
  }

  /// Stops accepting submissions without waiting for the drain to finish.
  pub fn begin_shutdown(&self, mode: ShutdownMode) {
    if self.shutdown_token.is_cancelled() {
      info!(pool_name = %self.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
      return;
    }

    info!(pool_name = %self.pool_name, "Initiating pool shutdown (mode: {:?}).", mode);
    self.shutdown_token.cancel();
    self.producer.close();

    match mode {
      ShutdownMode::Graceful => {
        info!(pool_name = %self.pool_name, "Graceful shutdown: Queued tasks will still run.");
      }
      ShutdownMode::CancelPending => {
        // Submissions still waiting for a queue slot are rejected, not cancelled.
        let pending: Vec<Arc<TaskControl>> = self
          .tasks
          .iter()
          .filter(|entry| entry.value().is_accepted() && entry.value().state() == TaskState::Pending)
          .map(|entry| entry.value().clone())
          .collect();
        let cancelled = pending.iter().filter(|control| control.cancel()).count();
        info!(pool_name = %self.pool_name, cancelled, "CancelPending shutdown: Cancelled tasks that had not started.");
      }
    }
  }

  /// Stops accepting submissions and waits until every submitted task has
  /// reached a terminal state and every completion notification was delivered.
  pub async fn shutdown(&self, mode: ShutdownMode) -> Result<(), PoolError> {
    self.begin_shutdown(mode);
    trace!(pool_name = %self.pool_name, "Waiting for worker loop to drain.");
    self.drained_token.cancelled().await;
    info!(pool_name = %self.pool_name, "Pool shutdown completed.");
    Ok(())
  }

  fn count_in_state(&self, state: TaskState) -> usize {
    self
      .tasks
      .iter()
      .filter(|entry| entry.value().state() == state)
      .count()
  }

  fn cancel_tasks_by_labels_internal(&self, labels_to_cancel: &HashSet<TaskLabel>) -> usize {
    if labels_to_cancel.is_empty() {
      return 0;
    }
    info!(pool_name = %self.pool_name, "Requesting cancellation for pending tasks with labels: {:?}", labels_to_cancel);
    // Collect first: cancelling dispatches notifications and must not run under a shard lock.
    let matching: Vec<Arc<TaskControl>> = self
      .tasks
      .iter()
      .filter(|entry| entry.value().is_accepted() && !entry.value().labels().is_disjoint(labels_to_cancel))
      .map(|entry| entry.value().clone())
      .collect();

    let mut cancelled = 0;
    for control in matching {
      if control.cancel() {
        debug!(pool_name = %self.pool_name, task_id = %control.task_id(), "Cancelled pending task due to label match.");
        cancelled += 1;
      } else {
        trace!(pool_name = %self.pool_name, task_id = %control.task_id(), "Label matched but task already started.");
      }
    }
    cancelled
  }

  async fn run_worker_loop(
    pool_name: Arc<String>,
    workers: usize,
    task_queue_rx: QueueConsumer,
    tasks_tokio_handle: TokioHandle,
    tasks: TaskRegistry,
    notifier: Arc<CompletionNotifier>,
    drained_token: CancellationToken,
  ) {
    info!(name = %*pool_name, "Worker loop started.");
    let semaphore = Arc::new(Semaphore::new(workers));

    loop {
      let permit = match semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
          error!(name = %*pool_name, "Semaphore closed. Worker loop exiting.");
          break;
        }
      };
      trace!(name = %*pool_name, "Acquired worker permit. Available: {}", semaphore.available_permits());

      let mut managed_task = match task_queue_rx.recv().await {
        Ok(task) => task,
        Err(_) => {
          info!(name = %*pool_name, "Task queue closed and drained.");
          break;
        }
      };

      let task_id = managed_task.control.task_id();
      if !managed_task.control.try_start() {
        debug!(name = %*pool_name, %task_id, "Dequeued task was cancelled before it started; skipping.");
        tasks.remove(&task_id);
        continue;
      }

      let task_future = match managed_task.take_future() {
        Some(future) => future,
        None => {
          warn!(name = %*pool_name, %task_id, "Dequeued task had no body to run.");
          tasks.remove(&task_id);
          continue;
        }
      };
      debug!(name = %*pool_name, %task_id, labels = ?managed_task.control.labels(), "Dequeued task. Spawning with permit.");
      drop(managed_task);

      let tasks_cleanup = tasks.clone();
      let pool_name_for_then_block = pool_name.clone();
      tasks_tokio_handle.spawn(
        async move {
          task_future.await;
          tasks_cleanup.remove(&task_id);
          debug!(name = %*pool_name_for_then_block, %task_id, "Managed task finished processing, removed active info.");
          // Released last so a draining shutdown cannot observe a stale registry entry.
          drop(permit);
        }
        .instrument(info_span!("managed_task", pool_name = %*pool_name, %task_id)),
      );
    }

    // Every permit back means every started task has settled.
    match semaphore.acquire_many(workers as u32).await {
      Ok(_all_permits) => debug!(name = %*pool_name, "All in-flight tasks settled."),
      Err(_) => warn!(name = %*pool_name, "Semaphore closed while waiting for in-flight tasks."),
    }

    notifier.stop();
    notifier.await_shutdown().await;

    info!(name = %*pool_name, "Worker loop stopped. Tasks left in registry: {}", tasks.len());
    drained_token.cancel();
  }
}

impl std::fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerPool")
      .field("name", &self.pool_name)
      .field("workers", &self.workers)
      .field("queue", &self.producer)
      .field("shutting_down", &self.is_shutting_down())
      .finish_non_exhaustive()
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      // Signal only; the worker loop owns everything it needs and drains queued
      // work in the background.
      info!(
        pool_name = %*self.pool_name,
        "WorkerPool dropped without explicit shutdown. Closing queue; queued tasks will still run."
      );
      self.shutdown_token.cancel();
      self.producer.close();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Shutdown already in progress or completed.");
    }
  }
}

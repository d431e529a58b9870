use crate::error::PoolError;
use crate::task::ManagedTaskInternal;

use fibre::mpsc::{self, RecvError, UnboundedAsyncReceiver as AsyncReceiver, UnboundedAsyncSender as AsyncSender};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A task paired with the queue slot it occupies.
///
/// The slot permit is released when the message is dropped, which happens as
/// soon as the worker loop receives it, so capacity frees up on dequeue.
pub(crate) struct QueueMessage {
  pub(crate) task: ManagedTaskInternal,
  _slot: Option<OwnedSemaphorePermit>,
}

impl fmt::Debug for QueueMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueMessage")
      .field("task_id", &self.task.control.task_id())
      .finish_non_exhaustive()
  }
}

/// A multi-producer, single-consumer task queue with optional capacity.
///
/// The underlying `fibre::mpsc` channel is unbounded; a finite capacity is
/// enforced by a semaphore whose permits travel with each queued message.
#[derive(Debug)]
pub(crate) struct TaskQueue {
  tx: AsyncSender<QueueMessage>,
  rx: AsyncReceiver<QueueMessage>,
  slots: Option<Arc<Semaphore>>,
}

impl TaskQueue {
  /// `None` means unbounded.
  pub(crate) fn new(capacity: Option<usize>) -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    Self {
      tx,
      rx,
      slots: capacity.map(|c| Arc::new(Semaphore::new(c.max(1)))),
    }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer, QueueConsumer) {
    (
      QueueProducer {
        tx: self.tx,
        slots: self.slots,
        closed: AtomicBool::new(false),
      },
      QueueConsumer { rx: self.rx },
    )
  }
}

/// The producer handle for the `TaskQueue`.
pub(crate) struct QueueProducer {
  tx: AsyncSender<QueueMessage>,
  slots: Option<Arc<Semaphore>>,
  // fibre's sender only reports a dropped receiver as closed.
  closed: AtomicBool,
}

/// The consumer handle for the `TaskQueue`. Not cloneable: one worker loop drains it.
#[derive(Debug)]
pub(crate) struct QueueConsumer {
  rx: AsyncReceiver<QueueMessage>,
}

impl fmt::Debug for QueueProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("free_slots", &self.free_slots())
      .finish_non_exhaustive()
  }
}

impl QueueProducer {
  /// Sends a task into the queue, waiting for a free slot when the queue is
  /// bounded and full. Gives up with `PoolClosed` if shutdown begins meanwhile.
  pub(crate) async fn send(
    &self,
    task: ManagedTaskInternal,
    shutdown_token: &CancellationToken,
  ) -> Result<(), PoolError> {
    if shutdown_token.is_cancelled() || self.is_closed() {
      return Err(PoolError::PoolClosed);
    }

    let slot = match &self.slots {
      Some(slots) => tokio::select! {
        biased;
        _ = shutdown_token.cancelled() => return Err(PoolError::PoolClosed),
        permit = slots.clone().acquire_owned() => match permit {
          Ok(permit) => Some(permit),
          Err(_) => return Err(PoolError::QueueSendChannelClosed),
        },
      },
      None => None,
    };

    let message = QueueMessage { task, _slot: slot };
    if self.tx.send(message).await.is_ok() {
      Ok(())
    } else if shutdown_token.is_cancelled() || self.is_closed() {
      Err(PoolError::PoolClosed)
    } else {
      Err(PoolError::QueueSendChannelClosed)
    }
  }

  /// Closes the sending side; the consumer drains what is left and then sees `Disconnected`.
  pub(crate) fn close(&self) {
    if !self.closed.swap(true, Ordering::AcqRel) {
      let _ = self.tx.close();
    }
  }

  /// True after `close`, or once the consumer is gone.
  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire) || self.tx.is_closed()
  }

  /// Number of messages currently sitting in the channel.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }

  /// Free capacity, or `None` for an unbounded queue.
  pub(crate) fn free_slots(&self) -> Option<usize> {
    self.slots.as_ref().map(|s| s.available_permits())
  }
}

impl QueueConsumer {
  /// Receives the next task. Its queue slot is released on return.
  pub(crate) async fn recv(&self) -> Result<ManagedTaskInternal, RecvError> {
    let message = self.rx.recv().await?;
    Ok(message.task)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::control::{TaskControl, TaskState};
  use crate::notifier::CompletionNotifier;
  use crate::task::{ResultSlot, TaskToExecute};
  use std::collections::HashSet;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn dummy_task(notifier: &CompletionNotifier, id: u64) -> ManagedTaskInternal {
    let body: TaskToExecute<Result<String, PoolError>> = Box::pin(async move { Ok("done".to_string()) });
    let (slot, _rx) = ResultSlot::new();
    let hook_slot = slot.clone();
    let control = TaskControl::new(
      id,
      Arc::new(HashSet::new()),
      Arc::new("queue_tests".to_string()),
      notifier.sender(),
      Box::new(move || {
        hook_slot.fill(Err(PoolError::TaskCancelled));
      }),
    );
    ManagedTaskInternal::new(control, body, slot)
  }

  fn notifier() -> Arc<CompletionNotifier> {
    CompletionNotifier::new(Arc::new("queue_tests".to_string()))
  }

  #[tokio::test]
  async fn test_queue_send_recv_releases_slot() {
    let notifier = notifier();
    let (producer, consumer) = TaskQueue::new(Some(5)).split();
    let shutdown_token = CancellationToken::new();

    assert_eq!(producer.free_slots(), Some(5));
    producer.send(dummy_task(&notifier, 1), &shutdown_token).await.unwrap();
    assert_eq!(producer.free_slots(), Some(4));

    let mut received = consumer.recv().await.unwrap();
    assert_eq!(received.control.task_id(), 1);
    assert_eq!(producer.free_slots(), Some(5));

    // Start it so dropping the message does not count as a pending-task discard.
    assert!(received.control.try_start());
    assert!(received.take_future().is_some());
  }

  #[tokio::test]
  async fn test_queue_capacity_blocks_send() {
    let notifier = notifier();
    let (producer, consumer) = TaskQueue::new(Some(1)).split();
    let shutdown_token = CancellationToken::new();

    producer.send(dummy_task(&notifier, 1), &shutdown_token).await.unwrap();
    assert_eq!(producer.free_slots(), Some(0));

    let send_future = producer.send(dummy_task(&notifier, 2), &shutdown_token);
    tokio::pin!(send_future);

    tokio::select! {
      _ = &mut send_future => panic!("Send should have blocked because the queue is full."),
      _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    let received = consumer.recv().await.unwrap();
    assert_eq!(received.control.task_id(), 1);

    tokio::time::timeout(Duration::from_millis(200), send_future)
      .await
      .expect("Send did not complete after queue was drained.")
      .unwrap();
    assert_eq!(producer.free_slots(), Some(0));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_queue_concurrent_sends() {
    let notifier = notifier();
    let (producer, consumer) = TaskQueue::new(Some(4)).split();
    let producer = Arc::new(producer);
    let shutdown_token = CancellationToken::new();
    let num_tasks: u64 = 20;
    let received_count = Arc::new(AtomicUsize::new(0));

    let mut senders = Vec::new();
    for i in 0..num_tasks {
      let producer = producer.clone();
      let token = shutdown_token.clone();
      let task = dummy_task(&notifier, i);
      senders.push(tokio::spawn(async move {
        producer.send(task, &token).await.unwrap();
      }));
    }

    let consumer_handle = {
      let received_count = received_count.clone();
      tokio::spawn(async move {
        for _ in 0..num_tasks {
          if consumer.recv().await.is_ok() {
            received_count.fetch_add(1, Ordering::SeqCst);
          }
        }
      })
    };

    for sender in senders {
      sender.await.unwrap();
    }
    consumer_handle.await.unwrap();

    assert_eq!(received_count.load(Ordering::SeqCst), num_tasks as usize);
    assert_eq!(producer.free_slots(), Some(4));
  }

  #[tokio::test]
  async fn test_send_respects_shutdown_token() {
    let notifier = notifier();
    let (producer, _consumer) = TaskQueue::new(Some(1)).split();
    let shutdown_token = CancellationToken::new();

    producer.send(dummy_task(&notifier, 1), &shutdown_token).await.unwrap();
    shutdown_token.cancel();

    let result = producer.send(dummy_task(&notifier, 2), &shutdown_token).await;
    assert_eq!(result, Err(PoolError::PoolClosed));
    assert_eq!(producer.free_slots(), Some(0), "Slot should still be held by the first task");
  }

  #[tokio::test]
  async fn test_close_sender_drains_then_disconnects() {
    let notifier = notifier();
    let (producer, consumer) = TaskQueue::new(None).split();
    let shutdown_token = CancellationToken::new();

    producer.send(dummy_task(&notifier, 1), &shutdown_token).await.unwrap();
    producer.close();
    assert!(producer.is_closed());

    let received = consumer.recv().await.unwrap();
    assert_eq!(received.control.task_id(), 1);

    // Dropping a still-pending task settles it as cancelled.
    let control = received.control.clone();
    control.accept();
    drop(received);
    assert_eq!(control.state(), TaskState::Cancelled);

    assert!(consumer.recv().await.is_err());
  }

  #[tokio::test]
  async fn test_send_after_close_is_rejected() {
    let notifier = notifier();
    let (producer, _consumer) = TaskQueue::new(None).split();
    let shutdown_token = CancellationToken::new();

    assert!(!producer.is_closed());
    producer.close();
    producer.close();
    assert!(producer.is_closed());

    let result = producer.send(dummy_task(&notifier, 1), &shutdown_token).await;
    assert_eq!(result, Err(PoolError::PoolClosed));
  }
}

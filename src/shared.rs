//! Explicitly shared mutable state for jobs that must write to common memory.
//!
//! Each operation holds the lock for the whole read-modify-write, so no update
//! is ever lost. That also serializes every writer; returning partial results
//! and combining them (see [`WorkerPool::map_reduce`](crate::WorkerPool::map_reduce))
//! avoids the contention entirely and should be tried first.

use crate::error::PoolError;

use std::sync::Arc;

use parking_lot::Mutex;

/// An `i64` counter shared across jobs. Clones refer to the same value.
#[derive(Debug, Clone, Default)]
pub struct SharedCounter {
  value: Arc<Mutex<i64>>,
}

impl SharedCounter {
  pub fn new(initial: i64) -> Self {
    Self {
      value: Arc::new(Mutex::new(initial)),
    }
  }

  /// Adds one and returns the new value.
  pub fn increment(&self) -> i64 {
    self.add(1)
  }

  /// Adds `delta` and returns the new value.
  pub fn add(&self, delta: i64) -> i64 {
    self.update(|current| current + delta)
  }

  /// Replaces the value with `f(current)` under the lock and returns it.
  pub fn update(&self, f: impl FnOnce(i64) -> i64) -> i64 {
    let mut guard = self.value.lock();
    *guard = f(*guard);
    *guard
  }

  pub fn get(&self) -> i64 {
    *self.value.lock()
  }
}

/// A fixed-length buffer shared across jobs. Clones refer to the same storage.
#[derive(Debug)]
pub struct SharedBuffer<T> {
  slots: Arc<Mutex<Vec<T>>>,
  len: usize,
}

impl<T> Clone for SharedBuffer<T> {
  fn clone(&self) -> Self {
    Self {
      slots: self.slots.clone(),
      len: self.len,
    }
  }
}

impl<T: Clone> SharedBuffer<T> {
  pub fn new(len: usize, fill: T) -> Self {
    Self::from_vec(vec![fill; len])
  }

  /// Copy of the element at `index`.
  pub fn get(&self, index: usize) -> Result<T, PoolError> {
    self.update(index, |slot| slot.clone())
  }

  /// Copy of the whole buffer, taken under the lock.
  pub fn snapshot(&self) -> Vec<T> {
    self.slots.lock().clone()
  }
}

impl<T> SharedBuffer<T> {
  /// Wraps an existing vector; its length becomes the buffer's fixed length.
  pub fn from_vec(values: Vec<T>) -> Self {
    let len = values.len();
    Self {
      slots: Arc::new(Mutex::new(values)),
      len,
    }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Runs `f` on one element with exclusive access to the buffer.
  pub fn update<U>(&self, index: usize, f: impl FnOnce(&mut T) -> U) -> Result<U, PoolError> {
    let mut guard = self.slots.lock();
    let len = guard.len();
    match guard.get_mut(index) {
      Some(slot) => Ok(f(slot)),
      None => Err(PoolError::IndexOutOfBounds { index, len }),
    }
  }

  /// Runs `f` on the whole buffer with exclusive access. The length cannot change.
  pub fn with_lock<U>(&self, f: impl FnOnce(&mut [T]) -> U) -> U {
    let mut guard = self.slots.lock();
    f(guard.as_mut_slice())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn counter_has_no_lost_updates_across_threads() {
    let counter = SharedCounter::new(0);
    let threads: Vec<_> = (0..8)
      .map(|_| {
        let counter = counter.clone();
        thread::spawn(move || {
          for _ in 0..1_000 {
            counter.increment();
          }
        })
      })
      .collect();
    for t in threads {
      t.join().unwrap();
    }
    assert_eq!(counter.get(), 8_000);
  }

  #[test]
  fn counter_update_is_atomic_read_modify_write() {
    let counter = SharedCounter::new(3);
    assert_eq!(counter.update(|v| v * 10), 30);
    assert_eq!(counter.add(-5), 25);
  }

  #[test]
  fn buffer_rejects_out_of_range_index() {
    let buffer = SharedBuffer::new(3, 0u32);
    buffer.update(2, |slot| *slot = 9).unwrap();
    assert_eq!(buffer.snapshot(), vec![0, 0, 9]);
    assert_eq!(buffer.get(3), Err(PoolError::IndexOutOfBounds { index: 3, len: 3 }));
  }

  #[test]
  fn buffer_with_lock_sees_whole_slice() {
    let buffer = SharedBuffer::from_vec(vec![1, 2, 3]);
    let total: i32 = buffer.with_lock(|slots| {
      slots.iter_mut().for_each(|v| *v *= 2);
      slots.iter().sum()
    });
    assert_eq!(total, 12);
    assert_eq!(buffer.len(), 3);
    assert!(!buffer.is_empty());
  }
}

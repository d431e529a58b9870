use crate::error::PoolError;
use crate::handle::TaskHandle;
use crate::manager::WorkerPool;
use crate::task::Job;

use std::sync::Arc;

use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use tracing::{debug, warn};

/// Tasks-per-chunk used when the caller does not choose one: the inputs are
/// spread over roughly four chunks per worker, rounded up, at least one item each.
pub(crate) fn default_chunk_size(input_len: usize, workers: usize) -> usize {
  let divisor = workers.max(1) * 4;
  let chunk = input_len / divisor + usize::from(input_len % divisor != 0);
  chunk.max(1)
}

fn into_chunks<T>(inputs: Vec<T>, chunk_size: usize) -> Vec<Vec<T>> {
  let mut chunks = Vec::with_capacity(inputs.len().div_ceil(chunk_size));
  let mut items = inputs.into_iter();
  loop {
    let chunk: Vec<T> = items.by_ref().take(chunk_size).collect();
    if chunk.is_empty() {
      break;
    }
    chunks.push(chunk);
  }
  chunks
}

impl WorkerPool {
  /// Applies `f` to every input on the pool and returns the results in input order.
  ///
  /// Inputs are batched `chunk_size` at a time into one blocking job per batch;
  /// `None` picks about four chunks per worker. Larger chunks cut per-task overhead but
  /// make load balancing coarser. If any chunk fails, the first failure in input
  /// order is returned once every chunk has settled.
  pub async fn map<T, R, F, I>(&self, f: F, inputs: I, chunk_size: Option<usize>) -> Result<Vec<R>, PoolError>
  where
    F: Fn(T) -> R + Send + Sync + 'static,
    I: IntoIterator<Item = T>,
    T: Send + 'static,
    R: Send + 'static,
  {
    let f = Arc::new(f);
    let handles = self
      .submit_chunks(inputs, chunk_size, move |chunk: Vec<T>| {
        chunk.into_iter().map(|item| f(item)).collect::<Vec<R>>()
      })
      .await?;

    let mut results = Vec::new();
    let mut first_error = None;
    for handle in handles {
      match handle.await_result().await {
        Ok(partial) => results.extend(partial),
        Err(e) => {
          if first_error.is_none() {
            first_error = Some(e);
          }
        }
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(results),
    }
  }

  /// Map/reduce without shared state: each chunk folds its items into a
  /// partial value on a worker, then the partials are folded here in input order.
  ///
  /// `reduce` must be associative with `identity` as its neutral element.
  pub async fn map_reduce<T, R, F, G, I>(
    &self,
    f: F,
    inputs: I,
    chunk_size: Option<usize>,
    identity: R,
    reduce: G,
  ) -> Result<R, PoolError>
  where
    F: Fn(T) -> R + Send + Sync + 'static,
    G: Fn(R, R) -> R + Send + Sync + 'static,
    I: IntoIterator<Item = T>,
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
  {
    let f = Arc::new(f);
    let reduce = Arc::new(reduce);
    let worker_reduce = reduce.clone();
    let worker_identity = identity.clone();
    let handles = self
      .submit_chunks(inputs, chunk_size, move |chunk: Vec<T>| {
        chunk
          .into_iter()
          .fold(worker_identity.clone(), |acc, item| worker_reduce(acc, f(item)))
      })
      .await?;

    let mut total = identity;
    let mut first_error = None;
    for handle in handles {
      match handle.await_result().await {
        Ok(partial) => total = reduce(total, partial),
        Err(e) => {
          if first_error.is_none() {
            first_error = Some(e);
          }
        }
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(total),
    }
  }

  /// Like [`map`](Self::map) but yields results as chunks finish, in completion order.
  ///
  /// A failed chunk yields one `Err` in place of its items.
  pub async fn map_unordered<T, R, F, I>(
    &self,
    f: F,
    inputs: I,
    chunk_size: Option<usize>,
  ) -> Result<BoxStream<'static, Result<R, PoolError>>, PoolError>
  where
    F: Fn(T) -> R + Send + Sync + 'static,
    I: IntoIterator<Item = T>,
    T: Send + 'static,
    R: Send + 'static,
  {
    let f = Arc::new(f);
    let handles = self
      .submit_chunks(inputs, chunk_size, move |chunk: Vec<T>| {
        chunk.into_iter().map(|item| f(item)).collect::<Vec<R>>()
      })
      .await?;

    let pending: FuturesUnordered<_> = handles.into_iter().map(TaskHandle::await_result).collect();
    let results = pending.flat_map(|chunk_result| {
      let items: Vec<Result<R, PoolError>> = match chunk_result {
        Ok(chunk) => chunk.into_iter().map(Ok).collect(),
        Err(e) => vec![Err(e)],
      };
      stream::iter(items)
    });
    Ok(results.boxed())
  }

  async fn submit_chunks<T, O, W, I>(
    &self,
    inputs: I,
    chunk_size: Option<usize>,
    work: W,
  ) -> Result<Vec<TaskHandle<O>>, PoolError>
  where
    W: Fn(Vec<T>) -> O + Send + Sync + 'static,
    I: IntoIterator<Item = T>,
    T: Send + 'static,
    O: Send + 'static,
  {
    let inputs: Vec<T> = inputs.into_iter().collect();
    if inputs.is_empty() {
      return Ok(Vec::new());
    }

    let chunk_size = match chunk_size {
      Some(0) => {
        warn!(pool_name = %self.name(), "Chunk size 0 requested; using 1.");
        1
      }
      Some(size) => size,
      None => default_chunk_size(inputs.len(), self.worker_count()),
    };
    let input_len = inputs.len();
    let chunks = into_chunks(inputs, chunk_size);
    debug!(pool_name = %self.name(), input_len, chunk_size, chunks = chunks.len(), "Submitting chunked jobs.");

    let work = Arc::new(work);
    let mut handles = Vec::with_capacity(chunks.len());
    for chunk in chunks {
      let work = work.clone();
      handles.push(self.submit(Job::blocking(move || work(chunk))).await?);
    }
    Ok(handles)
  }
}

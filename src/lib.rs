//! A Tokio-based bounded worker pool for embarrassingly parallel jobs.
//!
//! Jobs are async futures, blocking closures or child processes. The pool runs
//! at most `workers` of them at once, hands back a [`TaskHandle`] per job, and
//! offers ordered `map`, `map_reduce`, pre-start cancellation, completion
//! callbacks and explicitly shared state.

mod config;
mod control;
mod error;
mod handle;
mod manager;
mod map;
mod notifier;
mod process;
mod shared;
mod task;
mod task_queue;

pub use config::PoolConfig;
pub use control::TaskState;
pub use error::PoolError;
pub use handle::TaskHandle;
pub use manager::{ShutdownMode, WorkerPool};
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use process::{ProcessJob, ProcessOutput};
pub use shared::{SharedBuffer, SharedCounter};
pub use task::{Job, TaskLabel, TaskToExecute};

//! Background task execution for CPU-heavy work.
//!
//! A [`WorkerPool`] runs handlers registered in a [`TaskRegistry`] on a small
//! set of OS threads:
//! - priority queue with FIFO ordering among equal priorities
//! - cooperative cancellation with a forced fallback after a grace period
//! - progress reporting through [`TaskContext::report_progress`]
//! - panicking handlers fail their task and get their worker replaced
//! - a caller-thread fallback when background threads are unavailable
//!
//! Results come back through a [`TaskHandle`], which is both a `Future` and
//! blockable via [`TaskHandle::wait`].

mod config;
mod error;
mod pool;
mod queue;
mod registry;
mod stats;

pub use config::{ExecutionMode, PoolMode, WorkerPoolConfig, WORKER_THREADS_ENV};
pub use error::{TaskError, TaskId};
pub use pool::{ExecuteOptions, TaskHandle, WorkerInfo, WorkerPool, WorkerStatus};
pub use registry::{ProgressCallback, TaskContext, TaskHandler, TaskRegistry};
pub use stats::PoolStats;

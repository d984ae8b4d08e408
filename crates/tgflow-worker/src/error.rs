use thiserror::Error;

pub type TaskId = u64;

/// Why a task did not produce a value.
///
/// Only ever delivered through a [`crate::TaskHandle`]; `execute` itself
/// never fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task {task_type:?} failed: {message}")]
    Failed { task_type: String, message: String },
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),
    #[error("no handler registered for task type {0:?}")]
    UnknownTaskType(String),
    #[error("worker pool shut down before the task settled")]
    PoolShutdown,
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }
}

use crate::error::TaskId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// A task-type handler. The same function serves background workers and the
/// caller-thread fallback, so results never depend on where a task ran.
pub type TaskHandler = Arc<dyn Fn(Value, &TaskContext) -> Result<Value, String> + Send + Sync>;

/// Per-task view handed to a handler.
pub struct TaskContext {
    id: TaskId,
    task_type: Arc<str>,
    cancelled: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
}

impl TaskContext {
    pub(crate) fn new(
        id: TaskId,
        task_type: Arc<str>,
        cancelled: Arc<AtomicBool>,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            id,
            task_type,
            cancelled,
            progress,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Whether the caller asked for this task to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Bail out of a handler with `?` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), String> {
        if self.is_cancelled() {
            Err("cancelled".to_string())
        } else {
            Ok(())
        }
    }

    /// Report completion in `[0, 1]`. Out-of-range values are clamped.
    pub fn report_progress(&self, fraction: f64) {
        if let Some(cb) = &self.progress {
            let fraction = if fraction.is_nan() {
                0.0
            } else {
                fraction.clamp(0.0, 1.0)
            };
            cb(fraction);
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Maps task types to handlers. Built once and moved into the pool.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, TaskHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler over raw JSON payloads. Re-registering a type
    /// replaces the previous handler.
    pub fn register<F>(&mut self, task_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value, &TaskContext) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(task_type.into(), Arc::new(handler));
        self
    }

    /// Register a handler over typed payloads; decoding and encoding failures
    /// surface as task failures.
    pub fn register_typed<In, Out, F>(&mut self, task_type: impl Into<String>, handler: F) -> &mut Self
    where
        In: DeserializeOwned,
        Out: Serialize,
        F: Fn(In, &TaskContext) -> Result<Out, String> + Send + Sync + 'static,
    {
        self.register(task_type, move |payload, ctx| {
            let input: In =
                serde_json::from_value(payload).map_err(|err| format!("invalid payload: {err}"))?;
            let output = handler(input, ctx)?;
            serde_json::to_value(output).map_err(|err| format!("unserializable result: {err}"))
        })
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub(crate) fn get(&self, task_type: &str) -> Option<TaskHandler> {
        self.handlers.get(task_type).cloned()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

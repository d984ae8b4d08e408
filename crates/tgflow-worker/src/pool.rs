use crate::config::{resolve_execution_mode, ExecutionMode, WorkerPoolConfig};
use crate::error::{TaskError, TaskId};
use crate::queue::TaskQueue;
use crate::registry::{ProgressCallback, TaskContext, TaskHandler, TaskRegistry};
use crate::stats::{Outcome, PoolStats, RollingStats};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot::{self, error::TryRecvError};

type Reply = oneshot::Sender<Result<Value, TaskError>>;

/// Per-call options for [`WorkerPool::execute`].
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Higher runs first; equal priorities run in submission order.
    pub priority: i32,
    pub on_progress: Option<ProgressCallback>,
}

impl ExecuteOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            on_progress: None,
        }
    }

    pub fn on_progress(mut self, callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("priority", &self.priority)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: usize,
    pub status: WorkerStatus,
}

struct QueuedTask {
    task_type: Arc<str>,
    payload: Value,
    handler: TaskHandler,
    progress: Option<ProgressCallback>,
    reply: Reply,
}

struct RunningTask {
    task_type: Arc<str>,
    /// `None` when running on a caller thread (fallback mode).
    slot: Option<usize>,
    generation: u64,
    cancelled: Arc<AtomicBool>,
    started: Instant,
    reply: Reply,
}

struct Job {
    id: TaskId,
    payload: Value,
    handler: TaskHandler,
    ctx: TaskContext,
}

enum JobResult {
    Ok(Value),
    Err(String),
    Panicked(String),
}

struct Slot {
    status: WorkerStatus,
    /// Bumped whenever the slot's thread is replaced; results from an older
    /// generation are discarded.
    generation: u64,
    sender: Option<mpsc::Sender<Job>>,
}

struct PoolState {
    mode: ExecutionMode,
    queue: TaskQueue<QueuedTask>,
    slots: Vec<Slot>,
    running: HashMap<TaskId, RunningTask>,
    stats: RollingStats,
    shut_down: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    registry: TaskRegistry,
    cancel_grace: Duration,
    next_id: AtomicU64,
}

/// Runs registered task types on background threads.
///
/// Tasks wait in a priority queue and are handed to idle workers as they free
/// up; a running task is never preempted. When no background thread is
/// available the pool degrades to running tasks on whichever thread awaits a
/// [`TaskHandle`], with identical results and error semantics.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, registry: TaskRegistry) -> Self {
        let mode = resolve_execution_mode(&config);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                mode,
                queue: TaskQueue::default(),
                slots: Vec::new(),
                running: HashMap::new(),
                stats: RollingStats::new(config.stats_window),
                shut_down: false,
            }),
            registry,
            cancel_grace: config.cancel_grace,
            next_id: AtomicU64::new(1),
        });

        if let ExecutionMode::Threaded { workers } = mode {
            let mut state = shared.lock();
            for slot in 0..workers {
                match spawn_worker(&shared, slot, 0) {
                    Ok(sender) => state.slots.push(Slot {
                        status: WorkerStatus::Idle,
                        generation: 0,
                        sender: Some(sender),
                    }),
                    Err(err) => {
                        log::warn!("failed to spawn background worker {slot}: {err}");
                        break;
                    }
                }
            }
            state.mode = if state.slots.is_empty() {
                log::warn!("no background workers available; running tasks on the caller thread");
                ExecutionMode::Fallback
            } else {
                ExecutionMode::Threaded {
                    workers: state.slots.len(),
                }
            };
        }

        log::debug!("worker pool started in {:?} mode", shared.lock().mode);
        Self { shared }
    }

    /// Queue `payload` for the `task_type` handler.
    ///
    /// Never fails directly: unknown task types, cancellation, handler errors
    /// and shutdown are all reported through the returned handle.
    pub fn execute(&self, task_type: &str, payload: Value, options: ExecuteOptions) -> TaskHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let task_type: Arc<str> = Arc::from(task_type);
        let handle = TaskHandle {
            id,
            task_type: Arc::clone(&task_type),
            rx,
            shared: Arc::clone(&self.shared),
        };

        let mut state = self.shared.lock();
        if state.shut_down {
            let _ = reply.send(Err(TaskError::PoolShutdown));
            return handle;
        }
        let Some(handler) = self.shared.registry.get(&task_type) else {
            state.stats.record(Outcome::Failed, None);
            let _ = reply.send(Err(TaskError::UnknownTaskType(task_type.to_string())));
            return handle;
        };

        state.queue.push(
            id,
            options.priority,
            QueuedTask {
                task_type,
                payload,
                handler,
                progress: options.on_progress,
                reply,
            },
        );
        self.shared.dispatch_locked(&mut state);
        handle
    }

    /// Cancel a task.
    ///
    /// A queued task is removed and rejects with [`TaskError::Cancelled`] right
    /// away, without its handler ever running. A running task is signalled
    /// through [`TaskContext::is_cancelled`]; if it is still running after the
    /// configured grace period its worker is abandoned and replaced, and the
    /// task rejects with `Cancelled`. Returns `false` for unknown or already
    /// settled tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.shared.cancel(id)
    }

    /// Drain the queue on the calling thread (fallback mode only). Returns the
    /// number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.shared.run_next_inline() {
            ran += 1;
        }
        ran
    }

    pub fn mode(&self) -> ExecutionMode {
        self.shared.lock().mode
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        worker_infos(&self.shared.lock())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let workers = worker_infos(&state);
        let (completed, failed, cancelled) = state.stats.counts();
        let busy_workers = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Busy)
            .count();
        PoolStats {
            mode: state.mode,
            queue_length: state.queue.len(),
            idle_workers: workers.len() - busy_workers,
            busy_workers,
            completed,
            failed,
            cancelled,
            avg_duration_ms: state.stats.avg_duration_ms(),
        }
    }

    /// Reject everything queued or running with [`TaskError::PoolShutdown`]
    /// and release the workers. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        for (_, task) in state.queue.drain() {
            let _ = task.reply.send(Err(TaskError::PoolShutdown));
        }
        for (_, running) in state.running.drain() {
            running.cancelled.store(true, Ordering::Release);
            let _ = running.reply.send(Err(TaskError::PoolShutdown));
        }
        for slot in &mut state.slots {
            slot.sender = None;
            slot.generation = slot.generation.wrapping_add(1);
            slot.status = WorkerStatus::Idle;
        }
        log::debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("worker pool mutex poisoned")
    }

    fn dispatch_locked(self: &Arc<Self>, state: &mut PoolState) {
        if state.shut_down || !matches!(state.mode, ExecutionMode::Threaded { .. }) {
            return;
        }

        while !state.queue.is_empty() {
            let Some(slot) = state
                .slots
                .iter()
                .position(|s| s.status == WorkerStatus::Idle && s.sender.is_some())
            else {
                if state.slots.iter().all(|s| s.sender.is_none()) {
                    log::warn!("all background workers lost; running tasks on the caller thread");
                    state.mode = ExecutionMode::Fallback;
                }
                return;
            };
            let Some((id, task)) = state.queue.pop() else {
                return;
            };

            let cancelled = Arc::new(AtomicBool::new(false));
            let job = Job {
                id,
                payload: task.payload,
                handler: task.handler,
                ctx: TaskContext::new(
                    id,
                    Arc::clone(&task.task_type),
                    Arc::clone(&cancelled),
                    task.progress,
                ),
            };

            match self.deliver(state, slot, job) {
                Ok(()) => {
                    state.slots[slot].status = WorkerStatus::Busy;
                    let generation = state.slots[slot].generation;
                    state.running.insert(
                        id,
                        RunningTask {
                            task_type: task.task_type,
                            slot: Some(slot),
                            generation,
                            cancelled,
                            started: Instant::now(),
                            reply: task.reply,
                        },
                    );
                }
                Err(_job) => {
                    state.stats.record(Outcome::Failed, None);
                    let _ = task.reply.send(Err(TaskError::Failed {
                        task_type: task.task_type.to_string(),
                        message: "no background worker available".to_string(),
                    }));
                }
            }
        }
    }

    /// Hand `job` to a slot's thread, replacing the thread once if it is gone.
    fn deliver(self: &Arc<Self>, state: &mut PoolState, slot: usize, job: Job) -> Result<(), Job> {
        let job = match state.slots[slot].sender.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => return Ok(()),
                Err(mpsc::SendError(job)) => job,
            },
            None => job,
        };
        log::warn!("background worker {slot} exited unexpectedly; respawning");
        self.respawn_slot(state, slot);
        match state.slots[slot].sender.as_ref() {
            Some(tx) => tx.send(job).map_err(|mpsc::SendError(job)| job),
            None => Err(job),
        }
    }

    fn respawn_slot(self: &Arc<Self>, state: &mut PoolState, slot: usize) {
        let generation = state.slots[slot].generation.wrapping_add(1);
        let sender = match spawn_worker(self, slot, generation) {
            Ok(sender) => Some(sender),
            Err(err) => {
                log::warn!("failed to respawn background worker {slot}: {err}");
                None
            }
        };
        let entry = &mut state.slots[slot];
        entry.generation = generation;
        entry.sender = sender;
        entry.status = WorkerStatus::Idle;
    }

    /// Settle a task that ran on `slot` (or on a caller thread when `None`).
    fn finish(self: &Arc<Self>, id: TaskId, slot: Option<(usize, u64)>, result: JobResult) {
        let mut state = self.lock();
        if let Some((slot, generation)) = slot {
            if state.slots.get(slot).map(|s| s.generation) != Some(generation) {
                // The slot was replaced while this task ran; it has already settled.
                return;
            }
        }
        let Some(running) = state.running.remove(&id) else {
            return;
        };

        let panicked = matches!(result, JobResult::Panicked(_));
        let task_type = running.task_type.to_string();
        let (outcome, reply) = if running.cancelled.load(Ordering::Acquire) {
            (Outcome::Cancelled, Err(TaskError::Cancelled(id)))
        } else {
            match result {
                JobResult::Ok(value) => (Outcome::Completed, Ok(value)),
                JobResult::Err(message) => {
                    (Outcome::Failed, Err(TaskError::Failed { task_type, message }))
                }
                JobResult::Panicked(message) => (
                    Outcome::Failed,
                    Err(TaskError::Failed {
                        task_type,
                        message: format!("handler panicked: {message}"),
                    }),
                ),
            }
        };
        state.stats.record(outcome, Some(running.started.elapsed()));
        let _ = running.reply.send(reply);

        if let Some((slot, _)) = slot {
            if panicked {
                // The thread exits after a panic; give the slot a fresh one.
                self.respawn_slot(&mut state, slot);
            } else {
                state.slots[slot].status = WorkerStatus::Idle;
            }
        }
        self.dispatch_locked(&mut state);
    }

    fn cancel(self: &Arc<Self>, id: TaskId) -> bool {
        let mut state = self.lock();
        if let Some(task) = state.queue.remove(id) {
            state.stats.record(Outcome::Cancelled, None);
            let _ = task.reply.send(Err(TaskError::Cancelled(id)));
            log::debug!("cancelled queued task {id}");
            return true;
        }

        let Some(running) = state.running.get(&id) else {
            return false;
        };
        running.cancelled.store(true, Ordering::Release);
        let slot = running.slot.map(|slot| (slot, running.generation));
        drop(state);

        if let Some((slot, generation)) = slot {
            self.arm_cancel_watchdog(id, slot, generation);
        }
        true
    }

    fn arm_cancel_watchdog(self: &Arc<Self>, id: TaskId, slot: usize, generation: u64) {
        let shared = Arc::downgrade(self);
        let grace = self.cancel_grace;
        let spawned = thread::Builder::new()
            .name(format!("tgflow-cancel-{id}"))
            .spawn(move || {
                thread::sleep(grace);
                if let Some(shared) = shared.upgrade() {
                    shared.force_cancel(id, slot, generation);
                }
            });
        if let Err(err) = spawned {
            log::warn!("could not arm cancellation watchdog for task {id}: {err}");
        }
    }

    fn force_cancel(self: &Arc<Self>, id: TaskId, slot: usize, generation: u64) {
        let mut state = self.lock();
        let still_running = state
            .running
            .get(&id)
            .is_some_and(|r| r.slot == Some(slot) && r.generation == generation);
        if !still_running {
            return;
        }
        let Some(running) = state.running.remove(&id) else {
            return;
        };

        log::warn!(
            "task {id} ignored cancellation for {:?}; replacing background worker {slot}",
            self.cancel_grace
        );
        state
            .stats
            .record(Outcome::Cancelled, Some(running.started.elapsed()));
        let _ = running.reply.send(Err(TaskError::Cancelled(id)));
        self.respawn_slot(&mut state, slot);
        self.dispatch_locked(&mut state);
    }

    /// Fallback mode: pop the next task and run it on the calling thread.
    fn run_next_inline(self: &Arc<Self>) -> bool {
        let job = {
            let mut state = self.lock();
            if state.shut_down || !matches!(state.mode, ExecutionMode::Fallback) {
                return false;
            }
            let Some((id, task)) = state.queue.pop() else {
                return false;
            };
            let cancelled = Arc::new(AtomicBool::new(false));
            let ctx = TaskContext::new(
                id,
                Arc::clone(&task.task_type),
                Arc::clone(&cancelled),
                task.progress,
            );
            state.running.insert(
                id,
                RunningTask {
                    task_type: task.task_type,
                    slot: None,
                    generation: 0,
                    cancelled,
                    started: Instant::now(),
                    reply: task.reply,
                },
            );
            Job {
                id,
                payload: task.payload,
                handler: task.handler,
                ctx,
            }
        };

        let id = job.id;
        let result = run_job(job);
        self.finish(id, None, result);
        true
    }
}

fn worker_infos(state: &PoolState) -> Vec<WorkerInfo> {
    match state.mode {
        ExecutionMode::Threaded { .. } => state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.sender.is_some())
            .map(|(id, slot)| WorkerInfo {
                id,
                status: slot.status,
            })
            .collect(),
        ExecutionMode::Fallback => vec![WorkerInfo {
            id: 0,
            status: if state.running.is_empty() {
                WorkerStatus::Idle
            } else {
                WorkerStatus::Busy
            },
        }],
    }
}

fn spawn_worker(shared: &Arc<Shared>, slot: usize, generation: u64) -> std::io::Result<mpsc::Sender<Job>> {
    let (tx, rx) = mpsc::channel::<Job>();
    let shared = Arc::downgrade(shared);
    thread::Builder::new()
        .name(format!("tgflow-worker-{slot}"))
        .spawn(move || worker_loop(shared, slot, generation, rx))?;
    Ok(tx)
}

fn worker_loop(shared: Weak<Shared>, slot: usize, generation: u64, jobs: mpsc::Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        let id = job.id;
        let result = run_job(job);
        let panicked = matches!(result, JobResult::Panicked(_));
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.finish(id, Some((slot, generation)), result);
        if panicked {
            return;
        }
    }
}

fn run_job(job: Job) -> JobResult {
    let Job {
        payload,
        handler,
        ctx,
        ..
    } = job;
    match catch_unwind(AssertUnwindSafe(|| handler(payload, &ctx))) {
        Ok(Ok(value)) => JobResult::Ok(value),
        Ok(Err(message)) => JobResult::Err(message),
        Err(panic) => JobResult::Panicked(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Pending result of [`WorkerPool::execute`].
///
/// Await it from async code or call [`TaskHandle::wait`] from a plain thread.
/// In fallback mode, waiting runs queued tasks (in priority order) on the
/// current thread until this one settles; awaiting runs one queued task per
/// poll and yields in between.
pub struct TaskHandle {
    id: TaskId,
    task_type: Arc<str>,
    rx: oneshot::Receiver<Result<Value, TaskError>>,
    shared: Arc<Shared>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn cancel(&self) -> bool {
        self.shared.cancel(self.id)
    }

    /// Block until the task settles. Must not be called from inside an async
    /// runtime; `.await` the handle there instead.
    pub fn wait(mut self) -> Result<Value, TaskError> {
        if let Some(result) = self.drive_inline() {
            return result;
        }
        self.rx.blocking_recv().unwrap_or(Err(TaskError::PoolShutdown))
    }

    /// [`TaskHandle::wait`], decoding the result into `T`.
    pub fn wait_as<T: DeserializeOwned>(self) -> Result<T, TaskError> {
        let task_type = self.task_type.to_string();
        let value = self.wait()?;
        serde_json::from_value(value).map_err(|err| TaskError::Failed {
            task_type,
            message: format!("unexpected result shape: {err}"),
        })
    }

    /// Run queued work inline until this task settles or nothing is left to
    /// run here.
    fn drive_inline(&mut self) -> Option<Result<Value, TaskError>> {
        loop {
            if let Some(result) = self.try_settled() {
                return Some(result);
            }
            if !self.shared.run_next_inline() {
                return None;
            }
        }
    }

    fn try_settled(&mut self) -> Option<Result<Value, TaskError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Closed) => Some(Err(TaskError::PoolShutdown)),
            Err(TryRecvError::Empty) => None,
        }
    }
}

impl Future for TaskHandle {
    type Output = Result<Value, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        // At most one inline task per poll; the executor gets the thread back
        // between tasks.
        if let Some(result) = this.try_settled() {
            return Poll::Ready(result);
        }
        if this.shared.run_next_inline() {
            if let Some(result) = this.try_settled() {
                return Poll::Ready(result);
            }
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::PoolShutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .finish()
    }
}

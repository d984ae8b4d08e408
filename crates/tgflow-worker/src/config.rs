use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment override for the number of background workers, in the spirit of
/// `RAYON_NUM_THREADS`.
pub const WORKER_THREADS_ENV: &str = "TGFLOW_WORKER_THREADS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// Background threads sized from the host; single-core hosts use the
    /// caller-thread fallback.
    #[default]
    Auto,
    /// Always try to spawn `max_workers` threads (fallback only if spawning fails).
    Threaded,
    /// Run every task on the caller's thread.
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub mode: PoolMode,
    /// Upper bound on background workers (default: 4).
    pub max_workers: usize,
    /// How long a running task may ignore a cancellation request before its
    /// worker is abandoned and replaced (default: 2s).
    pub cancel_grace: Duration,
    /// Number of recent task outcomes `stats()` is computed from (default: 256).
    pub stats_window: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::Auto,
            max_workers: 4,
            cancel_grace: Duration::from_secs(2),
            stats_window: 256,
        }
    }
}

/// How the pool ended up running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Threaded { workers: usize },
    Fallback,
}

pub(crate) fn resolve_execution_mode(config: &WorkerPoolConfig) -> ExecutionMode {
    let max = config.max_workers.max(1);
    match config.mode {
        PoolMode::Fallback => ExecutionMode::Fallback,
        PoolMode::Threaded => ExecutionMode::Threaded { workers: max },
        PoolMode::Auto => {
            let available = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            let requested = std::env::var(WORKER_THREADS_ENV)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0);
            let workers = match requested {
                Some(n) => n.min(available).max(1),
                None => available.min(max).max(1),
            };
            if available <= 1 {
                ExecutionMode::Fallback
            } else {
                ExecutionMode::Threaded { workers }
            }
        }
    }
}

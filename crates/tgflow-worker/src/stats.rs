use crate::config::ExecutionMode;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    outcome: Outcome,
    /// `None` for tasks that never ran (cancelled while queued).
    duration: Option<Duration>,
}

/// Fixed-size window over the most recent task outcomes.
#[derive(Debug)]
pub(crate) struct RollingStats {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl RollingStats {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, outcome: Outcome, duration: Option<Duration>) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { outcome, duration });
    }

    pub fn counts(&self) -> (u64, u64, u64) {
        let mut completed = 0;
        let mut failed = 0;
        let mut cancelled = 0;
        for sample in &self.samples {
            match sample.outcome {
                Outcome::Completed => completed += 1,
                Outcome::Failed => failed += 1,
                Outcome::Cancelled => cancelled += 1,
            }
        }
        (completed, failed, cancelled)
    }

    /// Mean run time over samples that actually ran.
    pub fn avg_duration_ms(&self) -> f64 {
        let (sum, n) = self
            .samples
            .iter()
            .filter_map(|s| s.duration)
            .fold((0.0f64, 0u32), |(sum, n), d| (sum + d.as_secs_f64() * 1000.0, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / f64::from(n)
        }
    }
}

/// Snapshot returned by [`crate::WorkerPool::stats`].
///
/// Outcome counters and the average cover only the rolling window, not the
/// pool's whole history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    pub mode: ExecutionMode,
    pub queue_length: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub avg_duration_ms: f64,
}

//! Per-task progress tracking and adaptive batch sizing.
//!
//! A [`TaskTracker`] is created when a task is drawn from the pending stream
//! and lives until the task's stopping criteria are met with no batch left in
//! flight. Its only job is deciding how many shots to request next.
//!
//! # Batch size
//!
//! The next batch is the minimum of every applicable candidate:
//!
//! ```text
//! no shots finished yet:  start_batch_size, or 0 while the first batch is out
//! ramp:                   ramp_factor * finished
//! parallelism:            parallelism_factor * finished - deployed
//! shot budget:            max_shots - finished - deployed
//! error budget:           (errors_left + error_padding) / p - deployed,
//!                         p = (errors + 1) / (shots + 1)
//! size cap:               max_batch_size
//! duration cap:           target_seconds / seconds_per_shot, at least 1
//! ```
//!
//! Holding back while the first batch is out keeps a task whose error rate
//! turns out to be enormous from being oversampled before any data exists.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CollectError, Result};
use crate::options::CollectionOptions;
use crate::stats::Stats;
use crate::task::TaskDescriptor;

/// Tunable constants of the batch-size heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchHeuristics {
    /// First batch size when the task sets no `start_batch_size`.
    pub default_start_batch_size: u64,
    /// A batch never exceeds this multiple of the finished shots.
    pub ramp_factor: u64,
    /// Shots in flight never exceed this multiple of the finished shots.
    pub parallelism_factor: u64,
    /// Extra errors budgeted for when projecting the shots still needed.
    pub error_padding: u64,
    /// Batch duration target when the task sets neither `max_batch_size`
    /// nor `max_batch_seconds`.
    pub default_batch_duration: Duration,
}

impl Default for BatchHeuristics {
    fn default() -> Self {
        Self {
            default_start_batch_size: 100,
            ramp_factor: 2,
            parallelism_factor: 30,
            error_padding: 2,
            default_batch_duration: Duration::from_secs(10),
        }
    }
}

impl BatchHeuristics {
    /// Reject settings under which an unfinished task could be handed no
    /// work at all.
    pub fn validate(&self) -> Result<()> {
        let factors = [
            ("default_start_batch_size", self.default_start_batch_size),
            ("ramp_factor", self.ramp_factor),
            ("parallelism_factor", self.parallelism_factor),
        ];
        for (field, value) in factors {
            if value == 0 {
                return Err(CollectError::InvalidConfig(format!(
                    "heuristics.{field} must be at least 1"
                )));
            }
        }
        if self.default_batch_duration.is_zero() {
            return Err(CollectError::InvalidConfig(
                "heuristics.default_batch_duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Running state of one active task.
#[derive(Debug, Clone)]
pub struct TaskTracker {
    task: Arc<TaskDescriptor>,
    strong_id: String,
    options: CollectionOptions,
    heuristics: BatchHeuristics,
    /// Totals including anything already in the store.
    finished: Stats,
    /// Totals gathered by this run only.
    collected: Stats,
    deployed_shots: u64,
    deployed_processes: usize,
}

impl TaskTracker {
    /// `options` are the task's effective options; `prior` is whatever the
    /// store already holds for this task.
    ///
    /// Fails unless `options` bound the task by shots or by errors.
    pub fn new(
        task: Arc<TaskDescriptor>,
        options: CollectionOptions,
        prior: Stats,
        heuristics: BatchHeuristics,
    ) -> Result<Self> {
        options.validate()?;
        heuristics.validate()?;
        if options.max_shots.is_none() && options.max_errors.is_none() {
            return Err(CollectError::InvalidOptions {
                field: "max_shots",
                reason: "at least one of max_shots or max_errors must be set".to_string(),
            });
        }
        let strong_id = task.strong_id()?.to_string();
        Ok(Self {
            task,
            strong_id,
            options,
            heuristics,
            finished: prior,
            collected: Stats::default(),
            deployed_shots: 0,
            deployed_processes: 0,
        })
    }

    pub fn task(&self) -> &Arc<TaskDescriptor> {
        &self.task
    }

    pub fn strong_id(&self) -> &str {
        &self.strong_id
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    pub fn finished(&self) -> &Stats {
        &self.finished
    }

    pub fn collected(&self) -> &Stats {
        &self.collected
    }

    pub fn deployed_shots(&self) -> u64 {
        self.deployed_shots
    }

    pub fn deployed_processes(&self) -> usize {
        self.deployed_processes
    }

    fn limits_reached(&self) -> bool {
        self.options
            .limits_reached(self.finished.shots, self.finished.errors)
    }

    /// Stopping criteria met and nothing left in flight.
    pub fn is_done(&self) -> bool {
        self.limits_reached() && self.deployed_shots == 0
    }

    /// How many shots to request next; 0 means "nothing to hand out now".
    pub fn next_batch_size(&self) -> u64 {
        if self.limits_reached() {
            return 0;
        }
        let h = &self.heuristics;
        let finished = self.finished.shots as i128;
        let deployed = self.deployed_shots as i128;
        let mut candidates: Vec<i128> = Vec::with_capacity(7);

        if finished == 0 {
            if self.deployed_shots > 0 {
                return 0;
            }
            let start = self
                .options
                .start_batch_size
                .unwrap_or(h.default_start_batch_size);
            candidates.push(start as i128);
        } else {
            candidates.push(h.ramp_factor as i128 * finished);
            candidates.push(h.parallelism_factor as i128 * finished - deployed);
        }

        if let Some(max_shots) = self.options.max_shots {
            candidates.push(max_shots as i128 - finished - deployed);
        }

        if let Some(max_errors) = self.options.max_errors {
            let errors_left = max_errors.saturating_sub(self.finished.errors);
            // (errors_left + padding) / ((errors + 1) / (shots + 1))
            let projected = (errors_left.saturating_add(h.error_padding) as f64
                * (self.finished.shots as f64 + 1.0)
                / (self.finished.errors as f64 + 1.0))
                .ceil();
            candidates.push(projected.min(i128::MAX as f64 / 2.0) as i128 - deployed);
        }

        if let Some(max_batch) = self.options.max_batch_size {
            candidates.push(max_batch as i128);
        }

        if let Some(cap) = self.duration_cap() {
            candidates.push(cap);
        }

        let n = candidates.into_iter().min().unwrap_or(0);
        n.clamp(0, u64::MAX as i128) as u64
    }

    fn duration_cap(&self) -> Option<i128> {
        let target = match (self.options.max_batch_seconds, self.options.max_batch_size) {
            (Some(seconds), _) => seconds,
            (None, None) => self.heuristics.default_batch_duration.as_secs_f64(),
            (None, Some(_)) => return None,
        };
        if self.finished.shots == 0 {
            return None;
        }
        let seconds = self.finished.seconds();
        if seconds <= 0.0 {
            return None;
        }
        let shots = (target * self.finished.shots as f64 / seconds).floor().max(1.0);
        Some(shots.min(i128::MAX as f64 / 2.0) as i128)
    }

    /// Reserve the next batch, if there is one to hand out.
    pub fn provide_work(&mut self) -> Option<u64> {
        let n = self.next_batch_size();
        if n == 0 {
            return None;
        }
        self.deployed_shots = self.deployed_shots.saturating_add(n);
        self.deployed_processes += 1;
        Some(n)
    }

    /// Fold in the result of a batch that was reserved with `shots_requested`.
    pub fn on_result(&mut self, shots_requested: u64, stats: &Stats) {
        self.deployed_shots = self.deployed_shots.saturating_sub(shots_requested);
        self.deployed_processes = self.deployed_processes.saturating_sub(1);
        self.finished = &self.finished + stats;
        self.collected = &self.collected + stats;
    }
}

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use crate::error::{CollectError, Result};
use crate::options::CollectionOptions;
use crate::stats::Stats;
use crate::store::{ResultStore, TaskStats};
use crate::task::TaskDescriptor;
use crate::tracker::{BatchHeuristics, TaskTracker};

use super::{Job, JobId, ShutdownReport, WorkerPool};

type TrackerId = u64;

/// A task that was drawn from the pending stream and is now being sampled.
#[derive(Debug, Clone)]
pub struct StartedTask {
    pub strong_id: String,
    pub options: CollectionOptions,
    /// Totals already in the store when the task was drawn.
    pub prior: Stats,
}

/// The result of one batch, after it has been folded into its task.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub strong_id: String,
    pub worker: usize,
    pub shots_requested: u64,
    pub stats: Stats,
    /// Running totals for the task, prior store contents included.
    pub finished: Stats,
    /// Set when this batch completed the task: the totals gathered by this
    /// run, ready to append to the store.
    pub completed: Option<TaskStats>,
}

/// Hands batches of pending tasks to a [`WorkerPool`] and routes results back
/// to the task they belong to.
///
/// Tasks are drawn lazily. While at least two tasks are active, work is
/// taken from active tasks first; otherwise a new task is drawn first. A
/// drawn task that the store already satisfies is skipped, and a task whose
/// strong id was seen before is dropped.
pub struct Dispatcher<I> {
    pool: WorkerPool,
    pending: I,
    pending_done: bool,
    prior: ResultStore,
    options: CollectionOptions,
    heuristics: BatchHeuristics,
    trackers: BTreeMap<TrackerId, TaskTracker>,
    jobs: HashMap<JobId, TrackerId>,
    seen: HashSet<String>,
    next_job: JobId,
    next_tracker: TrackerId,
    skipped: usize,
}

impl<I> Dispatcher<I>
where
    I: Iterator<Item = TaskDescriptor>,
{
    /// `options` are the global defaults folded into every task's own options.
    pub fn new(
        pool: WorkerPool,
        tasks: impl IntoIterator<IntoIter = I>,
        prior: ResultStore,
        options: CollectionOptions,
        heuristics: BatchHeuristics,
    ) -> Self {
        Self {
            pool,
            pending: tasks.into_iter(),
            pending_done: false,
            prior,
            options,
            heuristics,
            trackers: BTreeMap::new(),
            jobs: HashMap::new(),
            seen: HashSet::new(),
            next_job: 0,
            next_tracker: 0,
            skipped: 0,
        }
    }

    /// Jobs handed to the pool whose results have not come back yet.
    pub fn outstanding(&self) -> usize {
        self.jobs.len()
    }

    pub fn active_tasks(&self) -> usize {
        self.trackers.len()
    }

    /// Tasks skipped because the store already satisfied them.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Submit jobs until every worker has one or there is no more work.
    ///
    /// Returns the tasks that were activated while doing so.
    pub fn fill_work_queue(&mut self) -> Result<Vec<StartedTask>> {
        let mut started = Vec::new();
        while self.jobs.len() < self.pool.size() {
            let Some((tracker_id, shots)) = self.next_work(&mut started)? else {
                break;
            };
            let task = match self.trackers.get(&tracker_id) {
                Some(tracker) => tracker.task().clone(),
                None => break,
            };
            let id = self.next_job;
            self.next_job += 1;
            self.pool.submit(Job { id, task, shots })?;
            self.jobs.insert(id, tracker_id);
        }
        Ok(started)
    }

    fn next_work(&mut self, started: &mut Vec<StartedTask>) -> Result<Option<(TrackerId, u64)>> {
        if self.trackers.len() >= 2 {
            if let Some(work) = self.work_from_active() {
                return Ok(Some(work));
            }
            return self.work_from_new(started);
        }
        match self.work_from_new(started)? {
            Some(work) => Ok(Some(work)),
            None => Ok(self.work_from_active()),
        }
    }

    fn work_from_active(&mut self) -> Option<(TrackerId, u64)> {
        self.trackers
            .iter_mut()
            .find_map(|(&id, tracker)| tracker.provide_work().map(|shots| (id, shots)))
    }

    fn work_from_new(&mut self, started: &mut Vec<StartedTask>) -> Result<Option<(TrackerId, u64)>> {
        while !self.pending_done {
            let Some(task) = self.pending.next() else {
                self.pending_done = true;
                break;
            };
            let Some(mut tracker) = self.activate(task)? else {
                continue;
            };

            started.push(StartedTask {
                strong_id: tracker.strong_id().to_string(),
                options: tracker.options().clone(),
                prior: tracker.finished().clone(),
            });
            let id = self.next_tracker;
            self.next_tracker += 1;
            let work = tracker.provide_work();
            self.trackers.insert(id, tracker);
            if let Some(shots) = work {
                return Ok(Some((id, shots)));
            }
        }
        Ok(None)
    }

    fn activate(&mut self, task: TaskDescriptor) -> Result<Option<TaskTracker>> {
        let strong_id = task.strong_id()?.to_string();
        if !self.seen.insert(strong_id.clone()) {
            tracing::debug!(strong_id = %strong_id, "dropping duplicate task");
            return Ok(None);
        }
        let options = task.effective_options(&self.options);
        let prior = self.prior.stats_for(&strong_id);
        let tracker = TaskTracker::new(task.into_shared(), options, prior, self.heuristics)?;
        if tracker.is_done() {
            tracing::debug!(strong_id = %strong_id, "task already satisfied by the store");
            self.skipped += 1;
            return Ok(None);
        }
        Ok(Some(tracker))
    }

    /// Wait for the next batch and fold it into its task.
    ///
    /// A worker failure ends the run with [`CollectError::WorkerFailed`].
    pub async fn wait_for_next_result(&mut self) -> Result<BatchResult> {
        let outcome = self
            .pool
            .next_outcome()
            .await
            .ok_or(CollectError::PoolDisconnected {
                outstanding: self.jobs.len(),
            })?;
        let tracker_id = self.jobs.remove(&outcome.job_id).ok_or_else(|| {
            CollectError::Sampling(format!("result for unknown job {}", outcome.job_id))
        })?;
        let stats = outcome.result.map_err(|failure| CollectError::WorkerFailed {
            worker: outcome.worker,
            failure,
        })?;

        let tracker = self.trackers.get_mut(&tracker_id).ok_or_else(|| {
            CollectError::Sampling(format!("result for retired task of job {}", outcome.job_id))
        })?;
        tracker.on_result(outcome.shots_requested, &stats);
        let strong_id = tracker.strong_id().to_string();
        let finished = tracker.finished().clone();

        let completed = if tracker.is_done() {
            match self.trackers.remove(&tracker_id) {
                Some(done) => Some(TaskStats::from_task(done.task(), done.collected().clone())?),
                None => None,
            }
        } else {
            None
        };

        Ok(BatchResult {
            strong_id,
            worker: outcome.worker,
            shots_requested: outcome.shots_requested,
            stats,
            finished,
            completed,
        })
    }

    pub async fn shutdown(&mut self, timeout: Duration) -> ShutdownReport {
        self.pool.shutdown(timeout).await
    }
}

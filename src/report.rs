use serde::{Deserialize, Serialize};

use crate::pool::{BatchResult, StartedTask};
use crate::store::TaskStats;

/// A [`TaskSummary`] is the processed form of a task's accumulated [`Stats`](crate::Stats).
///
/// It is pure data: rates and per-shot timings derived from raw counts, with
/// no I/O. Summaries can be serialized, logged, or handed to a [`Reporter`].
///
/// Rates are taken over *kept* shots (shots minus discards); a task with no
/// kept shots has an error rate of zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub strong_id: String,
    pub decoder: String,
    pub shots: u64,
    pub errors: u64,
    pub discards: u64,
    pub seconds: f64,
    pub error_rate: f64,
    pub discard_rate: f64,
    pub seconds_per_shot: f64,
}

impl From<&TaskStats> for TaskSummary {
    fn from(entry: &TaskStats) -> Self {
        let stats = &entry.stats;
        let kept = stats.shots.saturating_sub(stats.discards);
        let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        Self {
            strong_id: entry.strong_id.clone(),
            decoder: entry.decoder.clone(),
            shots: stats.shots,
            errors: stats.errors,
            discards: stats.discards,
            seconds: stats.seconds(),
            error_rate: ratio(stats.errors, kept),
            discard_rate: ratio(stats.discards, stats.shots),
            seconds_per_shot: if stats.shots == 0 {
                0.0
            } else {
                stats.seconds() / stats.shots as f64
            },
        }
    }
}

/// Something worth telling the user about while a collection runs.
#[derive(Debug, Clone, Copy)]
pub enum ProgressEvent<'a> {
    TaskStarted(&'a StartedTask),
    BatchFinished(&'a BatchResult),
    /// A task met its limits; the summary covers this run's shots only.
    TaskFinished(&'a TaskSummary),
    /// Every task was already satisfied by the store.
    NoWork { skipped: usize },
}

/// A [`Reporter`] consumes [`ProgressEvent`]s and performs side effects:
/// logging them, drawing a progress bar, or forwarding them elsewhere.
///
/// Reporters are called from the collection loop between batches, so they
/// should return quickly.
///
/// # Example
/// ```rust
/// use harvest::report::{ProgressEvent, Reporter};
///
/// struct CountFinished(std::sync::atomic::AtomicUsize);
///
/// impl Reporter for CountFinished {
///     fn report(&self, event: &ProgressEvent<'_>) {
///         if let ProgressEvent::TaskFinished(_) = event {
///             self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
///         }
///     }
/// }
/// ```
pub trait Reporter: Send + Sync {
    fn report(&self, event: &ProgressEvent<'_>);
}

impl<F> Reporter for F
where
    F: Fn(&ProgressEvent<'_>) + Send + Sync,
{
    fn report(&self, event: &ProgressEvent<'_>) {
        self(event)
    }
}

/// Writes events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: &ProgressEvent<'_>) {
        match event {
            ProgressEvent::TaskStarted(task) => tracing::info!(
                strong_id = %task.strong_id,
                prior_shots = task.prior.shots,
                prior_errors = task.prior.errors,
                "Starting task"
            ),
            ProgressEvent::BatchFinished(batch) => tracing::debug!(
                strong_id = %batch.strong_id,
                worker = batch.worker,
                shots = batch.stats.shots,
                errors = batch.stats.errors,
                total_shots = batch.finished.shots,
                total_errors = batch.finished.errors,
                "batch finished"
            ),
            ProgressEvent::TaskFinished(summary) => tracing::info!(
                strong_id = %summary.strong_id,
                decoder = %summary.decoder,
                shots = summary.shots,
                errors = summary.errors,
                discards = summary.discards,
                error_rate = summary.error_rate,
                "Task finished"
            ),
            ProgressEvent::NoWork { skipped } => {
                tracing::info!("No work to do: all {skipped} task(s) already satisfied.")
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&self, _: &ProgressEvent<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stats;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn entry(shots: u64, errors: u64, discards: u64, secs: u64) -> TaskStats {
        TaskStats {
            strong_id: "id".to_string(),
            decoder: "dec".to_string(),
            metadata: json!(null),
            stats: Stats::new(shots, errors, discards, Duration::from_secs(secs)),
        }
    }

    #[test]
    fn summary_rates_use_kept_shots() {
        let summary = TaskSummary::from(&entry(1000, 9, 100, 2));
        assert_eq!(summary.error_rate, 0.01);
        assert_eq!(summary.discard_rate, 0.1);
        assert_eq!(summary.seconds_per_shot, 0.002);
    }

    #[test]
    fn summary_of_fully_discarded_task() {
        let summary = TaskSummary::from(&entry(10, 0, 10, 0));
        assert_eq!(summary.error_rate, 0.0);
        assert_eq!(summary.discard_rate, 1.0);
    }

    #[test]
    fn summaries_serialize() {
        let summary = TaskSummary::from(&entry(4, 1, 0, 1));
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["error_rate"], json!(0.25));
        let back: TaskSummary = serde_json::from_value(value).unwrap();
        assert_eq!(back, summary);
    }

    #[test]
    fn closures_are_reporters() {
        let seen = Mutex::new(Vec::new());
        let reporter = |event: &ProgressEvent<'_>| {
            if let ProgressEvent::NoWork { skipped } = event {
                seen.lock().unwrap().push(*skipped);
            }
        };
        reporter.report(&ProgressEvent::NoWork { skipped: 3 });
        LogReporter.report(&ProgressEvent::NoWork { skipped: 3 });
        NoopReporter.report(&ProgressEvent::NoWork { skipped: 3 });
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }
}

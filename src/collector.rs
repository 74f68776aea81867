//! The top-level collection loop.
//!
//! # High-level flow
//! 1. Spawn the worker pool and wrap it in a [`Dispatcher`] together with the
//!    pending tasks and whatever the store already holds.
//! 2. Fill the job queue, await one batch result, fold it in, repeat. When a
//!    task completes, its newly gathered totals are appended to the store.
//! 3. When no job is outstanding after a refill, every task is done. An
//!    active task left without work at that point is a [`CollectError::Stalled`].
//! 4. The pool is shut down on every exit path, errors included, before the
//!    outcome is returned.

use std::path::Path;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::error::{CollectError, Result};
use crate::options::CollectionOptions;
use crate::pool::{Dispatcher, ShutdownReport, WorkerPool};
use crate::report::{ProgressEvent, Reporter, TaskSummary};
use crate::sampler::SamplerRegistry;
use crate::stats::Stats;
use crate::store::{ResultStore, StoreWriter};
use crate::task::TaskDescriptor;
use crate::throttle::ThrottleConfig;
use crate::tracker::BatchHeuristics;

/// Everything a [`Collector`] needs besides the tasks themselves.
///
/// # Example
/// ```rust
/// use harvest::{CollectionOptions, CollectorConfig, SamplerRegistry};
///
/// let config = CollectorConfig::builder()
///     .workers(4)
///     .options(CollectionOptions::builder().max_shots(10_000).build())
///     .registry(SamplerRegistry::new())
///     .build();
/// assert_eq!(config.workers, 4);
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct CollectorConfig {
    /// Number of worker threads.
    #[builder(default = num_cpus::get())]
    pub workers: usize,
    /// Defaults folded into every task's own options.
    #[builder(default)]
    pub options: CollectionOptions,
    #[builder(default)]
    pub heuristics: BatchHeuristics,
    #[builder(default)]
    pub throttle: ThrottleConfig,
    /// How long shutdown waits for busy workers before abandoning them.
    #[builder(default = Duration::from_secs(5))]
    pub shutdown_timeout: Duration,
    /// Decoder name to sampler.
    pub registry: SamplerRegistry,
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CollectError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        self.options.validate()?;
        self.heuristics.validate()?;
        self.throttle.validate()
    }
}

/// What a finished collection run did.
#[derive(Debug, Clone, Default)]
pub struct CollectionSummary {
    /// Tasks completed by this run, in completion order.
    pub tasks: Vec<TaskSummary>,
    /// Tasks the store already satisfied.
    pub skipped: usize,
    pub batches: u64,
    /// Everything gathered by this run.
    pub collected: Stats,
    pub shutdown: ShutdownReport,
}

impl CollectionSummary {
    /// Whether the run found nothing to sample.
    pub fn is_noop(&self) -> bool {
        self.batches == 0
    }
}

/// Drives tasks to completion over a pool of workers.
#[derive(Debug, Clone)]
pub struct Collector {
    config: CollectorConfig,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Collect into an in-memory store.
    ///
    /// `store` supplies prior totals and receives every completed task.
    pub async fn collect(
        &self,
        tasks: impl IntoIterator<Item = TaskDescriptor>,
        store: &mut ResultStore,
        reporter: &dyn Reporter,
    ) -> Result<CollectionSummary> {
        self.run(tasks, store, None, reporter).await
    }

    /// Collect into the CSV store at `path`, resuming from its contents.
    ///
    /// Completed tasks are appended as they finish, so an interrupted run
    /// keeps everything completed before the interruption.
    pub async fn collect_to_path(
        &self,
        tasks: impl IntoIterator<Item = TaskDescriptor>,
        path: impl AsRef<Path>,
        reporter: &dyn Reporter,
    ) -> Result<(CollectionSummary, ResultStore)> {
        let (mut writer, mut store) = StoreWriter::open(path)?;
        let summary = self
            .run(tasks, &mut store, Some(&mut writer), reporter)
            .await?;
        Ok((summary, store))
    }

    async fn run(
        &self,
        tasks: impl IntoIterator<Item = TaskDescriptor>,
        store: &mut ResultStore,
        writer: Option<&mut StoreWriter>,
        reporter: &dyn Reporter,
    ) -> Result<CollectionSummary> {
        let config = &self.config;
        let pool = WorkerPool::spawn(config.workers, config.registry.clone(), config.throttle)?;
        let mut dispatcher = Dispatcher::new(
            pool,
            tasks,
            store.clone(),
            config.options.clone(),
            config.heuristics,
        );

        tracing::info!("Dispatching work...");
        let mut summary = CollectionSummary::default();
        let outcome = drive(&mut dispatcher, store, writer, reporter, &mut summary).await;

        tracing::info!("Shutting down workers...");
        summary.shutdown = dispatcher.shutdown(config.shutdown_timeout).await;
        summary.skipped = dispatcher.skipped();

        if let Err(err) = outcome {
            tracing::error!("Collection failed: {err}");
            return Err(err);
        }
        if summary.is_noop() {
            reporter.report(&ProgressEvent::NoWork {
                skipped: summary.skipped,
            });
        }
        tracing::info!(
            tasks = summary.tasks.len(),
            batches = summary.batches,
            shots = summary.collected.shots,
            "Done collecting!"
        );
        Ok(summary)
    }
}

async fn drive<I>(
    dispatcher: &mut Dispatcher<I>,
    store: &mut ResultStore,
    mut writer: Option<&mut StoreWriter>,
    reporter: &dyn Reporter,
    summary: &mut CollectionSummary,
) -> Result<()>
where
    I: Iterator<Item = TaskDescriptor>,
{
    loop {
        for started in dispatcher.fill_work_queue()? {
            reporter.report(&ProgressEvent::TaskStarted(&started));
        }
        if dispatcher.outstanding() == 0 {
            let active = dispatcher.active_tasks();
            if active > 0 {
                return Err(CollectError::Stalled { active });
            }
            return Ok(());
        }

        let batch = dispatcher.wait_for_next_result().await?;
        summary.batches += 1;
        summary.collected = &summary.collected + &batch.stats;
        reporter.report(&ProgressEvent::BatchFinished(&batch));

        if let Some(done) = batch.completed {
            if let Some(writer) = writer.as_deref_mut() {
                writer.append(&done)?;
            }
            let task_summary = TaskSummary::from(&done);
            store.add(done)?;
            reporter.report(&ProgressEvent::TaskFinished(&task_summary));
            summary.tasks.push(task_summary);
        }
    }
}

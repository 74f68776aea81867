//! A fixed set of worker threads fed through a shared job queue.
//!
//! # High-level flow
//! 1. [`WorkerPool::spawn`] starts `n` named OS threads. They share one
//!    inbound job queue (a `std::sync::mpsc` receiver behind a mutex) and one
//!    outbound result queue (a `tokio` unbounded channel, so the driver can
//!    await results while workers send synchronously).
//! 2. Each worker takes a [`Job`], resolves the task's decoder in the
//!    [`SamplerRegistry`], compiles the sampler (keeping the last one around,
//!    keyed by strong id), wraps it in a throttle unless it paces itself, and
//!    runs one batch.
//! 3. The batch's [`Stats`], or a [`WorkerFailure`] if the sampler failed or
//!    panicked, is posted back as a [`JobOutcome`].
//! 4. [`WorkerPool::shutdown`] sends one stop message per worker and waits
//!    for every worker's exit signal against a single shared deadline.
//!    Threads cannot be killed, so workers still busy at the deadline are
//!    detached and listed in the [`ShutdownReport`].
//!
//! Scheduling lives in [`Dispatcher`], which owns the pool.

mod dispatch;

pub use dispatch::{BatchResult, Dispatcher, StartedTask};

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};

use crate::error::{CollectError, FailureKind, Result, WorkerFailure};
use crate::sampler::{CompiledSampler, SamplerRegistry};
use crate::stats::Stats;
use crate::task::TaskDescriptor;
use crate::throttle::{ThrottleConfig, throttle};

/// Identifier of a job, unique within one pool.
pub type JobId = u64;

/// One batch of work for one task.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub task: Arc<TaskDescriptor>,
    /// Suggested number of shots.
    pub shots: u64,
}

/// What a worker reports back for a [`Job`].
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub worker: usize,
    pub shots_requested: u64,
    pub result: std::result::Result<Stats, WorkerFailure>,
}

/// Which workers stopped in time and which were left running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: Vec<usize>,
    pub abandoned: Vec<usize>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

enum Message {
    Run(Job),
    Stop,
}

struct WorkerHandle {
    index: usize,
    thread: Option<thread::JoinHandle<()>>,
    exited: Option<oneshot::Receiver<()>>,
}

/// Owns the worker threads and both ends of the queues the driver uses.
pub struct WorkerPool {
    jobs: mpsc::Sender<Message>,
    results: UnboundedReceiver<JobOutcome>,
    stopping: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
    report: Option<ShutdownReport>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, registry: SamplerRegistry, config: ThrottleConfig) -> Result<Self> {
        if workers == 0 {
            return Err(CollectError::InvalidConfig(
                "the worker pool needs at least one worker".to_string(),
            ));
        }
        config.validate()?;

        let (job_tx, job_rx) = mpsc::channel();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = unbounded_channel();
        let stopping = Arc::new(AtomicBool::new(false));

        tracing::info!("Spawning {workers} workers...");
        let handles = (0..workers)
            .map(|index| -> Result<WorkerHandle> {
                let (exit_tx, exit_rx) = oneshot::channel();
                let worker = Worker {
                    index,
                    jobs: job_rx.clone(),
                    results: result_tx.clone(),
                    stopping: stopping.clone(),
                    registry: registry.clone(),
                    throttle: config,
                };
                let thread = thread::Builder::new()
                    .name(format!("harvest-worker-{index}"))
                    .spawn(move || {
                        worker.run();
                        let _ = exit_tx.send(());
                    })?;
                Ok(WorkerHandle {
                    index,
                    thread: Some(thread),
                    exited: Some(exit_rx),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            jobs: job_tx,
            results: result_rx,
            stopping,
            workers: handles,
            report: None,
        })
    }

    /// Number of workers the pool was spawned with.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .send(Message::Run(job))
            .map_err(|_| CollectError::PoolDisconnected { outstanding: 1 })
    }

    /// Next outcome from any worker; `None` once every worker has exited.
    pub async fn next_outcome(&mut self) -> Option<JobOutcome> {
        self.results.recv().await
    }

    /// Stop every worker, waiting at most `timeout` overall.
    ///
    /// Jobs still queued are dropped. Calling this again returns the first
    /// report without waiting.
    pub async fn shutdown(&mut self, timeout: Duration) -> ShutdownReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        self.stop();

        let deadline = Instant::now() + timeout;
        let waits = self.workers.iter_mut().map(|worker| {
            let exited = worker.exited.take();
            async move {
                match exited {
                    // a dropped sender also means the thread is gone
                    Some(rx) => timeout_at(deadline, rx).await.is_ok(),
                    None => true,
                }
            }
        });
        let exited = join_all(waits).await;

        let mut report = ShutdownReport::default();
        for (worker, exited) in self.workers.iter_mut().zip(exited) {
            let thread = worker.thread.take();
            if exited {
                if let Some(thread) = thread {
                    if thread.join().is_err() {
                        tracing::warn!("Worker {} exited by panicking.", worker.index);
                    }
                }
                report.joined.push(worker.index);
            } else {
                tracing::warn!(
                    "Worker {} did not stop within {timeout:?}, abandoning it.",
                    worker.index
                );
                report.abandoned.push(worker.index);
            }
        }
        tracing::debug!(
            joined = report.joined.len(),
            abandoned = report.abandoned.len(),
            "worker pool shut down"
        );
        self.report = Some(report.clone());
        report
    }

    fn stop(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            for _ in &self.workers {
                let _ = self.jobs.send(Message::Stop);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // join handles are dropped with the pool, detaching the threads
        self.stop();
    }
}

struct CachedSampler {
    strong_id: String,
    sampler: Box<dyn CompiledSampler>,
}

struct Worker {
    index: usize,
    jobs: Arc<Mutex<mpsc::Receiver<Message>>>,
    results: UnboundedSender<JobOutcome>,
    stopping: Arc<AtomicBool>,
    registry: SamplerRegistry,
    throttle: ThrottleConfig,
}

impl Worker {
    fn run(self) {
        tracing::debug!("Worker {} started.", self.index);
        let mut cache: Option<CachedSampler> = None;

        loop {
            let message = self
                .jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv();
            let job = match message {
                Ok(Message::Run(job)) => job,
                Ok(Message::Stop) | Err(_) => break,
            };
            if self.stopping.load(Ordering::Acquire) {
                continue;
            }

            let result = self.run_job(&job, &mut cache);
            if result.is_err() {
                cache = None;
            }
            let outcome = JobOutcome {
                job_id: job.id,
                worker: self.index,
                shots_requested: job.shots,
                result,
            };
            if self.results.send(outcome).is_err() {
                break;
            }
        }

        tracing::debug!("Worker {} shutting down.", self.index);
    }

    fn run_job(
        &self,
        job: &Job,
        cache: &mut Option<CachedSampler>,
    ) -> std::result::Result<Stats, WorkerFailure> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.sample(job, cache))) {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(err)) => Err(WorkerFailure::from_error(&err, self.trace(job))),
            Err(payload) => Err(WorkerFailure::new(
                FailureKind::Panic,
                panic_message(payload.as_ref()),
                self.trace(job),
            )),
        }
    }

    fn sample(&self, job: &Job, cache: &mut Option<CachedSampler>) -> Result<Stats> {
        let strong_id = job.task.strong_id()?;
        let cached = match cache.take() {
            Some(cached) if cached.strong_id == strong_id => cached,
            _ => {
                let decoder = job.task.decoder().ok_or(CollectError::MissingDecoder)?;
                let compiled = self.registry.resolve(decoder)?.compile(&job.task)?;
                tracing::debug!(worker = self.index, strong_id, decoder, "compiled sampler");
                CachedSampler {
                    strong_id: strong_id.to_string(),
                    sampler: throttle(compiled, self.throttle),
                }
            }
        };

        let stats = cache.insert(cached).sampler.sample(job.shots)?;
        if stats.shots == 0 {
            return Err(CollectError::Sampling(
                "sampler reported a batch of zero shots".to_string(),
            ));
        }
        stats.validate()?;
        tracing::debug!(
            worker = self.index,
            requested = job.shots,
            shots = stats.shots,
            errors = stats.errors,
            "batch done"
        );
        Ok(stats)
    }

    fn trace(&self, job: &Job) -> String {
        let mut trace = format!(
            "while sampling {} shots of task {} on harvest-worker-{}",
            job.shots,
            job.task.strong_id().unwrap_or("<no strong id>"),
            self.index
        );
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            trace.push('\n');
            trace.push_str(&backtrace.to_string());
        }
        trace
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

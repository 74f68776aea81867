//! Harvest: adaptive and resumable collection of sampling statistics.
//!
//! Harvest runs many independent, repeatable sampling tasks (think Monte
//! Carlo estimates of a logical error rate) on a fixed pool of worker
//! threads. It sizes every batch on the fly, stops each task once it has
//! enough shots or errors, and keeps the totals in a CSV store keyed by a
//! content hash of the task, so an interrupted run picks up where it left off.
//!
//! The engine knows nothing about what a shot is. You provide the sampling
//! through the [`Sampler`] trait (or the simulate-then-decode contract in
//! [`decoding`]); harvest handles scheduling, merging and persistence.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`TaskDescriptor`]: one immutable sampling problem, identified by its
//!   strong id.
//! - [`CollectionOptions`]: when to stop and how large batches may get.
//! - [`Sampler`] / [`CompiledSampler`]: the pluggable computation, looked up by
//!   decoder name in a [`SamplerRegistry`].
//! - [`Stats`]: the additive result of one or more batches.
//! - [`ResultStore`] / [`StoreWriter`]: the persisted, append-only table.
//! - [`Collector`]: runs the dispatch loop over a [`pool::WorkerPool`].
//! - [`Reporter`]: receives progress events, for logging or display.
//!
//! # Example
//!
//! ```rust,no_run
//! use harvest::builtins::BernoulliSampler;
//! use harvest::report::LogReporter;
//! use harvest::{CollectionOptions, Collector, CollectorConfig, SamplerRegistry};
//! use harvest::task::{Artifact, TaskDescriptor};
//! use serde_json::json;
//!
//! # async fn run() -> harvest::error::Result<()> {
//! let registry = SamplerRegistry::new().with("bernoulli", BernoulliSampler::new());
//! let collector = Collector::new(
//!     CollectorConfig::builder()
//!         .options(CollectionOptions::builder().max_errors(100).build())
//!         .registry(registry)
//!         .build(),
//! )?;
//! let tasks = [0.01, 0.02].map(|p| {
//!     TaskDescriptor::new(Artifact::new(json!({ "p": p }), 0, 0))
//!         .with_decoder("bernoulli")
//!         .with_metadata(json!({ "p": p }))
//! });
//! let (summary, _store) = collector
//!     .collect_to_path(tasks, "stats.csv", &LogReporter)
//!     .await?;
//! println!("{} tasks finished", summary.tasks.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Feature flags
//! - `builtins` (default): simple samplers for demos and tests, pulling in `rand`.

/// Ready-made samplers
#[cfg(feature = "builtins")]
pub mod builtins;
/// Top-level collection loop
pub mod collector;
/// Simulate-then-decode sampling over bit-packed records
pub mod decoding;
pub mod error;
/// Stopping criteria and batch limits
pub mod options;
/// Worker threads, job dispatch and shutdown
pub mod pool;
/// Progress events and reporters
pub mod report;
/// The sampling contract and registry
pub mod sampler;
pub mod stats;
/// The persisted result table
pub mod store;
pub mod task;
pub mod throttle;
/// Per-task adaptive batch sizing
pub mod tracker;

pub use collector::{CollectionSummary, Collector, CollectorConfig};
pub use error::{CollectError, Result};
pub use options::CollectionOptions;
pub use report::{LogReporter, NoopReporter, ProgressEvent, Reporter, TaskSummary};
pub use sampler::{CompiledSampler, Sampler, SamplerRegistry};
pub use stats::Stats;
pub use store::{ResultStore, StoreWriter, TaskStats};
pub use task::{Artifact, DiscardMask, TaskDescriptor};
pub use tracker::BatchHeuristics;

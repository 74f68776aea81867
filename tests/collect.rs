use std::time::Duration;

use harvest::builtins::{BernoulliSampler, MissingBackend};
use harvest::decoding::{
    CompiledDecoder, CompiledDetectionSource, Decoder, DecodingSampler, Detections,
    DetectionSource, PackedRecords,
};
use harvest::{
    Artifact, CollectError, CollectionOptions, Collector, CollectorConfig, CompiledSampler,
    DiscardMask, NoopReporter, ResultStore, SamplerRegistry, Stats, TaskDescriptor,
};
use serde_json::json;
use tempfile::TempDir;

fn bernoulli_task(p: f64) -> TaskDescriptor {
    TaskDescriptor::new(Artifact::new(json!({ "p": p }), 0, 0))
        .with_decoder("bernoulli")
        .with_metadata(json!({ "p": p }))
}

fn collector(workers: usize, options: CollectionOptions, registry: SamplerRegistry) -> Collector {
    Collector::new(
        CollectorConfig::builder()
            .workers(workers)
            .options(options)
            .registry(registry)
            .shutdown_timeout(Duration::from_secs(10))
            .build(),
    )
    .unwrap()
}

fn bernoulli_collector(options: CollectionOptions) -> Collector {
    collector(
        2,
        options,
        SamplerRegistry::new().with("bernoulli", BernoulliSampler::seeded(2024)),
    )
}

#[tokio::test]
async fn four_tasks_reach_their_error_targets() {
    let rates = [0.01, 0.02, 0.03, 0.04];
    let collector = bernoulli_collector(
        CollectionOptions::builder()
            .max_errors(100)
            .max_shots(1_000_000)
            .build(),
    );
    let mut store = ResultStore::new();
    let summary = collector
        .collect(rates.map(bernoulli_task), &mut store, &NoopReporter)
        .await
        .unwrap();

    assert_eq!(summary.tasks.len(), 4);
    assert!(summary.shutdown.is_clean());
    for p in rates {
        let id = bernoulli_task(p).strong_id().unwrap().to_string();
        let entry = store.get(&id).unwrap();
        assert_eq!(entry.metadata, json!({ "p": p }));
        assert!(entry.stats.errors >= 100);
        assert_eq!(entry.stats.discards, 0);
        let rate = entry.stats.errors as f64 / entry.stats.shots as f64;
        assert!(rate > p * 0.5 && rate < p * 1.6, "p={p} measured {rate}");
    }
}

/// Fails exactly `percent` of every hundred shots, spread evenly.
struct Spaced {
    percent: u64,
    taken: u64,
}

impl CompiledSampler for Spaced {
    fn sample(&mut self, suggested_shots: u64) -> harvest::Result<Stats> {
        let shots = suggested_shots.max(1);
        let before = self.taken * self.percent / 100;
        self.taken += shots;
        let errors = self.taken * self.percent / 100 - before;
        Ok(Stats::new(shots, errors, 0, Duration::from_micros(shots)))
    }
}

fn spaced_task(percent: u64) -> TaskDescriptor {
    TaskDescriptor::new(Artifact::new(json!({ "percent": percent }), 0, 0))
        .with_decoder("spaced")
        .with_metadata(json!({ "percent": percent }))
}

#[tokio::test]
async fn shot_budget_ends_low_error_tasks_exactly() {
    let registry = SamplerRegistry::new().with(
        "spaced",
        |task: &TaskDescriptor| -> harvest::Result<Box<dyn CompiledSampler>> {
            let percent = task.workload().payload["percent"].as_u64().unwrap_or(0);
            Ok(Box::new(Spaced { percent, taken: 0 }))
        },
    );
    let collector = collector(
        2,
        CollectionOptions::builder()
            .max_shots(1_000)
            .max_errors(100)
            .build(),
        registry,
    );
    let mut store = ResultStore::new();
    let summary = collector
        .collect((1..=4).map(spaced_task), &mut store, &NoopReporter)
        .await
        .unwrap();

    assert_eq!(summary.tasks.len(), 4);
    for percent in 1..=4 {
        let id = spaced_task(percent).strong_id().unwrap().to_string();
        let stats = store.stats_for(&id);
        assert_eq!(stats.shots, 1_000, "{percent}%");
        assert_eq!(stats.discards, 0);
        assert!(stats.errors <= 10 * percent, "{percent}%: {} errors", stats.errors);
    }
    let at_one = store.stats_for(spaced_task(1).strong_id().unwrap());
    assert!(at_one.errors <= 10);
    let at_four = store.stats_for(spaced_task(4).strong_id().unwrap());
    assert!((1..=100).contains(&at_four.errors));
}

#[tokio::test]
async fn unknown_decoder_fails_the_run() {
    let collector = bernoulli_collector(CollectionOptions::builder().max_shots(100).build());
    let task = TaskDescriptor::new(Artifact::new(json!({ "p": 0.1 }), 0, 0)).with_decoder("typo");
    let err = collector
        .collect([task], &mut ResultStore::new(), &NoopReporter)
        .await
        .unwrap_err();
    assert!(matches!(err, CollectError::WorkerFailed { .. }));
    let message = err.to_string();
    assert!(message.contains("Worker failed"), "{message}");
    assert!(message.contains("typo"), "{message}");
}

#[tokio::test]
async fn unavailable_backend_surfaces_its_remediation() {
    let registry = SamplerRegistry::new().with(
        "fancy",
        MissingBackend::new("fancy", "enable the `fancy` feature"),
    );
    let collector = collector(1, CollectionOptions::builder().max_shots(10).build(), registry);
    let task = TaskDescriptor::new(Artifact::new(json!(null), 0, 0)).with_decoder("fancy");
    let err = collector
        .collect([task], &mut ResultStore::new(), &NoopReporter)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("enable the `fancy` feature"));
}

#[tokio::test]
async fn resuming_a_finished_run_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stats.csv");
    let options = CollectionOptions::builder().max_shots(5_000).build();
    let tasks = || [0.05, 0.2].map(bernoulli_task);

    let (first, _) = bernoulli_collector(options.clone())
        .collect_to_path(tasks(), &path, &NoopReporter)
        .await
        .unwrap();
    assert_eq!(first.tasks.len(), 2);
    let written = std::fs::read(&path).unwrap();

    let (second, store) = bernoulli_collector(options)
        .collect_to_path(tasks(), &path, &NoopReporter)
        .await
        .unwrap();
    assert!(second.is_noop());
    assert_eq!(second.skipped, 2);
    assert_eq!(second.collected.shots, 0);
    assert_eq!(std::fs::read(&path).unwrap(), written);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn raising_the_limit_appends_to_the_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stats.csv");

    bernoulli_collector(CollectionOptions::builder().max_shots(1_000).build())
        .collect_to_path([bernoulli_task(0.1)], &path, &NoopReporter)
        .await
        .unwrap();
    let (summary, store) =
        bernoulli_collector(CollectionOptions::builder().max_shots(3_000).build())
            .collect_to_path([bernoulli_task(0.1)], &path, &NoopReporter)
            .await
            .unwrap();

    assert_eq!(summary.tasks.len(), 1);
    assert_eq!(summary.tasks[0].shots, 2_000);
    let id = bernoulli_task(0.1).strong_id().unwrap().to_string();
    assert_eq!(store.stats_for(&id).shots, 3_000);

    // header plus one row per run
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 3);
    let reloaded = ResultStore::load_path(&path).unwrap();
    assert_eq!(reloaded.stats_for(&id).shots, 3_000);
    assert_eq!(
        reloaded.stats_for(&id).errors,
        store.stats_for(&id).errors
    );
}

/// Detector `i` fires iff bit `i` of the shot counter is set; the observable
/// flips whenever detector 0 fires.
struct Counter;

struct CompiledCounter {
    next: u64,
    detectors: usize,
}

impl DetectionSource for Counter {
    fn compile(&self, workload: &Artifact) -> harvest::Result<Box<dyn CompiledDetectionSource>> {
        Ok(Box::new(CompiledCounter {
            next: 0,
            detectors: workload.num_detectors,
        }))
    }
}

impl CompiledDetectionSource for CompiledCounter {
    fn sample(&mut self, shots: u64) -> harvest::Result<Detections> {
        let mut detectors = PackedRecords::new(self.detectors);
        let mut observables = PackedRecords::new(1);
        for _ in 0..shots {
            let n = self.next;
            self.next += 1;
            detectors.push_indices((0..self.detectors).filter(|i| n >> i & 1 == 1))?;
            observables.push_indices((n & 1 == 1).then_some(0))?;
        }
        Ok(Detections {
            detectors,
            observables,
        })
    }
}

/// Never predicts a flip.
struct Silent;

struct CompiledSilent;

impl Decoder for Silent {
    fn compile(&self, _: &Artifact) -> harvest::Result<Box<dyn CompiledDecoder>> {
        Ok(Box::new(CompiledSilent))
    }
}

impl CompiledDecoder for CompiledSilent {
    fn decode_batch(&mut self, detectors: &PackedRecords) -> harvest::Result<PackedRecords> {
        let mut out = PackedRecords::new(1);
        for _ in detectors.iter() {
            out.push_indices(None)?;
        }
        Ok(out)
    }
}

#[tokio::test]
async fn decoding_sampler_counts_errors_and_discards() {
    let registry = SamplerRegistry::new().with("silent", DecodingSampler::new(Counter, Silent));
    let collector = collector(1, CollectionOptions::builder().max_shots(4_096).build(), registry);
    let task = TaskDescriptor::new(Artifact::new(json!("counter"), 2, 1))
        .with_decoder("silent")
        .with_discard_mask(DiscardMask::from_indices(2, [1]).unwrap())
        .unwrap();
    let id = task.strong_id().unwrap().to_string();

    let mut store = ResultStore::new();
    collector
        .collect([task], &mut store, &NoopReporter)
        .await
        .unwrap();

    // shots cycle through 00, 01, 10, 11: two of four hit the mask, one of
    // the kept two flips the observable
    let stats = store.stats_for(&id);
    assert_eq!(stats.shots, 4_096);
    assert_eq!(stats.discards, 2_048);
    assert_eq!(stats.errors, 1_024);
}

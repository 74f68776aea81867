use std::time::Duration;

use harvest::{
    Artifact, CollectionOptions, Collector, CollectorConfig, LogReporter, TaskDescriptor,
    builtins::{BernoulliSampler, default_registry},
};
use serde_json::json;

#[tokio::main]
async fn main() -> harvest::Result<()> {
    tracing_subscriber::fmt().init();
    // Run it twice: the second run finds everything in the store and has no work to do
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "harvest-demo.csv".to_string());

    let tasks = [0.001, 0.003, 0.01, 0.03].map(|p| {
        TaskDescriptor::new(Artifact::new(json!({ "p": p }), 0, 0))
            .with_decoder("bernoulli-slow")
            .with_metadata(json!({ "p": p }))
    });

    // Pretend every shot costs a couple of microseconds so the throttle has
    // something to do
    let registry = default_registry().with(
        "bernoulli-slow",
        BernoulliSampler::new().with_delay_per_shot(Duration::from_micros(2)),
    );

    let collector = Collector::new(
        CollectorConfig::builder()
            .options(
                CollectionOptions::builder()
                    .max_errors(200)
                    .max_shots(2_000_000)
                    .build(),
            )
            .registry(registry)
            .build(),
    )?;

    let (summary, store) = collector
        .collect_to_path(tasks, &path, &LogReporter)
        .await?;

    for entry in store.iter() {
        let stats = &entry.stats;
        println!(
            "{:>10} shots {:>6} errors  rate {:.5}  {}",
            stats.shots,
            stats.errors,
            stats.errors as f64 / stats.shots.max(1) as f64,
            entry.metadata
        );
    }
    println!(
        "{} task(s) finished this run, {} already done, {} batches",
        summary.tasks.len(),
        summary.skipped,
        summary.batches
    );
    Ok(())
}

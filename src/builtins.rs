//! Ready-made samplers for demos, benchmarks of the engine itself, and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::error::{CollectError, Result};
use crate::sampler::{CompiledSampler, Sampler, SamplerRegistry};
use crate::stats::Stats;
use crate::task::TaskDescriptor;

/// Every shot independently fails with probability `p`, and is independently
/// discarded beforehand with probability `discard` (default 0).
///
/// Both are read from the workload payload, falling back to the task
/// metadata:
///
/// ```json
/// {"p": 0.01, "discard": 0.05}
/// ```
///
/// A fixed `delay_per_shot` can be added to make the sampler behave like an
/// expensive simulation.
#[derive(Debug, Clone, Default)]
pub struct BernoulliSampler {
    seed: Option<u64>,
    streams: Arc<AtomicU64>,
    delay_per_shot: Duration,
}

impl BernoulliSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic randomness. Every compiled instance gets its own stream
    /// derived from `seed`, so workers do not repeat each other's shots.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    pub fn with_delay_per_shot(mut self, delay: Duration) -> Self {
        self.delay_per_shot = delay;
        self
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => {
                let stream = self.streams.fetch_add(1, Ordering::Relaxed);
                StdRng::seed_from_u64(seed.wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
            }
            None => StdRng::from_os_rng(),
        }
    }
}

fn probability(task: &TaskDescriptor, key: &str) -> Result<Option<f64>> {
    let value = task
        .workload()
        .payload
        .get(key)
        .or_else(|| task.metadata().get(key));
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_f64() {
            Some(p) if (0.0..=1.0).contains(&p) => Ok(Some(p)),
            _ => Err(CollectError::InvalidTask(format!(
                "`{key}` must be a probability between 0 and 1, got {v}"
            ))),
        },
    }
}

impl Sampler for BernoulliSampler {
    fn compile(&self, task: &TaskDescriptor) -> Result<Box<dyn CompiledSampler>> {
        let error_rate = probability(task, "p")?.ok_or_else(|| {
            CollectError::InvalidTask(
                "bernoulli sampler needs a `p` field in the workload or metadata".to_string(),
            )
        })?;
        let discard_rate = probability(task, "discard")?.unwrap_or(0.0);
        Ok(Box::new(CompiledBernoulli {
            rng: self.rng(),
            error_rate,
            discard_rate,
            delay_per_shot: self.delay_per_shot,
        }))
    }
}

struct CompiledBernoulli {
    rng: StdRng,
    error_rate: f64,
    discard_rate: f64,
    delay_per_shot: Duration,
}

impl CompiledSampler for CompiledBernoulli {
    fn sample(&mut self, suggested_shots: u64) -> Result<Stats> {
        let shots = suggested_shots.max(1);
        let start = Instant::now();
        let mut errors = 0;
        let mut discards = 0;
        for _ in 0..shots {
            if self.discard_rate > 0.0 && self.rng.random_bool(self.discard_rate) {
                discards += 1;
            } else if self.rng.random_bool(self.error_rate) {
                errors += 1;
            }
        }
        if !self.delay_per_shot.is_zero() {
            let delay = self
                .delay_per_shot
                .saturating_mul(u32::try_from(shots).unwrap_or(u32::MAX));
            std::thread::sleep(delay);
        }
        Ok(Stats::new(shots, errors, discards, start.elapsed()))
    }
}

/// Stands in for a decoder whose backend is not part of this build.
///
/// Compiling always fails with [`CollectError::Unavailable`], carrying the
/// remediation hint, so a run that needs the backend stops with an
/// actionable message instead of "unknown decoder".
#[derive(Debug, Clone)]
pub struct MissingBackend {
    name: String,
    remediation: String,
}

impl MissingBackend {
    pub fn new(name: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remediation: remediation.into(),
        }
    }
}

impl Sampler for MissingBackend {
    fn compile(&self, _: &TaskDescriptor) -> Result<Box<dyn CompiledSampler>> {
        Err(CollectError::Unavailable {
            name: self.name.clone(),
            remediation: self.remediation.clone(),
        })
    }
}

/// A registry with the built-in samplers under their conventional names.
pub fn default_registry() -> SamplerRegistry {
    SamplerRegistry::new().with("bernoulli", BernoulliSampler::new())
}

//! The pluggable sampling contract and the registry that resolves decoder
//! names to implementations.
//!
//! A [`Sampler`] is a factory: given a [`TaskDescriptor`] it produces a
//! [`CompiledSampler`] that can be called repeatedly for batches of shots.
//! Compilation happens inside the worker that will use the result, so a
//! compiled sampler is never shared between workers and needs only `Send`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{CollectError, Result};
use crate::stats::Stats;
use crate::task::TaskDescriptor;

/// A sampler prepared for one task.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use harvest::{CompiledSampler, Stats, error::Result};
///
/// struct AlwaysRight;
///
/// impl CompiledSampler for AlwaysRight {
///     fn sample(&mut self, suggested_shots: u64) -> Result<Stats> {
///         Ok(Stats::new(suggested_shots.max(1), 0, 0, Duration::ZERO))
///     }
/// }
/// ```
pub trait CompiledSampler: Send {
    /// Run roughly `suggested_shots` repetitions.
    ///
    /// Implementations may pick a different batch size, but must report at
    /// least one shot.
    fn sample(&mut self, suggested_shots: u64) -> Result<Stats>;

    /// Return `true` if the sampler sizes its own batches, which disables the
    /// [`crate::throttle::ThrottledSampler`] wrapper for it.
    fn handles_throttling(&self) -> bool {
        false
    }
}

impl CompiledSampler for Box<dyn CompiledSampler> {
    fn sample(&mut self, suggested_shots: u64) -> Result<Stats> {
        (**self).sample(suggested_shots)
    }

    fn handles_throttling(&self) -> bool {
        (**self).handles_throttling()
    }
}

/// Factory turning task descriptors into compiled samplers.
pub trait Sampler: Send + Sync {
    fn compile(&self, task: &TaskDescriptor) -> Result<Box<dyn CompiledSampler>>;
}

impl<F> Sampler for F
where
    F: Fn(&TaskDescriptor) -> Result<Box<dyn CompiledSampler>> + Send + Sync,
{
    fn compile(&self, task: &TaskDescriptor) -> Result<Box<dyn CompiledSampler>> {
        self(task)
    }
}

/// Maps decoder names to sampler implementations.
///
/// Registering a name twice replaces the earlier entry, which is how callers
/// override a built-in implementation.
#[derive(Clone, Default)]
pub struct SamplerRegistry {
    samplers: HashMap<String, Arc<dyn Sampler>>,
}

impl SamplerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, name: impl Into<String>, sampler: impl Sampler + 'static) -> Self {
        self.register(name, sampler);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, sampler: impl Sampler + 'static) {
        self.samplers.insert(name.into(), Arc::new(sampler));
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Sampler>> {
        self.samplers
            .get(name)
            .cloned()
            .ok_or_else(|| CollectError::UnknownDecoder {
                name: name.to_string(),
                available: self.names(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.samplers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }
}

impl fmt::Debug for SamplerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplerRegistry")
            .field("samplers", &self.names())
            .finish()
    }
}

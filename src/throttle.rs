//! Self-tuning batch size for samplers that do not manage their own.
//!
//! The scheduler asks workers for "as many shots as convenient". A sampler
//! that simply runs whatever it is asked for can take arbitrarily long on a
//! big request, so [`ThrottledSampler`] grows the batch it forwards from a
//! single shot towards a target wall-clock duration, and backs off when a
//! call overshoots.
//!
//! # Behavior
//!
//! With `t` the measured duration of a call and `T` the target:
//!
//! ```text
//! if batch > 1 and t > slowdown_factor * T:   batch /= 2
//! if delivered >= requested / 2:
//!     repeat up to max_doublings times:
//!         stop if 2 * batch > max_batch_shots or t > speedup_factor * T
//!         batch *= 2; t *= 2
//! ```
//!
//! The delivered-shots check keeps the wrapper from inflating the batch of a
//! sampler that quietly returns fewer shots than requested.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{CollectError, Result};
use crate::sampler::CompiledSampler;
use crate::stats::Stats;

/// Tuning knobs for [`ThrottledSampler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Desired wall-clock duration of one call.
    pub target: Duration,
    /// Upper bound on the forwarded batch size.
    pub max_batch_shots: u64,
    /// Halve the batch when a call takes longer than this multiple of `target`.
    pub slowdown_factor: f64,
    /// Keep doubling only while the projected duration stays under this multiple of `target`.
    pub speedup_factor: f64,
    /// Maximum doublings applied after a single call.
    pub max_doublings: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            target: Duration::from_secs(1),
            max_batch_shots: 1024,
            slowdown_factor: 1.3,
            speedup_factor: 0.3,
            max_doublings: 4,
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target.is_zero() {
            return Err(CollectError::InvalidConfig(
                "throttle target must be positive".to_string(),
            ));
        }
        if self.max_batch_shots == 0 {
            return Err(CollectError::InvalidConfig(
                "throttle max_batch_shots must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decorator that sizes the batches forwarded to the wrapped sampler.
pub struct ThrottledSampler<S> {
    inner: S,
    config: ThrottleConfig,
    batch_shots: u64,
}

impl<S: CompiledSampler> ThrottledSampler<S> {
    pub fn new(inner: S, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            batch_shots: 1,
        }
    }

    /// The batch size the next call will forward (before the caller's cap).
    pub fn batch_shots(&self) -> u64 {
        self.batch_shots
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: CompiledSampler> CompiledSampler for ThrottledSampler<S> {
    fn sample(&mut self, max_shots: u64) -> Result<Stats> {
        let requested = max_shots.min(self.batch_shots).max(1);
        let start = Instant::now();
        let stats = self.inner.sample(requested)?;
        let mut elapsed = start.elapsed().as_secs_f64();
        let target = self.config.target.as_secs_f64();

        if self.batch_shots > 1 && elapsed > target * self.config.slowdown_factor {
            self.batch_shots /= 2;
        }

        if stats.shots.saturating_mul(2) >= requested {
            for _ in 0..self.config.max_doublings {
                if self.batch_shots.saturating_mul(2) > self.config.max_batch_shots {
                    break;
                }
                if elapsed > target * self.config.speedup_factor {
                    break;
                }
                self.batch_shots *= 2;
                elapsed *= 2.0;
            }
        }

        tracing::trace!(
            requested,
            delivered = stats.shots,
            next = self.batch_shots,
            "throttled batch"
        );
        Ok(stats)
    }

    fn handles_throttling(&self) -> bool {
        true
    }
}

/// Wrap `sampler` unless it already manages its own batch size.
pub fn throttle(
    sampler: Box<dyn CompiledSampler>,
    config: ThrottleConfig,
) -> Box<dyn CompiledSampler> {
    if sampler.handles_throttling() {
        sampler
    } else {
        Box::new(ThrottledSampler::new(sampler, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every request; sleeps when the request reaches `slow_from`.
    struct Recording {
        requests: Arc<Mutex<Vec<u64>>>,
        slow_from: u64,
        delay: Duration,
        deliver_one: bool,
    }

    impl Recording {
        fn instant(requests: Arc<Mutex<Vec<u64>>>) -> Self {
            Self {
                requests,
                slow_from: u64::MAX,
                delay: Duration::ZERO,
                deliver_one: false,
            }
        }
    }

    impl CompiledSampler for Recording {
        fn sample(&mut self, suggested_shots: u64) -> Result<Stats> {
            self.requests.lock().unwrap().push(suggested_shots);
            if suggested_shots >= self.slow_from {
                std::thread::sleep(self.delay);
            }
            let shots = if self.deliver_one { 1 } else { suggested_shots };
            Ok(Stats::new(shots, 0, 0, Duration::ZERO))
        }
    }

    #[test]
    fn instant_sampler_ramps_up_then_plateaus() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let mut sampler =
            ThrottledSampler::new(Recording::instant(requests.clone()), ThrottleConfig::default());
        for _ in 0..6 {
            sampler.sample(1_000_000).unwrap();
        }
        assert_eq!(*requests.lock().unwrap(), vec![1, 16, 256, 1024, 1024, 1024]);
        assert_eq!(sampler.batch_shots(), 1024);
    }

    #[test]
    fn caller_cap_is_respected() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let mut sampler =
            ThrottledSampler::new(Recording::instant(requests.clone()), ThrottleConfig::default());
        for _ in 0..4 {
            sampler.sample(5).unwrap();
        }
        assert_eq!(*requests.lock().unwrap(), vec![1, 5, 5, 5]);
    }

    #[test]
    fn self_limiting_sampler_is_not_inflated() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let inner = Recording {
            deliver_one: true,
            ..Recording::instant(requests.clone())
        };
        let mut sampler = ThrottledSampler::new(inner, ThrottleConfig::default());
        for _ in 0..3 {
            sampler.sample(1_000).unwrap();
        }
        // the first call delivers everything it was asked for (one shot)
        assert_eq!(*requests.lock().unwrap(), vec![1, 16, 16]);
    }

    #[test]
    fn slow_call_halves_the_batch() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let inner = Recording {
            slow_from: 16,
            delay: Duration::from_millis(80),
            ..Recording::instant(requests.clone())
        };
        let config = ThrottleConfig {
            target: Duration::from_millis(40),
            ..ThrottleConfig::default()
        };
        let mut sampler = ThrottledSampler::new(inner, config);
        for _ in 0..3 {
            sampler.sample(1_000).unwrap();
        }
        assert_eq!(*requests.lock().unwrap(), vec![1, 16, 8]);
    }

    #[test]
    fn self_throttling_samplers_are_not_wrapped() {
        struct OwnPace;
        impl CompiledSampler for OwnPace {
            fn sample(&mut self, _: u64) -> Result<Stats> {
                Ok(Stats::new(7, 0, 0, Duration::ZERO))
            }
            fn handles_throttling(&self) -> bool {
                true
            }
        }
        let requests = Arc::new(Mutex::new(Vec::new()));
        let wrapped = throttle(
            Box::new(Recording::instant(requests.clone())),
            ThrottleConfig::default(),
        );
        assert!(wrapped.handles_throttling());

        let mut own = throttle(Box::new(OwnPace), ThrottleConfig::default());
        assert_eq!(own.sample(1_000).unwrap().shots, 7);
    }

    #[test]
    fn config_validation() {
        assert!(ThrottleConfig::default().validate().is_ok());
        let bad = ThrottleConfig {
            max_batch_shots: 0,
            ..ThrottleConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}

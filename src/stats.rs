use std::collections::BTreeMap;
use std::iter::Sum;
use std::ops::Add;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CollectError, Result};

/// `Stats` is the unit of measurement merged at every level of a collection:
/// a worker returns one per batch, a tracker folds them into a running total,
/// and the store keeps one per task.
///
/// # Role
///
/// - Count the repetitions (`shots`) a sampler ran, how many of them were
///   mispredicted (`errors`) and how many were excluded from scoring
///   (`discards`).
/// - Record the wall-clock time spent sampling.
/// - Carry arbitrary named counters a sampler wants to report alongside.
///
/// # Merging
///
/// `Stats` forms a commutative monoid under field-wise addition with
/// [`Stats::default`] as identity. Elapsed time is kept as a [`Duration`]
/// (integer nanoseconds) so that merging is exactly associative regardless
/// of the order in which batches come back from the workers.
///
/// Values are never updated in place by the engine: `a + b` produces a new
/// value and both inputs stay untouched. `+` saturates at `u64::MAX`; use
/// [`Stats::checked_add`] where overflow has to be reported.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use harvest::Stats;
///
/// let a = Stats::new(100, 3, 1, Duration::from_millis(20));
/// let b = Stats::new(50, 1, 0, Duration::from_millis(10)).with_custom_count("weight", 7);
/// let total = a + b;
///
/// assert_eq!(total.shots, 150);
/// assert_eq!(total.errors, 4);
/// assert_eq!(total.custom_counts["weight"], 7);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub shots: u64,
    pub errors: u64,
    pub discards: u64,
    pub elapsed: Duration,
    /// Zero-valued counters are never stored, so equal totals compare equal.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_counts: BTreeMap<String, u64>,
}

impl Stats {
    pub fn new(shots: u64, errors: u64, discards: u64, elapsed: Duration) -> Self {
        Self {
            shots,
            errors,
            discards,
            elapsed,
            custom_counts: BTreeMap::new(),
        }
    }

    /// Add `count` to the named custom counter.
    pub fn with_custom_count(mut self, key: impl Into<String>, count: u64) -> Self {
        if count > 0 {
            *self.custom_counts.entry(key.into()).or_insert(0) += count;
        }
        self
    }

    /// Elapsed sampling time in seconds.
    pub fn seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    pub fn is_empty(&self) -> bool {
        *self == Stats::default()
    }

    /// Field-wise sum, or `None` if any counter or the elapsed time overflows.
    pub fn checked_add(&self, other: &Stats) -> Option<Stats> {
        let mut custom_counts = self.custom_counts.clone();
        for (key, count) in &other.custom_counts {
            let slot = custom_counts.entry(key.clone()).or_insert(0);
            *slot = slot.checked_add(*count)?;
        }
        custom_counts.retain(|_, v| *v > 0);
        Some(Stats {
            shots: self.shots.checked_add(other.shots)?,
            errors: self.errors.checked_add(other.errors)?,
            discards: self.discards.checked_add(other.discards)?,
            elapsed: self.elapsed.checked_add(other.elapsed)?,
            custom_counts,
        })
    }

    /// Check `shots >= errors + discards`.
    pub fn validate(&self) -> Result<()> {
        let scored = self.errors.checked_add(self.discards);
        match scored {
            Some(n) if n <= self.shots => Ok(()),
            _ => Err(CollectError::Sampling(format!(
                "stats report {} errors and {} discards out of only {} shots",
                self.errors, self.discards, self.shots
            ))),
        }
    }
}

impl Add for Stats {
    type Output = Stats;

    fn add(self, other: Stats) -> Stats {
        &self + &other
    }
}

impl Add<&Stats> for &Stats {
    type Output = Stats;

    fn add(self, other: &Stats) -> Stats {
        let mut custom_counts = self.custom_counts.clone();
        for (key, count) in &other.custom_counts {
            let slot = custom_counts.entry(key.clone()).or_insert(0);
            *slot = slot.saturating_add(*count);
        }
        custom_counts.retain(|_, v| *v > 0);
        Stats {
            shots: self.shots.saturating_add(other.shots),
            errors: self.errors.saturating_add(other.errors),
            discards: self.discards.saturating_add(other.discards),
            elapsed: self.elapsed.saturating_add(other.elapsed),
            custom_counts,
        }
    }
}

impl Sum for Stats {
    fn sum<I: Iterator<Item = Stats>>(iter: I) -> Stats {
        iter.fold(Stats::default(), |acc, s| acc + s)
    }
}

impl<'a> Sum<&'a Stats> for Stats {
    fn sum<I: Iterator<Item = &'a Stats>>(iter: I) -> Stats {
        iter.fold(Stats::default(), |acc, s| &acc + s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_stats() -> impl Strategy<Value = Stats> {
        (
            0u64..1_000_000,
            0u64..1_000,
            0u64..1_000,
            0u64..10_000_000_000,
            proptest::collection::btree_map("[a-c]", 0u64..100, 0..3),
        )
            .prop_map(|(shots, errors, discards, nanos, counts)| {
                let mut stats = Stats::new(
                    shots + errors + discards,
                    errors,
                    discards,
                    Duration::from_nanos(nanos),
                );
                for (k, v) in counts {
                    stats = stats.with_custom_count(k, v);
                }
                stats
            })
    }

    proptest! {
        #[test]
        fn addition_is_commutative(a in arb_stats(), b in arb_stats()) {
            prop_assert_eq!(&a + &b, &b + &a);
        }

        #[test]
        fn addition_is_associative(a in arb_stats(), b in arb_stats(), c in arb_stats()) {
            prop_assert_eq!((&a + &b) + c.clone(), a + (b + c));
        }

        #[test]
        fn zero_is_identity(a in arb_stats()) {
            prop_assert_eq!(&a + &Stats::default(), a);
        }
    }

    #[test]
    fn custom_counts_merge_by_key() {
        let a = Stats::default().with_custom_count("x", 2).with_custom_count("y", 1);
        let b = Stats::default().with_custom_count("x", 3);
        let total = a + b;
        assert_eq!(total.custom_counts.get("x"), Some(&5));
        assert_eq!(total.custom_counts.get("y"), Some(&1));
    }

    #[test]
    fn zero_custom_counts_are_not_stored() {
        let s = Stats::default().with_custom_count("x", 0);
        assert!(s.custom_counts.is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn sum_folds_from_zero() {
        let parts = vec![
            Stats::new(10, 1, 0, Duration::from_secs(1)),
            Stats::new(20, 0, 2, Duration::from_secs(2)),
        ];
        let total: Stats = parts.iter().sum();
        assert_eq!(total, Stats::new(30, 1, 2, Duration::from_secs(3)));
        let empty: Stats = Vec::<Stats>::new().into_iter().sum();
        assert!(empty.is_empty());
    }

    #[test]
    fn overflow_saturates_or_is_reported() {
        let huge = Stats::new(u64::MAX, 1, 0, Duration::ZERO).with_custom_count("w", u64::MAX);
        let one = Stats::new(1, 1, 0, Duration::ZERO).with_custom_count("w", 1);
        assert_eq!(huge.checked_add(&one), None);
        let sum = &huge + &one;
        assert_eq!((sum.shots, sum.errors), (u64::MAX, 2));
        assert_eq!(sum.custom_counts["w"], u64::MAX);
        assert_eq!(one.checked_add(&one), Some(&one + &one));
    }

    #[test]
    fn validate_rejects_overcounted_shots() {
        assert!(Stats::new(5, 3, 2, Duration::ZERO).validate().is_ok());
        assert!(Stats::new(5, 3, 3, Duration::ZERO).validate().is_err());
    }
}

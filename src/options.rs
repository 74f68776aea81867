use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{CollectError, Result};

/// Stopping and batching limits for a task.
///
/// Every field is optional; `None` means "no limit". Options coming from
/// different places (a global default and a task's own settings) are folded
/// together with [`CollectionOptions::combine`].
///
/// ```rust
/// use harvest::CollectionOptions;
///
/// let global = CollectionOptions::builder().max_shots(1_000_000).max_errors(100).build();
/// let task = CollectionOptions::builder().max_shots(5_000).build();
/// let effective = task.combine(&global);
///
/// assert_eq!(effective.max_shots, Some(5_000));
/// assert_eq!(effective.max_errors, Some(100));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct CollectionOptions {
    /// Stop once this many shots have been taken.
    #[builder(default, setter(strip_option))]
    pub max_shots: Option<u64>,
    /// Stop once this many errors have been seen.
    #[builder(default, setter(strip_option))]
    pub max_errors: Option<u64>,
    /// Size of the very first batch of a task.
    #[builder(default, setter(strip_option))]
    pub start_batch_size: Option<u64>,
    /// Upper bound on the shots in any single batch.
    #[builder(default, setter(strip_option))]
    pub max_batch_size: Option<u64>,
    /// Target upper bound on the wall-clock duration of a single batch.
    #[builder(default, setter(strip_option))]
    pub max_batch_seconds: Option<f64>,
}

impl CollectionOptions {
    /// Field-wise minimum, treating `None` as +infinity.
    ///
    /// Commutative and associative, with `CollectionOptions::default()` as
    /// identity.
    pub fn combine(&self, other: &CollectionOptions) -> CollectionOptions {
        CollectionOptions {
            max_shots: min_opt(self.max_shots, other.max_shots),
            max_errors: min_opt(self.max_errors, other.max_errors),
            start_batch_size: min_opt(self.start_batch_size, other.start_batch_size),
            max_batch_size: min_opt(self.max_batch_size, other.max_batch_size),
            max_batch_seconds: match (self.max_batch_seconds, other.max_batch_seconds) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        }
    }

    /// Reject limits that can never be satisfied.
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("max_shots", self.max_shots),
            ("max_errors", self.max_errors),
            ("start_batch_size", self.start_batch_size),
            ("max_batch_size", self.max_batch_size),
        ];
        for (field, value) in counts {
            if value == Some(0) {
                return Err(CollectError::InvalidOptions {
                    field,
                    reason: "must be at least 1 when set".to_string(),
                });
            }
        }
        match self.max_batch_seconds {
            Some(seconds) if !(seconds.is_finite() && seconds > 0.0) => {
                Err(CollectError::InvalidOptions {
                    field: "max_batch_seconds",
                    reason: format!("must be a positive number of seconds, got {seconds}"),
                })
            }
            _ => Ok(()),
        }
    }

    /// Whether `shots`/`errors` already satisfy a stopping criterion.
    pub fn limits_reached(&self, shots: u64, errors: u64) -> bool {
        self.max_shots.is_some_and(|max| shots >= max)
            || self.max_errors.is_some_and(|max| errors >= max)
    }
}

fn min_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_options() -> impl Strategy<Value = CollectionOptions> {
        (
            proptest::option::of(1u64..10_000),
            proptest::option::of(1u64..10_000),
            proptest::option::of(1u64..10_000),
            proptest::option::of(1u64..10_000),
            proptest::option::of(1u32..600),
        )
            .prop_map(|(a, b, c, d, e)| CollectionOptions {
                max_shots: a,
                max_errors: b,
                start_batch_size: c,
                max_batch_size: d,
                max_batch_seconds: e.map(f64::from),
            })
    }

    proptest! {
        #[test]
        fn combine_is_commutative(a in arb_options(), b in arb_options()) {
            prop_assert_eq!(a.combine(&b), b.combine(&a));
        }

        #[test]
        fn combine_is_associative(a in arb_options(), b in arb_options(), c in arb_options()) {
            prop_assert_eq!(a.combine(&b).combine(&c), a.combine(&b.combine(&c)));
        }

        #[test]
        fn empty_is_identity(a in arb_options()) {
            prop_assert_eq!(a.combine(&CollectionOptions::default()), a.clone());
        }
    }

    #[test]
    fn combine_takes_minimum_of_present_values() {
        let a = CollectionOptions::builder()
            .max_shots(10)
            .max_batch_seconds(3.0)
            .build();
        let b = CollectionOptions::builder()
            .max_shots(7)
            .max_errors(5)
            .max_batch_seconds(9.0)
            .build();
        let c = a.combine(&b);
        assert_eq!(c.max_shots, Some(7));
        assert_eq!(c.max_errors, Some(5));
        assert_eq!(c.max_batch_seconds, Some(3.0));
        assert_eq!(c.max_batch_size, None);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = CollectionOptions::builder()
            .max_errors(0)
            .build()
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_errors"));

        for seconds in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let opts = CollectionOptions::builder().max_batch_seconds(seconds).build();
            assert!(opts.validate().is_err(), "{seconds} accepted");
        }
        assert!(CollectionOptions::default().validate().is_ok());
    }

    #[test]
    fn deserializes_with_missing_fields() {
        let opts: CollectionOptions = serde_json::from_str(r#"{"max_shots": 1000}"#).unwrap();
        assert_eq!(opts.max_shots, Some(1000));
        assert_eq!(opts.max_errors, None);
    }

    #[test]
    fn limits_reached_checks_either_criterion() {
        let opts = CollectionOptions::builder().max_shots(100).max_errors(10).build();
        assert!(!opts.limits_reached(99, 9));
        assert!(opts.limits_reached(100, 0));
        assert!(opts.limits_reached(5, 10));
        assert!(!CollectionOptions::default().limits_reached(u64::MAX, u64::MAX));
    }
}

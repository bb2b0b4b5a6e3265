//! Absolute and relative cycle arithmetic.
//!
//! Absolute cycles run 1..=999 and wrap. Ordering is by age on the
//! 999-circle: a cycle up to 499 steps ahead of another is newer than it.
//! [`AbsoluteCycle`] deliberately does not implement `Ord`.

use mfd_error::{MfdError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Highest absolute cycle number.
pub const MAX_ABSOLUTE_CYCLE: u32 = 999;

/// Largest distance at which one cycle still counts as newer than another.
const NEWER_HORIZON: u32 = 499;

/// Oldest relative cycle a request may name.
pub const MIN_RELATIVE_CYCLE: i32 = -31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbsoluteCycle(u32);

impl AbsoluteCycle {
    pub const FIRST: Self = Self(1);

    pub fn new(value: u32) -> Result<Self> {
        if !(1..=MAX_ABSOLUTE_CYCLE).contains(&value) {
            return Err(MfdError::InvalidRequest(format!(
                "absolute cycle {value} outside 1..=999"
            )));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// The next cycle; 999 wraps to 1.
    #[must_use]
    pub fn increment(self) -> Self {
        self.newer_by(1)
    }

    /// The previous cycle; 1 wraps to 999.
    #[must_use]
    pub fn decrement(self) -> Self {
        self.older_by(1)
    }

    #[must_use]
    pub fn newer_by(self, steps: u32) -> Self {
        Self((self.0 - 1 + steps % MAX_ABSOLUTE_CYCLE) % MAX_ABSOLUTE_CYCLE + 1)
    }

    #[must_use]
    pub fn older_by(self, steps: u32) -> Self {
        self.newer_by(MAX_ABSOLUTE_CYCLE - steps % MAX_ABSOLUTE_CYCLE)
    }

    /// Steps forward from `other` to `self` around the circle (0..999).
    #[must_use]
    pub fn steps_after(self, other: Self) -> u32 {
        (self.0 + MAX_ABSOLUTE_CYCLE - other.0) % MAX_ABSOLUTE_CYCLE
    }

    /// Whether `self` is newer than `other`.
    #[must_use]
    pub fn is_newer_than(self, other: Self) -> bool {
        compare_absolute_cycles(self, other) == Ordering::Less
    }
}

impl fmt::Display for AbsoluteCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order two absolute cycles by age.
///
/// `Greater` means `a` is older than `b`: `b` lies 1..=499 steps ahead of
/// `a`. Hence `compare(999, 1)` is `Greater` and `compare(500, 1)` is
/// `Less`.
#[must_use]
pub fn compare_absolute_cycles(a: AbsoluteCycle, b: AbsoluteCycle) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    if (1..=NEWER_HORIZON).contains(&b.steps_after(a)) {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// How a request names a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CycleSpec {
    /// No cycle given.
    #[default]
    None,
    Absolute(u32),
    /// 0 is the current cycle, negative values count older existing
    /// cycles, +1 is the next cycle to be created.
    Relative(i32),
}

impl CycleSpec {
    pub fn validate(self) -> Result<Self> {
        match self {
            Self::None => Ok(self),
            Self::Absolute(value) => AbsoluteCycle::new(value).map(|_| self),
            Self::Relative(value) if (MIN_RELATIVE_CYCLE..=1).contains(&value) => Ok(self),
            Self::Relative(value) => Err(MfdError::InvalidRequest(format!(
                "relative cycle {value:+} outside -31..=+1"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn c(value: u32) -> AbsoluteCycle {
        AbsoluteCycle::new(value).unwrap()
    }

    #[test]
    fn wraps_at_the_ends() {
        assert_eq!(c(999).increment(), c(1));
        assert_eq!(c(1).decrement(), c(999));
        assert_eq!(c(5).older_by(10), c(994));
        assert_eq!(c(995).newer_by(10), c(6));
    }

    #[test]
    fn comparison_follows_the_circle() {
        assert_eq!(compare_absolute_cycles(c(999), c(1)), Ordering::Greater);
        assert_eq!(compare_absolute_cycles(c(1), c(999)), Ordering::Less);
        assert_eq!(compare_absolute_cycles(c(500), c(1)), Ordering::Less);
        assert_eq!(compare_absolute_cycles(c(1), c(500)), Ordering::Greater);
        assert_eq!(compare_absolute_cycles(c(7), c(7)), Ordering::Equal);
        assert!(c(2).is_newer_than(c(1)));
        assert!(c(1).is_newer_than(c(999)));
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(AbsoluteCycle::new(0).is_err());
        assert!(AbsoluteCycle::new(1000).is_err());
        assert!(CycleSpec::Absolute(0).validate().is_err());
        assert!(CycleSpec::Relative(2).validate().is_err());
        assert!(CycleSpec::Relative(-32).validate().is_err());
        assert!(CycleSpec::Relative(-31).validate().is_ok());
        assert!(CycleSpec::None.validate().is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn increment_stays_in_range_and_inverts(value in 1_u32..=999) {
            let cycle = c(value);
            let next = cycle.increment();
            prop_assert!((1..=999).contains(&next.get()));
            prop_assert_eq!(next.decrement(), cycle);
        }

        #[test]
        fn comparison_is_antisymmetric(a in 1_u32..=999, b in 1_u32..=999) {
            let forward = compare_absolute_cycles(c(a), c(b));
            let backward = compare_absolute_cycles(c(b), c(a));
            if a == b {
                prop_assert_eq!(forward, Ordering::Equal);
            } else {
                prop_assert_eq!(forward, backward.reverse());
            }
        }

        #[test]
        fn newer_by_small_steps_is_newer(value in 1_u32..=999, steps in 1_u32..=499) {
            let cycle = c(value);
            prop_assert_eq!(
                compare_absolute_cycles(cycle, cycle.newer_by(steps)),
                Ordering::Greater
            );
        }
    }
}

//! Disclosure control
//!
//! Pure post-processing of raw counts before they leave the system. The
//! threshold is checked against the raw count first: any count below it,
//! zero included, is suppressed. Surviving counts are rounded to the nearest
//! multiple of `rounding`, halves rounding up, and the rounded value must
//! still reach the threshold. A nonzero count that would round to zero is
//! suppressed as well. Zero is published only when the threshold is 0.

use crate::domain::outcome::{AvailabilityResult, Cell, DistributionResult};
use std::collections::BTreeMap;

/// Minimum-cell-size policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisclosurePolicy {
    /// Counts below this value, before or after rounding, are suppressed (0 disables)
    pub threshold: u64,
    /// Counts are rounded to the nearest multiple of this value (0 disables)
    pub rounding: u64,
}

impl DisclosurePolicy {
    /// Creates a policy
    pub fn new(threshold: u64, rounding: u64) -> Self {
        Self {
            threshold,
            rounding,
        }
    }

    /// A policy that publishes raw counts unchanged
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Safeguards a single raw count
    pub fn apply(&self, raw: u64) -> Cell {
        if raw < self.threshold {
            return Cell::Suppressed;
        }
        match self.round(raw) {
            0 if raw > 0 => Cell::Suppressed,
            rounded if rounded < self.threshold => Cell::Suppressed,
            rounded => Cell::Count(rounded),
        }
    }

    fn round(&self, raw: u64) -> u64 {
        if self.rounding == 0 {
            return raw;
        }
        let step = self.rounding;
        let lower = raw / step * step;
        if raw - lower >= step - step / 2 {
            lower.saturating_add(step)
        } else {
            lower
        }
    }

    /// Safeguards an availability count
    pub fn availability(&self, raw: u64) -> AvailabilityResult {
        AvailabilityResult(self.apply(raw))
    }

    /// Safeguards every bucket of a distribution independently
    ///
    /// Buckets sharing a label are merged before the policy is applied, and
    /// every bucket is kept in the output, suppressed or not.
    pub fn distribution<I>(&self, dimension: impl Into<String>, buckets: I) -> DistributionResult
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let mut raw: BTreeMap<String, u64> = BTreeMap::new();
        for (label, count) in buckets {
            let entry = raw.entry(label).or_insert(0);
            *entry = entry.saturating_add(count);
        }

        DistributionResult {
            dimension: dimension.into(),
            buckets: raw
                .into_iter()
                .map(|(label, count)| (label, self.apply(count)))
                .collect(),
        }
    }
}

//! Entity-set and counter reconciliation.
//!
//! Backends are polled from scratch every cycle, so the exported series must
//! be diffed against the previous cycle: series whose backing entity is gone
//! have to be retracted explicitly, and absolute backend counters have to be
//! converted into non-negative deltas for the exported counters.

use std::collections::{HashMap, HashSet};

use crate::metrics::LabelTuple;

/// Remembers which label tuples existed on the previous successful poll of
/// one metric family and computes the removal set against the current poll.
///
/// Must only be fed after a successful fetch; on a failed fetch the caller
/// skips reconciliation entirely so the previous series stay exported.
#[derive(Debug, Default)]
pub struct SeriesSet {
    previous: HashSet<LabelTuple>,
}

impl SeriesSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the remembered set with `current` and returns the tuples
    /// that vanished since the previous poll.
    pub fn reconcile(&mut self, current: HashSet<LabelTuple>) -> Vec<LabelTuple> {
        let removed = self
            .previous
            .iter()
            .filter(|tuple| !current.contains(*tuple))
            .cloned()
            .collect();
        self.previous = current;
        removed
    }

    /// Tuples remembered from the previous poll.
    pub fn tuples(&self) -> &HashSet<LabelTuple> {
        &self.previous
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

/// Converts absolute backend counter values into deltas for an exported
/// counter, remembering the last absolute value per series.
#[derive(Debug, Default)]
pub struct CounterTracker {
    baselines: HashMap<LabelTuple, f64>,
}

impl CounterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `absolute` as the new baseline and returns the delta to apply
    /// to the exported counter, never negative.
    ///
    /// First observation establishes the series with delta 0. A drop in the
    /// absolute value means the backend counter was reset; the increments
    /// lost inside the reset window are an accepted approximation, so the
    /// delta is 0 and subsequent deltas are computed from the new baseline.
    pub fn observe(&mut self, tuple: &LabelTuple, absolute: f64) -> f64 {
        let delta = match self.baselines.get(tuple) {
            Some(baseline) if absolute >= *baseline => absolute - baseline,
            Some(_) => 0.0,
            None => 0.0,
        };
        self.baselines.insert(tuple.clone(), absolute);
        delta
    }

    /// Drops the baseline of a removed series. Without this, an entity
    /// recreated under the same identity with a fresh counter would look
    /// like a reset.
    pub fn forget(&mut self, tuple: &LabelTuple) {
        self.baselines.remove(tuple);
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }
}

/// Builds a label tuple from string slices.
pub fn tuple(values: &[&str]) -> LabelTuple {
    values.iter().map(|s| s.to_string()).collect()
}

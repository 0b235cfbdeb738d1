//! In-memory metric sink for testing.
//!
//! `MockSink` records exactly which series exist per instrument and what
//! their last published values were, so tests can assert the reconciliation
//! invariant: after a successful collect, the exported series equal the
//! entities of the most recent successful fetch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::{LabelTuple, MetricSink};

/// Last published value of one series.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValue {
    Gauge(f64),
    Counter(f64),
    State(String),
    Info(Vec<(String, String)>),
}

#[derive(Debug, Default)]
struct MockInstrument {
    states: Vec<String>,
    series: HashMap<LabelTuple, SeriesValue>,
}

#[derive(Debug, Default)]
struct Inner {
    instruments: HashMap<String, MockInstrument>,
}

/// Cloneable handle to a recording sink. Tests keep one clone and hand the
/// other to the collector.
#[derive(Debug, Default, Clone)]
pub struct MockSink {
    inner: Arc<Mutex<Inner>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set of label tuples currently exported for an instrument.
    pub fn series_labels(&self, name: &str) -> HashSet<LabelTuple> {
        let inner = self.inner.lock().unwrap();
        inner
            .instruments
            .get(name)
            .map(|i| i.series.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of series currently exported for an instrument.
    pub fn series_count(&self, name: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.instruments.get(name).map(|i| i.series.len()).unwrap_or(0)
    }

    pub fn has_series(&self, name: &str, labels: &[&str]) -> bool {
        self.value(name, labels).is_some()
    }

    pub fn value(&self, name: &str, labels: &[&str]) -> Option<SeriesValue> {
        let key: LabelTuple = labels.iter().map(|s| s.to_string()).collect();
        let inner = self.inner.lock().unwrap();
        inner.instruments.get(name).and_then(|i| i.series.get(&key)).cloned()
    }

    pub fn gauge_value(&self, name: &str, labels: &[&str]) -> Option<f64> {
        match self.value(name, labels) {
            Some(SeriesValue::Gauge(v)) => Some(v),
            _ => None,
        }
    }

    pub fn counter_value(&self, name: &str, labels: &[&str]) -> Option<f64> {
        match self.value(name, labels) {
            Some(SeriesValue::Counter(v)) => Some(v),
            _ => None,
        }
    }

    pub fn state(&self, name: &str, labels: &[&str]) -> Option<String> {
        match self.value(name, labels) {
            Some(SeriesValue::State(s)) => Some(s),
            _ => None,
        }
    }

    pub fn is_defined(&self, name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.instruments.contains_key(name)
    }

    fn define(&mut self, name: &str, states: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        inner.instruments.insert(
            name.to_string(),
            MockInstrument {
                states: states.iter().map(|s| s.to_string()).collect(),
                series: HashMap::new(),
            },
        );
    }

    fn store(&mut self, name: &str, labels: &[&str], value: SeriesValue) {
        let key: LabelTuple = labels.iter().map(|s| s.to_string()).collect();
        let mut inner = self.inner.lock().unwrap();
        if let Some(instrument) = inner.instruments.get_mut(name) {
            instrument.series.insert(key, value);
        }
    }
}

impl MetricSink for MockSink {
    fn define_gauge(&mut self, name: &str, _help: &str, _labels: &[&str]) {
        self.define(name, &[]);
    }

    fn define_counter(&mut self, name: &str, _help: &str, _labels: &[&str]) {
        self.define(name, &[]);
    }

    fn define_enum(&mut self, name: &str, _help: &str, _labels: &[&str], states: &[&str]) {
        self.define(name, states);
    }

    fn define_info(&mut self, name: &str, _help: &str, _labels: &[&str], _value_labels: &[&str]) {
        self.define(name, &[]);
    }

    fn set(&mut self, name: &str, labels: &[&str], value: f64) {
        self.store(name, labels, SeriesValue::Gauge(value));
    }

    fn inc(&mut self, name: &str, labels: &[&str], delta: f64) {
        let key: LabelTuple = labels.iter().map(|s| s.to_string()).collect();
        let mut inner = self.inner.lock().unwrap();
        if let Some(instrument) = inner.instruments.get_mut(name) {
            let entry = instrument
                .series
                .entry(key)
                .or_insert(SeriesValue::Counter(0.0));
            if let SeriesValue::Counter(total) = entry {
                *total += delta;
            }
        }
    }

    fn set_state(&mut self, name: &str, labels: &[&str], state: &str) {
        let allowed = {
            let inner = self.inner.lock().unwrap();
            inner
                .instruments
                .get(name)
                .map(|i| i.states.iter().any(|s| s == state))
                .unwrap_or(false)
        };
        if allowed {
            self.store(name, labels, SeriesValue::State(state.to_string()));
        }
    }

    fn set_info(&mut self, name: &str, labels: &[&str], values: &[(&str, String)]) {
        let record = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.store(name, labels, SeriesValue::Info(record));
    }

    fn remove_series(&mut self, name: &str, labels: &[&str]) {
        let key: LabelTuple = labels.iter().map(|s| s.to_string()).collect();
        let mut inner = self.inner.lock().unwrap();
        if let Some(instrument) = inner.instruments.get_mut(name) {
            instrument.series.remove(&key);
        }
    }
}

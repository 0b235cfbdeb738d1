//! Metric sink abstraction.
//!
//! The `MetricSink` trait is the seam between the collectors and the metrics
//! library. Instruments are addressed by name; series within an instrument
//! are addressed by an ordered tuple of string label values. The trait allows
//! collectors to work with both the real Prometheus registry and a mock
//! implementation for testing.

mod mock;
mod prom;

pub use mock::{MockSink, SeriesValue};
pub use prom::PromSink;

/// Ordered label values identifying one series of one instrument.
pub type LabelTuple = Vec<String>;

/// Borrows a label tuple as the slice-of-str shape the sink methods take.
pub fn label_refs(tuple: &[String]) -> Vec<&str> {
    tuple.iter().map(String::as_str).collect()
}

/// Handle to a set of metric instruments keyed by name.
///
/// Four instrument kinds are supported:
/// - gauge: a settable float per series
/// - counter: a monotonically increasing float per series
/// - enum: exactly one of a declared state set is active per series
/// - info: a record of string values attached to an identity
///
/// All `define_*` calls happen during collector construction, before any
/// data is published. Publishing against an undefined instrument, or with a
/// label count that does not match the declared schema, is a programming
/// defect; implementations log and drop such calls rather than panic.
pub trait MetricSink: Send {
    /// Registers a gauge instrument.
    fn define_gauge(&mut self, name: &str, help: &str, labels: &[&str]);

    /// Registers a counter instrument.
    fn define_counter(&mut self, name: &str, help: &str, labels: &[&str]);

    /// Registers an enumerated-state instrument with its allowed states.
    fn define_enum(&mut self, name: &str, help: &str, labels: &[&str], states: &[&str]);

    /// Registers an info instrument. `value_labels` declares the record
    /// fields; they are fixed at definition time.
    fn define_info(&mut self, name: &str, help: &str, labels: &[&str], value_labels: &[&str]);

    /// Sets a gauge series to `value`.
    fn set(&mut self, name: &str, labels: &[&str], value: f64);

    /// Increments a counter series by `delta` (must be non-negative).
    fn inc(&mut self, name: &str, labels: &[&str], delta: f64);

    /// Activates `state` on an enum series. States outside the declared set
    /// are dropped.
    fn set_state(&mut self, name: &str, labels: &[&str], state: &str);

    /// Publishes an info record, replacing any previous record for the same
    /// identity labels. Declared fields missing from `values` become empty.
    fn set_info(&mut self, name: &str, labels: &[&str], values: &[(&str, String)]);

    /// Retracts one series. Removing a series that does not exist is a no-op.
    fn remove_series(&mut self, name: &str, labels: &[&str]);
}

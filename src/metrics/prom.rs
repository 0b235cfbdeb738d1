//! Prometheus-backed metric sink.
//!
//! Gauges and counters map directly onto `prometheus::GaugeVec` and
//! `prometheus::CounterVec`. The two instrument kinds the `prometheus` crate
//! does not provide are rendered the way `prometheus_client` exposes them:
//!
//! - enum: a one-hot gauge with an extra label named after the metric itself,
//!   carrying exactly one `1` across the declared state set;
//! - info: a constant-`1` gauge named `<name>_info` whose value fields are
//!   extra labels, replaced as a whole when the record changes.

use std::collections::HashMap;

use prometheus::{CounterVec, GaugeVec, Opts, Registry};
use tracing::{debug, warn};

use super::MetricSink;

enum Instrument {
    Gauge(GaugeVec),
    Counter(CounterVec),
    Enum {
        gauge: GaugeVec,
        states: Vec<String>,
    },
    Info {
        gauge: GaugeVec,
        value_labels: Vec<String>,
        /// Last full label tuple published per identity tuple, needed to
        /// retract the previous record when values change.
        last: HashMap<Vec<String>, Vec<String>>,
    },
}

/// Metric sink backed by a `prometheus::Registry`.
pub struct PromSink {
    registry: Registry,
    instruments: HashMap<String, Instrument>,
}

impl PromSink {
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Creates a sink publishing into an existing registry.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            instruments: HashMap::new(),
        }
    }

    /// The registry this sink publishes into, for the exposition endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn new_gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> Option<GaugeVec> {
        // The prometheus crate rejects empty help strings.
        let help = if help.is_empty() { name } else { help };
        let vec = match GaugeVec::new(Opts::new(name, help), labels) {
            Ok(v) => v,
            Err(e) => {
                warn!(metric = name, error = %e, "invalid gauge definition");
                return None;
            }
        };
        if let Err(e) = self.registry.register(Box::new(vec.clone())) {
            warn!(metric = name, error = %e, "failed to register gauge");
            return None;
        }
        Some(vec)
    }
}

impl Default for PromSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSink for PromSink {
    fn define_gauge(&mut self, name: &str, help: &str, labels: &[&str]) {
        if let Some(vec) = self.new_gauge_vec(name, help, labels) {
            self.instruments.insert(name.to_string(), Instrument::Gauge(vec));
        }
    }

    fn define_counter(&mut self, name: &str, help: &str, labels: &[&str]) {
        let help = if help.is_empty() { name } else { help };
        let vec = match CounterVec::new(Opts::new(name, help), labels) {
            Ok(v) => v,
            Err(e) => {
                warn!(metric = name, error = %e, "invalid counter definition");
                return;
            }
        };
        if let Err(e) = self.registry.register(Box::new(vec.clone())) {
            warn!(metric = name, error = %e, "failed to register counter");
            return;
        }
        self.instruments.insert(name.to_string(), Instrument::Counter(vec));
    }

    fn define_enum(&mut self, name: &str, help: &str, labels: &[&str], states: &[&str]) {
        // The active state is carried by an extra label named after the
        // metric, matching the prometheus_client Enum exposition format.
        let mut full: Vec<&str> = labels.to_vec();
        full.push(name);
        if let Some(gauge) = self.new_gauge_vec(name, help, &full) {
            self.instruments.insert(
                name.to_string(),
                Instrument::Enum {
                    gauge,
                    states: states.iter().map(|s| s.to_string()).collect(),
                },
            );
        }
    }

    fn define_info(&mut self, name: &str, help: &str, labels: &[&str], value_labels: &[&str]) {
        let exposed = format!("{name}_info");
        let mut full: Vec<&str> = labels.to_vec();
        full.extend_from_slice(value_labels);
        if let Some(gauge) = self.new_gauge_vec(&exposed, help, &full) {
            self.instruments.insert(
                name.to_string(),
                Instrument::Info {
                    gauge,
                    value_labels: value_labels.iter().map(|s| s.to_string()).collect(),
                    last: HashMap::new(),
                },
            );
        }
    }

    fn set(&mut self, name: &str, labels: &[&str], value: f64) {
        match self.instruments.get(name) {
            Some(Instrument::Gauge(vec)) => match vec.get_metric_with_label_values(labels) {
                Ok(series) => series.set(value),
                Err(e) => warn!(metric = name, error = %e, "gauge label mismatch"),
            },
            _ => warn!(metric = name, "set on undefined or non-gauge instrument"),
        }
    }

    fn inc(&mut self, name: &str, labels: &[&str], delta: f64) {
        match self.instruments.get(name) {
            Some(Instrument::Counter(vec)) => match vec.get_metric_with_label_values(labels) {
                Ok(series) => series.inc_by(delta),
                Err(e) => warn!(metric = name, error = %e, "counter label mismatch"),
            },
            _ => warn!(metric = name, "inc on undefined or non-counter instrument"),
        }
    }

    fn set_state(&mut self, name: &str, labels: &[&str], state: &str) {
        match self.instruments.get(name) {
            Some(Instrument::Enum { gauge, states }) => {
                if !states.iter().any(|s| s == state) {
                    warn!(metric = name, state, "state outside declared set");
                    return;
                }
                for s in states {
                    let mut full: Vec<&str> = labels.to_vec();
                    full.push(s);
                    match gauge.get_metric_with_label_values(&full) {
                        Ok(series) => series.set(if s == state { 1.0 } else { 0.0 }),
                        Err(e) => warn!(metric = name, error = %e, "enum label mismatch"),
                    }
                }
            }
            _ => warn!(metric = name, "set_state on undefined or non-enum instrument"),
        }
    }

    fn set_info(&mut self, name: &str, labels: &[&str], values: &[(&str, String)]) {
        match self.instruments.get_mut(name) {
            Some(Instrument::Info {
                gauge,
                value_labels,
                last,
            }) => {
                let mut full: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
                for field in value_labels.iter() {
                    let value = values
                        .iter()
                        .find(|(k, _)| k == field)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default();
                    full.push(value);
                }

                let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
                if let Some(previous) = last.get(&key) {
                    if *previous == full {
                        return;
                    }
                    let refs: Vec<&str> = previous.iter().map(String::as_str).collect();
                    let _ = gauge.remove_label_values(&refs);
                }

                let refs: Vec<&str> = full.iter().map(String::as_str).collect();
                match gauge.get_metric_with_label_values(&refs) {
                    Ok(series) => {
                        series.set(1.0);
                        last.insert(key, full);
                    }
                    Err(e) => warn!(metric = name, error = %e, "info label mismatch"),
                }
            }
            _ => warn!(metric = name, "set_info on undefined or non-info instrument"),
        }
    }

    fn remove_series(&mut self, name: &str, labels: &[&str]) {
        match self.instruments.get_mut(name) {
            Some(Instrument::Gauge(vec)) => {
                if vec.remove_label_values(labels).is_err() {
                    debug!(metric = name, "removing absent series");
                }
            }
            Some(Instrument::Counter(vec)) => {
                if vec.remove_label_values(labels).is_err() {
                    debug!(metric = name, "removing absent series");
                }
            }
            Some(Instrument::Enum { gauge, states }) => {
                for s in states.iter() {
                    let mut full: Vec<&str> = labels.to_vec();
                    full.push(s);
                    let _ = gauge.remove_label_values(&full);
                }
            }
            Some(Instrument::Info { gauge, last, .. }) => {
                let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
                if let Some(previous) = last.remove(&key) {
                    let refs: Vec<&str> = previous.iter().map(String::as_str).collect();
                    let _ = gauge.remove_label_values(&refs);
                }
            }
            None => warn!(metric = name, "remove_series on undefined instrument"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::proto::MetricFamily;

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> Option<&'a MetricFamily> {
        families.iter().find(|f| f.get_name() == name)
    }

    #[test]
    fn test_gauge_set_and_remove() {
        let mut sink = PromSink::new();
        sink.define_gauge("cloud_vcpus", "vCPUs", &["host"]);
        sink.set("cloud_vcpus", &["node1"], 32.0);

        let families = sink.registry().gather();
        let fam = family(&families, "cloud_vcpus").unwrap();
        assert_eq!(fam.get_metric().len(), 1);
        assert_eq!(fam.get_metric()[0].get_gauge().get_value(), 32.0);

        sink.remove_series("cloud_vcpus", &["node1"]);
        let families = sink.registry().gather();
        assert!(
            family(&families, "cloud_vcpus").is_none_or(|f| f.get_metric().is_empty()),
            "series should be gone after removal"
        );
    }

    #[test]
    fn test_enum_is_one_hot() {
        let mut sink = PromSink::new();
        sink.define_enum("cloud_api_state", "API status", &["api"], &["up", "down"]);
        sink.set_state("cloud_api_state", &["compute"], "up");

        let families = sink.registry().gather();
        let fam = family(&families, "cloud_api_state").unwrap();
        let mut active = 0.0;
        for m in fam.get_metric() {
            active += m.get_gauge().get_value();
        }
        assert_eq!(fam.get_metric().len(), 2);
        assert_eq!(active, 1.0);

        // Flipping the state moves the 1, total stays 1.
        sink.set_state("cloud_api_state", &["compute"], "down");
        let families = sink.registry().gather();
        let fam = family(&families, "cloud_api_state").unwrap();
        let mut active = 0.0;
        for m in fam.get_metric() {
            active += m.get_gauge().get_value();
        }
        assert_eq!(active, 1.0);
    }

    #[test]
    fn test_enum_rejects_undeclared_state() {
        let mut sink = PromSink::new();
        sink.define_enum("cloud_api_state", "API status", &["api"], &["up", "down"]);
        sink.set_state("cloud_api_state", &["compute"], "sideways");

        let families = sink.registry().gather();
        // Nothing was published for the bogus state.
        assert!(family(&families, "cloud_api_state").is_none_or(|f| f.get_metric().is_empty()));
    }

    #[test]
    fn test_info_replaces_previous_record() {
        let mut sink = PromSink::new();
        sink.define_info("cloud_api", "API versions", &["api"], &["version", "status"]);
        sink.set_info(
            "cloud_api",
            &["compute"],
            &[("version", "2.1".to_string()), ("status", "CURRENT".to_string())],
        );
        sink.set_info(
            "cloud_api",
            &["compute"],
            &[("version", "2.2".to_string()), ("status", "CURRENT".to_string())],
        );

        let families = sink.registry().gather();
        let fam = family(&families, "cloud_api_info").unwrap();
        assert_eq!(fam.get_metric().len(), 1, "old record must be retracted");
        let labels = fam.get_metric()[0].get_label();
        assert!(
            labels
                .iter()
                .any(|l| l.get_name() == "version" && l.get_value() == "2.2")
        );
    }

    #[test]
    fn test_counter_accumulates() {
        let mut sink = PromSink::new();
        sink.define_counter("cloud_lb_in_bytes", "bytes in", &["id"]);
        sink.inc("cloud_lb_in_bytes", &["lb1"], 0.0);
        sink.inc("cloud_lb_in_bytes", &["lb1"], 100.0);
        sink.inc("cloud_lb_in_bytes", &["lb1"], 50.0);

        let families = sink.registry().gather();
        let fam = family(&families, "cloud_lb_in_bytes").unwrap();
        assert_eq!(fam.get_metric()[0].get_counter().get_value(), 150.0);
    }
}

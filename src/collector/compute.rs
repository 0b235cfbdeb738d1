//! Compute subsystem collector: hypervisors, aggregates and compute
//! micro-services.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use crate::collector::reconcile::{SeriesSet, tuple};
use crate::collector::{ApiSpecifics, MicroService};
use crate::metrics::{MetricSink, label_refs};
use crate::source::{BackendError, DataSource, ResourceKind};

/// Hypervisor measurements exported as gauges: metric suffix and the backend
/// attribute it is read from. `_bytes` metrics are reported by the backend
/// in MiB and scaled on export.
const HOST_MEASUREMENTS: &[(&str, &str)] = &[
    ("vcpus", "vcpus"),
    ("vcpus_used", "vcpus_used"),
    ("running_vms", "running_vms"),
    ("ram_used_bytes", "memory_used"),
    ("ram_size_bytes", "memory_size"),
    ("ram_free_bytes", "memory_free"),
    ("local_disk_size_bytes", "local_disk_size"),
    ("local_disk_used_bytes", "local_disk_used"),
    ("local_disk_free_bytes", "local_disk_free"),
    ("disk_available_bytes", "disk_available"),
    ("current_workload", "current_workload"),
];

const MIB: f64 = 1_048_576.0;

pub(super) struct ComputeSpecifics {
    subsystem: String,
    prefix: String,
    hosts: SeriesSet,
    aggregates: SeriesSet,
}

impl ComputeSpecifics {
    pub(super) fn new(subsystem: &str, prefix: &str) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            prefix: prefix.to_string(),
            hosts: SeriesSet::new(),
            aggregates: SeriesSet::new(),
        }
    }

    fn m(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.prefix)
    }
}

impl ApiSpecifics for ComputeSpecifics {
    fn define_metrics(&mut self, sink: &mut dyn MetricSink) {
        let labels = &["host", "name", "aggregates"];
        for (suffix, _) in HOST_MEASUREMENTS {
            sink.define_gauge(&self.m(suffix), "", labels);
        }
        sink.define_enum(&self.m("hypervisor_state"), "", labels, &["up", "down"]);
        sink.define_enum(
            &self.m("hypervisor_status"),
            "",
            labels,
            &["enabled", "disabled"],
        );
        sink.define_info(
            &self.m("hypervisor"),
            "",
            &["host"],
            &["name", "aggregates", "arch", "model", "ip", "vcpus", "ram_gb", "disk_gb"],
        );
        sink.define_info(&self.m("aggregates"), "", &["name"], &["id", "hosts"]);
    }

    fn micro_services(
        &mut self,
        source: &mut dyn DataSource,
    ) -> Result<Option<Vec<MicroService>>, BackendError> {
        let records = source.list_entities(&self.subsystem, ResourceKind::Services, &[])?;
        Ok(Some(
            records
                .iter()
                .map(|r| MicroService {
                    binary: r.str_field("binary").to_string(),
                    host: r.str_field("host").to_string(),
                    state: r.str_field("state").to_string(),
                    status: r.str_field("status").to_string(),
                })
                .collect(),
        ))
    }

    fn collect(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<(), BackendError> {
        // Aggregates first: hypervisor labels carry the aggregate membership.
        let records = source.list_entities(&self.subsystem, ResourceKind::Aggregates, &[])?;
        let mut host_aggregates: HashMap<String, String> = HashMap::new();
        let mut current = HashSet::new();
        for aggregate in records.iter().filter(|a| !a.bool_field("deleted")) {
            let name = aggregate.str_field("name");
            sink.set_info(
                &self.m("aggregates"),
                &[name],
                &[
                    ("id", aggregate.id.clone()),
                    ("hosts", aggregate.list_field("hosts").join(",")),
                ],
            );
            current.insert(tuple(&[name]));
            for host in aggregate.list_field("hosts") {
                host_aggregates
                    .entry(host)
                    .and_modify(|names| {
                        names.push(',');
                        names.push_str(name);
                    })
                    .or_insert_with(|| name.to_string());
            }
        }
        for removed in self.aggregates.reconcile(current) {
            debug!(labels = ?removed, "removing vanished aggregate");
            sink.remove_series(&self.m("aggregates"), &label_refs(&removed));
        }

        let records = source.list_entities(&self.subsystem, ResourceKind::Hypervisors, &[])?;
        let mut current = HashSet::new();
        for hypervisor in &records {
            let name = hypervisor.str_field("name");
            let host = name.split('.').next().unwrap_or(name);
            let aggregates = host_aggregates
                .get(host)
                .cloned()
                .unwrap_or_else(|| "none".to_string());
            let t = tuple(&[host, name, &aggregates]);
            let refs = label_refs(&t);

            for (suffix, attribute) in HOST_MEASUREMENTS {
                let raw = hypervisor.f64_field(attribute);
                let value = if suffix.ends_with("_bytes") { raw * MIB } else { raw };
                sink.set(&self.m(suffix), &refs, value);
            }
            sink.set_state(&self.m("hypervisor_state"), &refs, hypervisor.str_field("state"));
            sink.set_state(&self.m("hypervisor_status"), &refs, hypervisor.str_field("status"));

            let cpu_info = hypervisor.fields.get("cpu_info").and_then(Value::as_object);
            let cpu_str = |key: &str| -> String {
                cpu_info
                    .and_then(|m| m.get(key))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string()
            };
            sink.set_info(
                &self.m("hypervisor"),
                &[host],
                &[
                    ("name", name.to_string()),
                    ("aggregates", aggregates.clone()),
                    ("arch", cpu_str("arch")),
                    ("model", cpu_str("model")),
                    ("ip", hypervisor.str_field("host_ip").to_string()),
                    ("vcpus", format!("{}", hypervisor.f64_field("vcpus"))),
                    ("ram_gb", format!("{}", hypervisor.f64_field("memory_size"))),
                    ("disk_gb", format!("{}", hypervisor.f64_field("local_disk_size"))),
                ],
            );
            current.insert(t);
        }

        for removed in self.hosts.reconcile(current) {
            debug!(labels = ?removed, "removing vanished hypervisor");
            let refs = label_refs(&removed);
            for (suffix, _) in HOST_MEASUREMENTS {
                sink.remove_series(&self.m(suffix), &refs);
            }
            sink.remove_series(&self.m("hypervisor_state"), &refs);
            sink.remove_series(&self.m("hypervisor_status"), &refs);
            // The info record is keyed by host only.
            sink.remove_series(&self.m("hypervisor"), &refs[..1]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MockSink;
    use crate::source::{EntityRecord, MockSource};
    use serde_json::json;

    fn specifics_with_sink() -> (ComputeSpecifics, MockSink) {
        let mut sp = ComputeSpecifics::new("compute", "cloud_compute");
        let mut sink = MockSink::new();
        sp.define_metrics(&mut sink);
        (sp, sink)
    }

    #[test]
    fn test_byte_measurements_are_scaled_from_mib() {
        let (mut sp, mut sink) = specifics_with_sink();
        let mut source = MockSource::small_cloud();
        sp.collect(&mut source, &mut sink).unwrap();

        let labels = ["cmp1", "cmp1.cloud.local", "general"];
        assert_eq!(sink.gauge_value("cloud_compute_vcpus", &labels), Some(48.0));
        assert_eq!(
            sink.gauge_value("cloud_compute_ram_size_bytes", &labels),
            Some(262_144.0 * MIB)
        );
    }

    #[test]
    fn test_host_without_aggregate_gets_none_label() {
        let (mut sp, mut sink) = specifics_with_sink();
        let source = MockSource::small_cloud();
        source.set_entities("compute", ResourceKind::Aggregates, vec![]);
        let mut src = source.clone();
        sp.collect(&mut src, &mut sink).unwrap();

        assert!(sink.has_series("cloud_compute_vcpus", &["cmp1", "cmp1.cloud.local", "none"]));
    }

    #[test]
    fn test_vanished_hypervisor_series_are_retracted() {
        let (mut sp, mut sink) = specifics_with_sink();
        let source = MockSource::small_cloud();
        let mut src = source.clone();
        sp.collect(&mut src, &mut sink).unwrap();
        assert_eq!(sink.series_count("cloud_compute_vcpus"), 2);

        // cmp2 is decommissioned.
        source.set_entities(
            "compute",
            ResourceKind::Hypervisors,
            vec![
                EntityRecord::new("hv-1")
                    .with("name", "cmp1.cloud.local")
                    .with("state", "up")
                    .with("status", "enabled")
                    .with("cpu_info", json!({"arch": "x86_64", "model": "EPYC"}))
                    .with("vcpus", 48),
            ],
        );
        sp.collect(&mut src, &mut sink).unwrap();

        assert_eq!(sink.series_count("cloud_compute_vcpus"), 1);
        assert!(!sink.has_series(
            "cloud_compute_hypervisor_state",
            &["cmp2", "cmp2.cloud.local", "general"]
        ));
        assert!(!sink.has_series("cloud_compute_hypervisor", &["cmp2"]));
        assert!(sink.has_series("cloud_compute_hypervisor", &["cmp1"]));
    }

    #[test]
    fn test_failed_fetch_leaves_series_untouched() {
        let (mut sp, mut sink) = specifics_with_sink();
        let source = MockSource::small_cloud();
        let mut src = source.clone();
        sp.collect(&mut src, &mut sink).unwrap();
        assert_eq!(sink.series_count("cloud_compute_vcpus"), 2);

        source.fail_fetch(
            "compute",
            ResourceKind::Hypervisors,
            BackendError::Unavailable("503".to_string()),
        );
        assert!(sp.collect(&mut src, &mut sink).is_err());

        // No retraction happened: an outage is not an empty inventory.
        assert_eq!(sink.series_count("cloud_compute_vcpus"), 2);
    }
}

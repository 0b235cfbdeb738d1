//! Network subsystem collector: floating IPs, routers and network agents.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::collector::reconcile::{SeriesSet, tuple};
use crate::collector::{ApiSpecifics, MicroService};
use crate::metrics::{MetricSink, label_refs};
use crate::source::{BackendError, DataSource, ResourceKind};

pub(super) struct NetworkSpecifics {
    subsystem: String,
    prefix: String,
    floating_ips: SeriesSet,
    /// Router statuses seen so far; absent statuses are reported as zero
    /// rather than retracted so rate() over them stays well defined.
    router_statuses: HashSet<String>,
}

impl NetworkSpecifics {
    pub(super) fn new(subsystem: &str, prefix: &str) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            prefix: prefix.to_string(),
            floating_ips: SeriesSet::new(),
            router_statuses: HashSet::new(),
        }
    }

    fn m(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.prefix)
    }
}

impl ApiSpecifics for NetworkSpecifics {
    fn define_metrics(&mut self, sink: &mut dyn MetricSink) {
        sink.define_gauge(&self.m("floating_ips"), "", &["project_id", "status"]);
        sink.define_gauge(&self.m("routers"), "", &["status"]);
    }

    fn micro_services(
        &mut self,
        source: &mut dyn DataSource,
    ) -> Result<Option<Vec<MicroService>>, BackendError> {
        let records = source.list_entities(&self.subsystem, ResourceKind::Agents, &[])?;
        Ok(Some(
            records
                .iter()
                .map(|r| MicroService {
                    binary: r.str_field("binary").to_string(),
                    host: r.str_field("host").to_string(),
                    state: if r.bool_field("is_alive") { "up" } else { "down" }.to_string(),
                    status: if r.bool_field("is_admin_state_up") {
                        "enabled"
                    } else {
                        "disabled"
                    }
                    .to_string(),
                })
                .collect(),
        ))
    }

    fn collect(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<(), BackendError> {
        let records = source.list_entities(&self.subsystem, ResourceKind::FloatingIps, &[])?;
        let mut counts: HashMap<(String, String), f64> = HashMap::new();
        for fip in &records {
            let key = (
                fip.str_field("project_id").to_string(),
                fip.str_field("status").to_string(),
            );
            *counts.entry(key).or_insert(0.0) += 1.0;
        }
        let mut current = HashSet::new();
        for ((project_id, status), count) in &counts {
            sink.set(&self.m("floating_ips"), &[project_id, status], *count);
            current.insert(tuple(&[project_id, status]));
        }
        for removed in self.floating_ips.reconcile(current) {
            debug!(labels = ?removed, "removing drained floating ip group");
            sink.remove_series(&self.m("floating_ips"), &label_refs(&removed));
        }

        let records = source.list_entities(&self.subsystem, ResourceKind::Routers, &[])?;
        let mut counts: HashMap<String, f64> =
            self.router_statuses.iter().map(|s| (s.clone(), 0.0)).collect();
        for router in &records {
            *counts.entry(router.str_field("status").to_string()).or_insert(0.0) += 1.0;
        }
        for (status, count) in &counts {
            sink.set(&self.m("routers"), &[status], *count);
        }
        self.router_statuses = counts.into_keys().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MockSink;
    use crate::source::{EntityRecord, MockSource};

    fn specifics_with_sink() -> (NetworkSpecifics, MockSink) {
        let mut sp = NetworkSpecifics::new("network", "cloud_network");
        let mut sink = MockSink::new();
        sp.define_metrics(&mut sink);
        (sp, sink)
    }

    #[test]
    fn test_floating_ips_grouped_by_project_and_status() {
        let (mut sp, mut sink) = specifics_with_sink();
        let mut source = MockSource::small_cloud();
        sp.collect(&mut source, &mut sink).unwrap();

        assert_eq!(
            sink.gauge_value("cloud_network_floating_ips", &["proj-a", "ACTIVE"]),
            Some(2.0)
        );
        assert_eq!(
            sink.gauge_value("cloud_network_floating_ips", &["proj-b", "DOWN"]),
            Some(1.0)
        );
    }

    #[test]
    fn test_drained_floating_ip_group_is_retracted() {
        let (mut sp, mut sink) = specifics_with_sink();
        let source = MockSource::small_cloud();
        let mut src = source.clone();
        sp.collect(&mut src, &mut sink).unwrap();

        source.set_entities(
            "network",
            ResourceKind::FloatingIps,
            vec![
                EntityRecord::new("fip-1")
                    .with("project_id", "proj-a")
                    .with("status", "ACTIVE"),
            ],
        );
        sp.collect(&mut src, &mut sink).unwrap();

        assert_eq!(
            sink.gauge_value("cloud_network_floating_ips", &["proj-a", "ACTIVE"]),
            Some(1.0)
        );
        assert!(!sink.has_series("cloud_network_floating_ips", &["proj-b", "DOWN"]));
    }

    #[test]
    fn test_router_status_drops_to_zero_instead_of_vanishing() {
        let (mut sp, mut sink) = specifics_with_sink();
        let source = MockSource::small_cloud();
        let mut src = source.clone();
        sp.collect(&mut src, &mut sink).unwrap();
        assert_eq!(sink.gauge_value("cloud_network_routers", &["ACTIVE"]), Some(2.0));

        source.set_entities(
            "network",
            ResourceKind::Routers,
            vec![EntityRecord::new("router-3").with("status", "ERROR")],
        );
        sp.collect(&mut src, &mut sink).unwrap();

        assert_eq!(sink.gauge_value("cloud_network_routers", &["ACTIVE"]), Some(0.0));
        assert_eq!(sink.gauge_value("cloud_network_routers", &["ERROR"]), Some(1.0));
    }

    #[test]
    fn test_agents_reported_as_micro_services() {
        let (mut sp, _sink) = specifics_with_sink();
        let mut source = MockSource::small_cloud();
        let services = sp.micro_services(&mut source).unwrap().unwrap();

        assert!(!services.is_empty());
        for svc in &services {
            assert!(svc.state == "up" || svc.state == "down");
            assert!(svc.status == "enabled" || svc.status == "disabled");
        }
    }
}

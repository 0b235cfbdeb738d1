//! End-to-end poll cycles against the simulated backend: series follow the
//! inventory, outages freeze the picture instead of erasing it, and traffic
//! totals are re-exported as monotonic counters.

use stackmon::collector::Collector;
use stackmon::config::ExporterConfig;
use stackmon::metrics::MockSink;
use stackmon::source::{EntityRecord, MockSource, ResourceKind};

fn exporter() -> (MockSource, MockSink, Collector) {
    let source = MockSource::small_cloud();
    let sink = MockSink::new();
    let config = ExporterConfig {
        metric_prefix: "cloud".to_string(),
        ..ExporterConfig::default()
    };
    let collector =
        Collector::new(&config, Box::new(source.clone()), Box::new(sink.clone())).unwrap();
    (source, sink, collector)
}

#[test]
fn test_series_follow_the_inventory_across_polls() {
    let (source, sink, mut collector) = exporter();

    collector.refresh();
    assert!(sink.has_series("cloud_compute_vcpus", &["cmp1", "cmp1.cloud.local", "general"]));
    assert!(sink.has_series("cloud_compute_vcpus", &["cmp2", "cmp2.cloud.local", "general"]));

    // cmp2 is replaced by cmp3 between polls.
    source.set_entities(
        "compute",
        ResourceKind::Hypervisors,
        vec![
            hypervisor("hv-1", "cmp1.cloud.local"),
            hypervisor("hv-3", "cmp3.cloud.local"),
        ],
    );
    collector.refresh();

    assert!(sink.has_series("cloud_compute_vcpus", &["cmp1", "cmp1.cloud.local", "general"]));
    assert!(sink.has_series("cloud_compute_vcpus", &["cmp3", "cmp3.cloud.local", "none"]));
    assert!(!sink.has_series("cloud_compute_vcpus", &["cmp2", "cmp2.cloud.local", "general"]));
    assert!(!sink.has_series("cloud_compute_hypervisor", &["cmp2"]));
}

#[test]
fn test_outage_freezes_series_and_flags_the_subsystem_down() {
    let (source, sink, mut collector) = exporter();

    collector.refresh();
    assert_eq!(sink.state("cloud_api_state", &["network"]), Some("up".to_string()));
    assert!(sink.has_series("cloud_network_floating_ips", &["proj-a", "ACTIVE"]));

    source.set_down("network");
    collector.refresh();

    // The subsystem is reported down but its last-known inventory stays up.
    assert_eq!(sink.state("cloud_api_state", &["network"]), Some("down".to_string()));
    assert!(sink.has_series("cloud_network_floating_ips", &["proj-a", "ACTIVE"]));
    // Other subsystems keep collecting.
    assert_eq!(sink.state("cloud_api_state", &["compute"]), Some("up".to_string()));
}

#[test]
fn test_traffic_totals_become_monotonic_counters() {
    let (source, sink, mut collector) = exporter();
    let labels = ["lb-1", "web-lb", "proj-a"];

    collector.refresh();
    assert_eq!(
        sink.counter_value("cloud_load_balancer_lb_in_bytes", &labels),
        Some(0.0)
    );

    source.set_entities(
        "load-balancer",
        ResourceKind::LoadBalancerStats,
        vec![lb_stats(1_400_000, 800)],
    );
    collector.refresh();
    assert_eq!(
        sink.counter_value("cloud_load_balancer_lb_in_bytes", &labels),
        Some(400_000.0)
    );
    assert_eq!(
        sink.counter_value("cloud_load_balancer_lb_connections", &labels),
        Some(300.0)
    );

    // Backend restart: totals drop, the exported counter must not.
    source.set_entities(
        "load-balancer",
        ResourceKind::LoadBalancerStats,
        vec![lb_stats(10_000, 7)],
    );
    collector.refresh();
    assert_eq!(
        sink.counter_value("cloud_load_balancer_lb_in_bytes", &labels),
        Some(400_000.0)
    );

    source.set_entities(
        "load-balancer",
        ResourceKind::LoadBalancerStats,
        vec![lb_stats(60_000, 27)],
    );
    collector.refresh();
    assert_eq!(
        sink.counter_value("cloud_load_balancer_lb_in_bytes", &labels),
        Some(450_000.0)
    );
}

#[test]
fn test_poll_timestamp_advances_every_cycle() {
    let (_source, sink, mut collector) = exporter();
    collector.refresh();
    let first = sink.gauge_value("cloud_collection_timestamp", &[]).unwrap();
    collector.refresh();
    let second = sink.gauge_value("cloud_collection_timestamp", &[]).unwrap();
    assert!(first > 0.0);
    assert!(second >= first);
}

fn hypervisor(id: &str, name: &str) -> EntityRecord {
    EntityRecord::new(id)
        .with("name", name)
        .with("state", "up")
        .with("status", "enabled")
        .with("host_ip", "192.0.2.20")
        .with("cpu_info", serde_json::json!({"arch": "x86_64", "model": "EPYC"}))
        .with("vcpus", 32)
        .with("memory_size", 131_072)
}

fn lb_stats(bytes_in: u64, total_connections: u64) -> EntityRecord {
    EntityRecord::new("lb-1-stats")
        .with("loadbalancer_id", "lb-1")
        .with("active_connections", 5)
        .with("bytes_in", bytes_in)
        .with("bytes_out", 2_000_000)
        .with("total_connections", total_connections)
        .with("request_errors", 3)
}

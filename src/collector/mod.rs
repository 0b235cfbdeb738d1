//! Collector orchestration.
//!
//! One `Collector` owns the metric sink and one `ApiCollector` per
//! discovered backend subsystem. Each cycle it drives every subsystem
//! through probe, micro-service reconciliation and subsystem-specific
//! collection, isolating failures so one broken subsystem never blocks the
//! others.

mod block_storage;
mod compute;
mod load_balancer;
mod network;
mod probe;
mod reconcile;

pub use probe::{ProbeController, ProbeState};
pub use reconcile::{CounterTracker, SeriesSet, tuple};

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::ExporterConfig;
use crate::metrics::{MetricSink, label_refs};
use crate::source::{BackendError, DataSource, ProbePath};

use block_storage::BlockStorageSpecifics;
use compute::ComputeSpecifics;
use load_balancer::LoadBalancerSpecifics;
use network::NetworkSpecifics;

/// Names of the instruments shared by all subsystem collectors.
#[derive(Debug, Clone)]
pub struct CommonMetrics {
    pub api_state: String,
    pub api_info: String,
    pub service_state: String,
    pub service_status: String,
    pub collection_duration: String,
    pub collection_timestamp: String,
}

impl CommonMetrics {
    /// Registers the shared instruments under `prefix` and returns their
    /// names.
    pub fn define(sink: &mut dyn MetricSink, prefix: &str) -> Self {
        let common = Self {
            api_state: format!("{prefix}_api_state"),
            api_info: format!("{prefix}_api"),
            service_state: format!("{prefix}_service_state"),
            service_status: format!("{prefix}_service_status"),
            collection_duration: format!("{prefix}_collection_duration_seconds"),
            collection_timestamp: format!("{prefix}_collection_timestamp"),
        };
        sink.define_enum(&common.api_state, "Status of API", &["api"], &["up", "down"]);
        sink.define_info(
            &common.api_info,
            "Version information about APIs",
            &["api"],
            &["status", "version", "min_microversion", "max_microversion"],
        );
        sink.define_enum(
            &common.service_state,
            "State of micro-service",
            &["api", "micro_service", "host"],
            &["up", "down"],
        );
        sink.define_enum(
            &common.service_status,
            "Status of micro-service",
            &["api", "micro_service", "host"],
            &["enabled", "disabled"],
        );
        sink.define_gauge(
            &common.collection_duration,
            "Time spent collecting one subsystem's data, last cycle",
            &["api"],
        );
        sink.define_gauge(
            &common.collection_timestamp,
            "Timestamp of last completed collection run",
            &[],
        );
        common
    }
}

/// Normalized record of one backend micro-service daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroService {
    pub binary: String,
    pub host: String,
    /// "up" or "down".
    pub state: String,
    /// "enabled" or "disabled".
    pub status: String,
}

/// Subsystem-specific collection behavior behind the shared probe and
/// micro-service machinery.
trait ApiSpecifics: Send {
    /// Registers the subsystem's own metric families. Called once at
    /// construction.
    fn define_metrics(&mut self, sink: &mut dyn MetricSink);

    /// Lists the subsystem's micro-service daemons in normalized form.
    /// `Ok(None)` means the subsystem exposes none.
    fn micro_services(
        &mut self,
        _source: &mut dyn DataSource,
    ) -> Result<Option<Vec<MicroService>>, BackendError> {
        Ok(None)
    }

    /// Collects the subsystem's entity data, updating the sink and the
    /// collector's remembered state.
    fn collect(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<(), BackendError>;
}

/// One backend subsystem: probe lifecycle, micro-service reconciliation and
/// optional subsystem-specific collection.
pub struct ApiCollector {
    subsystem: String,
    probe: ProbeController,
    micro_services: SeriesSet,
    specifics: Option<Box<dyn ApiSpecifics>>,
}

impl ApiCollector {
    fn new(
        subsystem: &str,
        probe_paths: &[ProbePath],
        mut specifics: Option<Box<dyn ApiSpecifics>>,
        sink: &mut dyn MetricSink,
    ) -> Self {
        if let Some(sp) = specifics.as_mut() {
            sp.define_metrics(sink);
        }
        Self {
            subsystem: subsystem.to_string(),
            probe: ProbeController::new(subsystem, probe_paths),
            micro_services: SeriesSet::new(),
            specifics,
        }
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    pub fn probe_state(&self) -> ProbeState {
        self.probe.state()
    }

    /// Runs one cycle for this subsystem. When the subsystem is down, data
    /// collection is skipped and previously exported series stay as they
    /// are until the next live cycle reconciles them.
    fn collect(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
        common: &CommonMetrics,
    ) -> Result<(), BackendError> {
        self.probe.ensure_initialized(source, sink, common);
        if !self.probe.probe_liveness(source, sink, common) {
            return Ok(());
        }
        if let Some(sp) = self.specifics.as_mut() {
            if let Some(services) = sp.micro_services(source)? {
                update_micro_services(
                    &self.subsystem,
                    &mut self.micro_services,
                    services,
                    sink,
                    common,
                );
            }
            sp.collect(source, sink)?;
        }
        Ok(())
    }
}

/// Publishes micro-service state/status and retracts daemons that are gone.
fn update_micro_services(
    subsystem: &str,
    remembered: &mut SeriesSet,
    services: Vec<MicroService>,
    sink: &mut dyn MetricSink,
    common: &CommonMetrics,
) {
    let mut current = HashSet::new();
    for service in services {
        let t = tuple(&[subsystem, &service.binary, &service.host]);
        let refs = label_refs(&t);
        sink.set_state(&common.service_state, &refs, &service.state);
        sink.set_state(&common.service_status, &refs, &service.status);
        current.insert(t);
    }
    for removed in remembered.reconcile(current) {
        debug!(subsystem, labels = ?removed, "removing vanished micro-service");
        let refs = label_refs(&removed);
        sink.remove_series(&common.service_state, &refs);
        sink.remove_series(&common.service_status, &refs);
    }
}

/// Owns the sink, the source and all per-subsystem collectors; drives one
/// full poll cycle per `refresh()` call.
pub struct Collector {
    source: Box<dyn DataSource>,
    sink: Box<dyn MetricSink>,
    common: CommonMetrics,
    collectors: Vec<ApiCollector>,
}

impl Collector {
    /// Discovers the service catalog and builds one collector per subsystem
    /// not excluded by the config.
    pub fn new(
        config: &ExporterConfig,
        mut source: Box<dyn DataSource>,
        mut sink: Box<dyn MetricSink>,
    ) -> Result<Self, BackendError> {
        let common = CommonMetrics::define(sink.as_mut(), &config.metric_prefix);

        let mut collectors: Vec<ApiCollector> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for service in source.list_services()? {
            if config.api_exclude.iter().any(|x| *x == service.name) {
                info!(service = %service.name, "subsystem excluded by config");
                continue;
            }
            let subsystem = source.normalize_service_type(&service.service_type);
            if !seen.insert(subsystem.clone()) {
                continue;
            }

            let family_prefix = family_prefix(&config.metric_prefix, &subsystem);
            let (paths, specifics): (&[ProbePath], Option<Box<dyn ApiSpecifics>>) =
                match subsystem.as_str() {
                    "compute" => (
                        &[ProbePath::Root],
                        Some(Box::new(ComputeSpecifics::new(&subsystem, &family_prefix))),
                    ),
                    "network" => (
                        &[ProbePath::Root],
                        Some(Box::new(NetworkSpecifics::new(&subsystem, &family_prefix))),
                    ),
                    "block-storage" => (
                        &[ProbePath::OneUp],
                        Some(Box::new(BlockStorageSpecifics::new(&subsystem))),
                    ),
                    "load-balancer" => (
                        &[ProbePath::OneUp],
                        Some(Box::new(LoadBalancerSpecifics::new(&subsystem, &family_prefix))),
                    ),
                    // Version-discovery endpoints of these reject a bare
                    // root query; probe the parent path only.
                    "image" | "orchestration" => (&[ProbePath::OneUp], None),
                    _ => (&[ProbePath::Root, ProbePath::OneUp, ProbePath::TwoUp], None),
                };

            info!(subsystem = %subsystem, service = %service.name, "initializing collector");
            collectors.push(ApiCollector::new(&subsystem, paths, specifics, sink.as_mut()));
        }

        Ok(Self {
            source,
            sink,
            common,
            collectors,
        })
    }

    pub fn subsystems(&self) -> Vec<&str> {
        self.collectors.iter().map(|c| c.subsystem()).collect()
    }

    pub fn probe_state(&self, subsystem: &str) -> Option<ProbeState> {
        self.collectors
            .iter()
            .find(|c| c.subsystem() == subsystem)
            .map(|c| c.probe_state())
    }

    /// Runs one full poll cycle across all subsystems.
    ///
    /// A failure (or panic) inside one subsystem's collection is logged with
    /// the subsystem name and does not stop the remaining subsystems. After
    /// all collectors ran, the completion timestamp gauge is updated; a
    /// stalled exporter is detectable by that gauge going stale.
    pub fn refresh(&mut self) {
        let Self {
            source,
            sink,
            common,
            collectors,
        } = self;

        for collector in collectors.iter_mut() {
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                collector.collect(source.as_mut(), sink.as_mut(), common)
            }));
            let elapsed = started.elapsed();
            sink.set(
                &common.collection_duration,
                &[collector.subsystem()],
                elapsed.as_secs_f64(),
            );
            match outcome {
                Ok(Ok(())) => {
                    debug!(
                        subsystem = collector.subsystem(),
                        duration_ms = elapsed.as_millis() as u64,
                        "collection finished"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        subsystem = collector.subsystem(),
                        error = %e,
                        "collection failed, keeping previous series until next cycle"
                    );
                }
                Err(_) => {
                    error!(
                        subsystem = collector.subsystem(),
                        "unhandled panic during data collection"
                    );
                }
            }
        }

        self.sink
            .set(&self.common.collection_timestamp, &[], Utc::now().timestamp() as f64);
    }
}

impl crate::scheduler::Refresh for Collector {
    fn refresh(&mut self) {
        Collector::refresh(self);
    }
}

fn family_prefix(prefix: &str, subsystem: &str) -> String {
    format!("{prefix}_{}", subsystem.replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MockSink;
    use crate::source::{MockSource, ResourceKind};

    fn config() -> ExporterConfig {
        ExporterConfig {
            metric_prefix: "cloud".to_string(),
            ..ExporterConfig::default()
        }
    }

    #[test]
    fn test_discovery_builds_one_collector_per_service_type() {
        let source = MockSource::small_cloud();
        let sink = MockSink::new();
        let collector =
            Collector::new(&config(), Box::new(source), Box::new(sink)).unwrap();
        assert_eq!(
            collector.subsystems(),
            vec![
                "compute",
                "network",
                "block-storage",
                "load-balancer",
                "image",
                "identity"
            ]
        );
    }

    #[test]
    fn test_exclude_list_skips_service_by_name() {
        let source = MockSource::small_cloud();
        let sink = MockSink::new();
        let cfg = ExporterConfig {
            metric_prefix: "cloud".to_string(),
            api_exclude: vec!["octavia".to_string(), "glance".to_string()],
            ..ExporterConfig::default()
        };
        let collector = Collector::new(&cfg, Box::new(source), Box::new(sink)).unwrap();
        assert!(!collector.subsystems().contains(&"load-balancer"));
        assert!(!collector.subsystems().contains(&"image"));
        assert!(collector.subsystems().contains(&"compute"));
    }

    #[test]
    fn test_refresh_updates_timestamp_and_duration() {
        let source = MockSource::small_cloud();
        let sink = MockSink::new();
        let view = sink.clone();
        let mut collector =
            Collector::new(&config(), Box::new(source), Box::new(sink)).unwrap();
        collector.refresh();

        assert!(view.gauge_value("cloud_collection_timestamp", &[]).unwrap() > 0.0);
        assert!(
            view.gauge_value("cloud_collection_duration_seconds", &["compute"])
                .is_some()
        );
    }

    #[test]
    fn test_micro_service_retraction() {
        let source = MockSource::small_cloud();
        let handle = source.clone();
        let sink = MockSink::new();
        let view = sink.clone();
        let mut collector =
            Collector::new(&config(), Box::new(source), Box::new(sink)).unwrap();

        collector.refresh();
        assert!(view.has_series("cloud_service_state", &["compute", "nova-compute", "cmp1"]));

        // nova-compute on cmp1 disappears from the catalog.
        handle.set_entities(
            "compute",
            ResourceKind::Services,
            vec![
                crate::source::EntityRecord::new("svc-1")
                    .with("binary", "nova-scheduler")
                    .with("host", "ctl1")
                    .with("status", "enabled")
                    .with("state", "up"),
            ],
        );
        collector.refresh();
        assert!(!view.has_series("cloud_service_state", &["compute", "nova-compute", "cmp1"]));
        assert!(!view.has_series("cloud_service_status", &["compute", "nova-compute", "cmp1"]));
        assert!(view.has_series("cloud_service_state", &["compute", "nova-scheduler", "ctl1"]));
    }

    #[test]
    fn test_one_failing_subsystem_does_not_block_others() {
        let source = MockSource::small_cloud();
        let handle = source.clone();
        let sink = MockSink::new();
        let view = sink.clone();
        let mut collector =
            Collector::new(&config(), Box::new(source), Box::new(sink)).unwrap();

        handle.fail_fetch(
            "compute",
            ResourceKind::Services,
            crate::source::BackendError::Unavailable("503".to_string()),
        );
        collector.refresh();

        // Compute failed mid-collection, network still ran.
        assert!(view.has_series("cloud_network_floating_ips", &["proj-a", "ACTIVE"]));
        assert!(view.gauge_value("cloud_collection_timestamp", &[]).is_some());
    }
}

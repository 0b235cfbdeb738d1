//! Per-subsystem lifecycle state machine.
//!
//! A subsystem moves `Uninitialized -> Initialized -> {Live, Down}`. Proxy
//! construction is attempted again every cycle until it succeeds; liveness is
//! probed every cycle once initialized and gates all data collection.

use tracing::{debug, info, warn};

use crate::collector::CommonMetrics;
use crate::metrics::MetricSink;
use crate::source::{DataSource, ProbePath};

/// Observable lifecycle state, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Uninitialized,
    /// Proxy exists, liveness not yet probed this process.
    Initialized,
    Live,
    Down,
}

pub struct ProbeController {
    subsystem: String,
    probe_paths: Vec<ProbePath>,
    initialized: bool,
    probed: bool,
    live: bool,
}

impl ProbeController {
    pub fn new(subsystem: &str, probe_paths: &[ProbePath]) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            probe_paths: probe_paths.to_vec(),
            initialized: false,
            probed: false,
            live: false,
        }
    }

    pub fn state(&self) -> ProbeState {
        match (self.initialized, self.probed, self.live) {
            (false, _, _) => ProbeState::Uninitialized,
            (true, false, _) => ProbeState::Initialized,
            (true, true, true) => ProbeState::Live,
            (true, true, false) => ProbeState::Down,
        }
    }

    pub fn is_live(&self) -> bool {
        self.initialized && self.live
    }

    /// Attempts proxy construction unless it already succeeded earlier.
    ///
    /// Version metadata is published on every attempt, successful or not: the
    /// backend serves it even when the subsystem itself is unreachable.
    /// Initialization failure is logged and retried on the next cycle.
    pub fn ensure_initialized(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
        common: &CommonMetrics,
    ) {
        if self.initialized {
            return;
        }

        self.publish_version_info(source, sink, common);

        if source.has_proxy(&self.subsystem) {
            self.initialized = true;
            return;
        }
        match source.init_proxy(&self.subsystem) {
            Ok(()) => {
                info!(subsystem = %self.subsystem, "instantiated proxy");
                self.initialized = true;
            }
            Err(e) => {
                info!(
                    subsystem = %self.subsystem,
                    error = %e,
                    "could not initialize proxy, retrying next cycle"
                );
            }
        }
    }

    fn publish_version_info(
        &self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
        common: &CommonMetrics,
    ) {
        match source.version_info(&self.subsystem) {
            Ok(Some(version)) => {
                debug!(subsystem = %self.subsystem, ?version, "publishing api version");
                sink.set_info(
                    &common.api_info,
                    &[&self.subsystem],
                    &[
                        ("status", version.status),
                        ("version", version.version),
                        ("min_microversion", version.min_microversion),
                        ("max_microversion", version.max_microversion),
                    ],
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(subsystem = %self.subsystem, error = %e, "could not fetch api version");
            }
        }
    }

    /// Probes the fallback paths in order; the first one that answers marks
    /// the subsystem live. Publishes the resulting up/down state.
    ///
    /// Probe traffic runs with backend call instrumentation suppressed so it
    /// does not pollute data-plane self-metrics.
    pub fn probe_liveness(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
        common: &CommonMetrics,
    ) -> bool {
        let mut live = false;
        if self.initialized {
            source.set_stats_collection(&self.subsystem, false);
            for path in &self.probe_paths {
                match source.probe(&self.subsystem, *path) {
                    Ok(()) => {
                        live = true;
                        break;
                    }
                    Err(e) => {
                        debug!(subsystem = %self.subsystem, ?path, error = %e, "probe failed");
                    }
                }
            }
            source.set_stats_collection(&self.subsystem, true);
        }

        self.probed = self.initialized;
        self.live = live;
        sink.set_state(
            &common.api_state,
            &[&self.subsystem],
            if live { "up" } else { "down" },
        );
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CommonMetrics;
    use crate::metrics::MockSink;
    use crate::source::{MockSource, VersionRecord};

    fn setup() -> (MockSource, MockSink, CommonMetrics) {
        let source = MockSource::new();
        let mut sink = MockSink::new();
        let common = CommonMetrics::define(&mut sink, "cloud");
        (source, sink, common)
    }

    #[test]
    fn test_initialization_is_retried_until_proxy_appears() {
        let (source, mut sink, common) = setup();
        let mut probe = ProbeController::new("compute", &[ProbePath::Root]);

        let mut src = source.clone();
        probe.ensure_initialized(&mut src, &mut sink, &common);
        assert_eq!(probe.state(), ProbeState::Uninitialized);

        source.allow_proxy("compute");
        probe.ensure_initialized(&mut src, &mut sink, &common);
        assert_eq!(probe.state(), ProbeState::Initialized);
    }

    #[test]
    fn test_version_info_published_even_when_init_fails() {
        let (source, mut sink, common) = setup();
        source.set_version(
            "compute",
            VersionRecord {
                status: "CURRENT".to_string(),
                version: "2.1".to_string(),
                ..VersionRecord::default()
            },
        );
        let mut probe = ProbeController::new("compute", &[ProbePath::Root]);
        let mut src = source.clone();
        probe.ensure_initialized(&mut src, &mut sink, &common);

        assert_eq!(probe.state(), ProbeState::Uninitialized);
        assert!(sink.has_series(&common.api_info, &["compute"]));
    }

    #[test]
    fn test_first_reachable_fallback_path_wins() {
        let (source, mut sink, common) = setup();
        source.allow_proxy("image");
        source.set_reachable("image", &[ProbePath::TwoUp]);
        let mut probe = ProbeController::new(
            "image",
            &[ProbePath::Root, ProbePath::OneUp, ProbePath::TwoUp],
        );

        let mut src = source.clone();
        probe.ensure_initialized(&mut src, &mut sink, &common);
        assert!(probe.probe_liveness(&mut src, &mut sink, &common));
        assert_eq!(probe.state(), ProbeState::Live);
        assert_eq!(sink.state(&common.api_state, &["image"]), Some("up".to_string()));
    }

    #[test]
    fn test_down_when_all_paths_fail() {
        let (source, mut sink, common) = setup();
        source.allow_proxy("network");
        source.set_down("network");
        let mut probe = ProbeController::new("network", &[ProbePath::Root, ProbePath::OneUp]);

        let mut src = source.clone();
        probe.ensure_initialized(&mut src, &mut sink, &common);
        assert!(!probe.probe_liveness(&mut src, &mut sink, &common));
        assert_eq!(probe.state(), ProbeState::Down);
        assert_eq!(
            sink.state(&common.api_state, &["network"]),
            Some("down".to_string())
        );
    }

    #[test]
    fn test_uninitialized_subsystem_reports_down_without_probing() {
        let (source, mut sink, common) = setup();
        let mut probe = ProbeController::new("compute", &[ProbePath::Root]);

        let mut src = source.clone();
        assert!(!probe.probe_liveness(&mut src, &mut sink, &common));
        assert_eq!(probe.state(), ProbeState::Uninitialized);
        assert_eq!(
            sink.state(&common.api_state, &["compute"]),
            Some("down".to_string())
        );
    }

    #[test]
    fn test_probe_suppresses_stats_collection() {
        let (source, mut sink, common) = setup();
        source.allow_proxy("compute");
        source.set_reachable("compute", &[ProbePath::Root]);
        let mut probe = ProbeController::new("compute", &[ProbePath::Root]);

        let mut src = source.clone();
        probe.ensure_initialized(&mut src, &mut sink, &common);
        probe.probe_liveness(&mut src, &mut sink, &common);

        assert_eq!(
            source.stats_toggles(),
            vec![("compute".to_string(), false), ("compute".to_string(), true)]
        );
        assert!(source.stats_enabled("compute"));
    }
}

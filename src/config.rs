//! Exporter runtime configuration.

use std::time::Duration;

/// Settings shared between the collector, the scheduler and the exposition
/// endpoint. Built from command-line arguments and `OS_EXPORTER_*` environment
/// variables by the daemon binary.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Prefix of every exported metric name.
    pub metric_prefix: String,
    /// Seconds between poll cycles.
    pub interval_secs: u64,
    /// Address the exposition endpoint listens on.
    pub listen_addr: String,
    /// Catalog service names to skip entirely.
    pub api_exclude: Vec<String>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            metric_prefix: "openstack".to_string(),
            interval_secs: 60,
            listen_addr: "0.0.0.0:9103".to_string(),
            api_exclude: Vec::new(),
        }
    }
}

impl ExporterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExporterConfig::default();
        assert_eq!(config.metric_prefix, "openstack");
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.listen_addr, "0.0.0.0:9103");
        assert!(config.api_exclude.is_empty());
    }
}

//! Mock data source for testing.
//!
//! `MockSource` is a cloneable handle over shared state, so a test can keep
//! one clone to mutate the simulated cloud between polls while the collector
//! owns the other. `small_cloud()` builds a pre-populated scenario covering
//! every subsystem the collectors know.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::json;

use super::{
    BackendError, DataSource, EntityRecord, Filters, ProbePath, ResourceKind, ServiceDescriptor,
    VersionRecord,
};

#[derive(Debug, Default)]
struct Inner {
    services: Vec<ServiceDescriptor>,
    aliases: HashMap<String, String>,
    /// Subsystems whose proxy construction succeeds.
    instantiable: HashSet<String>,
    /// Subsystems with an instantiated proxy.
    instantiated: HashSet<String>,
    /// Probe paths that answer, per subsystem.
    reachable: HashMap<String, Vec<ProbePath>>,
    versions: HashMap<String, VersionRecord>,
    entities: HashMap<(String, ResourceKind), Vec<EntityRecord>>,
    fetch_failures: HashMap<(String, ResourceKind), BackendError>,
    stats_disabled: HashSet<String>,
    /// Chronological log of stats-collection toggles, for assertions.
    stats_toggles: Vec<(String, bool)>,
}

/// Simulated backend with scenario builders and fault injection.
#[derive(Debug, Default, Clone)]
pub struct MockSource {
    inner: Arc<Mutex<Inner>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, name: &str, service_type: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.services.push(ServiceDescriptor::new(name, service_type));
    }

    /// Registers a catalog alias, e.g. `volumev3` -> `block-storage`.
    pub fn add_alias(&self, alias: &str, canonical: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.aliases.insert(alias.to_string(), canonical.to_string());
    }

    /// Makes proxy construction succeed for a subsystem.
    pub fn allow_proxy(&self, subsystem: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.instantiable.insert(subsystem.to_string());
    }

    /// Makes proxy construction fail for a subsystem (and drops any
    /// previously instantiated proxy).
    pub fn deny_proxy(&self, subsystem: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.instantiable.remove(subsystem);
        inner.instantiated.remove(subsystem);
    }

    /// Declares which probe paths answer for a subsystem.
    pub fn set_reachable(&self, subsystem: &str, paths: &[ProbePath]) {
        let mut inner = self.inner.lock().unwrap();
        inner.reachable.insert(subsystem.to_string(), paths.to_vec());
    }

    /// All probes fail for the subsystem from now on.
    pub fn set_down(&self, subsystem: &str) {
        self.set_reachable(subsystem, &[]);
    }

    pub fn set_version(&self, subsystem: &str, version: VersionRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.versions.insert(subsystem.to_string(), version);
    }

    /// Replaces the inventory of one resource kind.
    pub fn set_entities(&self, subsystem: &str, kind: ResourceKind, entities: Vec<EntityRecord>) {
        let mut inner = self.inner.lock().unwrap();
        inner.entities.insert((subsystem.to_string(), kind), entities);
    }

    /// Injects a fetch failure for one resource kind.
    pub fn fail_fetch(&self, subsystem: &str, kind: ResourceKind, error: BackendError) {
        let mut inner = self.inner.lock().unwrap();
        inner.fetch_failures.insert((subsystem.to_string(), kind), error);
    }

    pub fn clear_fetch_failure(&self, subsystem: &str, kind: ResourceKind) {
        let mut inner = self.inner.lock().unwrap();
        inner.fetch_failures.remove(&(subsystem.to_string(), kind));
    }

    /// Current stats-collection flag for a subsystem.
    pub fn stats_enabled(&self, subsystem: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.stats_disabled.contains(subsystem)
    }

    /// The recorded sequence of stats toggles.
    pub fn stats_toggles(&self) -> Vec<(String, bool)> {
        let inner = self.inner.lock().unwrap();
        inner.stats_toggles.clone()
    }

    /// A small but complete cloud: compute, network, block-storage,
    /// load-balancer and image, all up, with a handful of entities each.
    pub fn small_cloud() -> Self {
        let source = Self::new();

        source.add_service("nova", "compute");
        source.add_service("neutron", "network");
        source.add_service("cinder", "volumev3");
        source.add_alias("volumev3", "block-storage");
        source.add_service("octavia", "load-balancer");
        source.add_service("glance", "image");
        source.add_service("keystone", "identity");

        for subsystem in [
            "compute",
            "network",
            "block-storage",
            "load-balancer",
            "image",
            "identity",
        ] {
            source.allow_proxy(subsystem);
        }
        source.set_reachable("compute", &[ProbePath::Root]);
        source.set_reachable("network", &[ProbePath::Root]);
        source.set_reachable("block-storage", &[ProbePath::OneUp]);
        source.set_reachable("load-balancer", &[ProbePath::OneUp]);
        source.set_reachable("image", &[ProbePath::OneUp]);
        source.set_reachable("identity", &[ProbePath::Root]);

        source.set_version(
            "compute",
            VersionRecord {
                status: "CURRENT".to_string(),
                version: "2.1".to_string(),
                min_microversion: "2.1".to_string(),
                max_microversion: "2.90".to_string(),
            },
        );
        source.set_version(
            "network",
            VersionRecord {
                status: "CURRENT".to_string(),
                version: "2.0".to_string(),
                ..VersionRecord::default()
            },
        );

        source.set_entities(
            "compute",
            ResourceKind::Services,
            vec![
                EntityRecord::new("svc-1")
                    .with("binary", "nova-scheduler")
                    .with("host", "ctl1")
                    .with("status", "enabled")
                    .with("state", "up"),
                EntityRecord::new("svc-2")
                    .with("binary", "nova-compute")
                    .with("host", "cmp1")
                    .with("status", "enabled")
                    .with("state", "up"),
            ],
        );
        source.set_entities(
            "compute",
            ResourceKind::Aggregates,
            vec![
                EntityRecord::new("agg-1")
                    .with("name", "general")
                    .with("deleted", false)
                    .with("hosts", json!(["cmp1", "cmp2"])),
            ],
        );
        source.set_entities(
            "compute",
            ResourceKind::Hypervisors,
            vec![
                hypervisor("hv-1", "cmp1.cloud.local", 48, 16),
                hypervisor("hv-2", "cmp2.cloud.local", 48, 8),
            ],
        );

        source.set_entities(
            "network",
            ResourceKind::Agents,
            vec![
                EntityRecord::new("agent-1")
                    .with("binary", "neutron-l3-agent")
                    .with("host", "net1")
                    .with("is_admin_state_up", true)
                    .with("is_alive", true),
                EntityRecord::new("agent-2")
                    .with("binary", "neutron-dhcp-agent")
                    .with("host", "net1")
                    .with("is_admin_state_up", true)
                    .with("is_alive", false),
            ],
        );
        source.set_entities(
            "network",
            ResourceKind::FloatingIps,
            vec![
                EntityRecord::new("fip-1")
                    .with("project_id", "proj-a")
                    .with("status", "ACTIVE"),
                EntityRecord::new("fip-2")
                    .with("project_id", "proj-a")
                    .with("status", "ACTIVE"),
                EntityRecord::new("fip-3")
                    .with("project_id", "proj-b")
                    .with("status", "DOWN"),
            ],
        );
        source.set_entities(
            "network",
            ResourceKind::Routers,
            vec![
                EntityRecord::new("router-1").with("status", "ACTIVE"),
                EntityRecord::new("router-2").with("status", "ACTIVE"),
            ],
        );

        source.set_entities(
            "block-storage",
            ResourceKind::Services,
            vec![
                EntityRecord::new("svc-10")
                    .with("binary", "cinder-volume")
                    .with("host", "stor1")
                    .with("status", "enabled")
                    .with("state", "up"),
            ],
        );

        source.set_entities(
            "load-balancer",
            ResourceKind::LoadBalancers,
            vec![
                EntityRecord::new("lb-1")
                    .with("name", "web-lb")
                    .with("project_id", "proj-a")
                    .with("operating_status", "ONLINE")
                    .with("provisioning_status", "ACTIVE")
                    .with("is_admin_state_up", true)
                    .with("vip_address", "10.0.0.10")
                    .with("vip_port_id", "port-1"),
            ],
        );
        source.set_entities(
            "load-balancer",
            ResourceKind::LoadBalancerStats,
            vec![
                EntityRecord::new("lb-1-stats")
                    .with("loadbalancer_id", "lb-1")
                    .with("active_connections", 12)
                    .with("bytes_in", 1_000_000)
                    .with("bytes_out", 2_000_000)
                    .with("total_connections", 500)
                    .with("request_errors", 3),
            ],
        );
        source.set_entities(
            "load-balancer",
            ResourceKind::Listeners,
            vec![
                EntityRecord::new("listener-1")
                    .with("name", "https")
                    .with("project_id", "proj-a")
                    .with("load_balancers", json!(["lb-1"]))
                    .with("connection_limit", 10_000)
                    .with("operating_status", "ONLINE")
                    .with("provisioning_status", "ACTIVE")
                    .with("is_admin_state_up", true),
            ],
        );
        source.set_entities(
            "load-balancer",
            ResourceKind::Pools,
            vec![
                EntityRecord::new("pool-1")
                    .with("name", "web-pool")
                    .with("project_id", "proj-a")
                    .with("loadbalancers", json!(["lb-1"]))
                    .with("listeners", json!(["listener-1"]))
                    .with("operating_status", "ONLINE")
                    .with("provisioning_status", "ACTIVE")
                    .with("is_admin_state_up", true),
            ],
        );
        source.set_entities(
            "load-balancer",
            ResourceKind::PoolMembers,
            vec![
                member("member-1", "pool-1", "web-1"),
                member("member-2", "pool-1", "web-2"),
            ],
        );
        source.set_entities(
            "load-balancer",
            ResourceKind::HealthMonitors,
            vec![
                EntityRecord::new("hm-1")
                    .with("name", "web-hm")
                    .with("project_id", "proj-a")
                    .with("pools", json!(["pool-1"]))
                    .with("operating_status", "ONLINE")
                    .with("provisioning_status", "ACTIVE")
                    .with("is_admin_state_up", true),
            ],
        );
        source.set_entities(
            "load-balancer",
            ResourceKind::Amphorae,
            vec![
                EntityRecord::new("amp-1")
                    .with("loadbalancer_id", "lb-1")
                    .with("status", "ALLOCATED")
                    .with("role", "STANDALONE"),
            ],
        );

        source.set_entities(
            "identity",
            ResourceKind::Projects,
            vec![
                EntityRecord::new("proj-a").with("name", "team-alpha"),
                EntityRecord::new("proj-b").with("name", "team-beta"),
            ],
        );

        source
    }
}

fn hypervisor(id: &str, name: &str, vcpus: u64, vcpus_used: u64) -> EntityRecord {
    EntityRecord::new(id)
        .with("name", name)
        .with("state", "up")
        .with("status", "enabled")
        .with("host_ip", "192.0.2.10")
        .with("cpu_info", json!({"arch": "x86_64", "model": "EPYC"}))
        .with("vcpus", vcpus)
        .with("vcpus_used", vcpus_used)
        .with("running_vms", vcpus_used / 2)
        .with("memory_size", 262_144)
        .with("memory_used", 65_536)
        .with("memory_free", 196_608)
        .with("local_disk_size", 4096)
        .with("local_disk_used", 1024)
        .with("local_disk_free", 3072)
        .with("disk_available", 3000)
        .with("current_workload", 0)
}

fn member(id: &str, pool_id: &str, name: &str) -> EntityRecord {
    EntityRecord::new(id)
        .with("pool_id", pool_id)
        .with("name", name)
        .with("operating_status", "ONLINE")
        .with("provisioning_status", "ACTIVE")
        .with("is_admin_state_up", true)
}

fn matches_filters(record: &EntityRecord, filters: Filters<'_>) -> bool {
    filters.iter().all(|(key, value)| {
        if *key == "id" {
            record.id == *value
        } else {
            record.str_field(key) == *value
        }
    })
}

impl DataSource for MockSource {
    fn list_services(&mut self) -> Result<Vec<ServiceDescriptor>, BackendError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.services.clone())
    }

    fn normalize_service_type(&self, service_type: &str) -> String {
        let inner = self.inner.lock().unwrap();
        inner
            .aliases
            .get(service_type)
            .cloned()
            .unwrap_or_else(|| service_type.to_ascii_lowercase())
    }

    fn has_proxy(&self, subsystem: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.instantiated.contains(subsystem)
    }

    fn init_proxy(&mut self, subsystem: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.instantiable.contains(subsystem) {
            inner.instantiated.insert(subsystem.to_string());
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "could not construct proxy for {subsystem}"
            )))
        }
    }

    fn probe(&mut self, subsystem: &str, path: ProbePath) -> Result<(), BackendError> {
        let inner = self.inner.lock().unwrap();
        if !inner.instantiated.contains(subsystem) {
            return Err(BackendError::NotInitialized(subsystem.to_string()));
        }
        let reachable = inner
            .reachable
            .get(subsystem)
            .is_some_and(|paths| paths.contains(&path));
        if reachable {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "probe {path:?} against {subsystem} failed"
            )))
        }
    }

    fn version_info(&mut self, subsystem: &str) -> Result<Option<VersionRecord>, BackendError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.versions.get(subsystem).cloned())
    }

    fn list_entities(
        &mut self,
        subsystem: &str,
        kind: ResourceKind,
        filters: Filters<'_>,
    ) -> Result<Vec<EntityRecord>, BackendError> {
        let inner = self.inner.lock().unwrap();
        let key = (subsystem.to_string(), kind);
        if let Some(error) = inner.fetch_failures.get(&key) {
            return Err(error.clone());
        }
        let records = inner.entities.get(&key).cloned().unwrap_or_default();
        Ok(records
            .into_iter()
            .filter(|r| matches_filters(r, filters))
            .collect())
    }

    fn set_stats_collection(&mut self, subsystem: &str, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        if enabled {
            inner.stats_disabled.remove(subsystem);
        } else {
            inner.stats_disabled.insert(subsystem.to_string());
        }
        inner.stats_toggles.push((subsystem.to_string(), enabled));
    }
}

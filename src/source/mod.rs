//! Backend data-source abstraction.
//!
//! The `DataSource` trait is the seam between the collectors and the cloud
//! SDK. Authentication, REST transport and resource decoding live behind it;
//! the collectors only see the service catalog, liveness probes, version
//! metadata and decoded entity records. A mock implementation with scenario
//! builders lives in [`mock`].

pub mod mock;

pub use mock::MockSource;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error taxonomy for backend calls.
///
/// The split drives the retry-vs-escalate decision in the probe controller:
/// `NotInitialized` and `Unavailable` are recovered locally and retried on
/// the next cycle, `NotFound` covers entities vanishing mid-poll, and
/// `Defect` marks a programming error that should surface loudly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// No client/proxy has been instantiated for the subsystem yet.
    NotInitialized(String),
    /// Transport-level or availability failure; retried next cycle.
    Unavailable(String),
    /// The requested resource disappeared between calls.
    NotFound(String),
    /// Programming defect, not an expected backend condition.
    Defect(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotInitialized(s) => write!(f, "subsystem {s} not initialized"),
            BackendError::Unavailable(msg) => write!(f, "backend unavailable: {msg}"),
            BackendError::NotFound(msg) => write!(f, "resource not found: {msg}"),
            BackendError::Defect(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Liveness-probe target, relative to the subsystem's endpoint.
///
/// Some backends reject a bare versions query at their root path but accept
/// a parent-path probe, so collectors configure an ordered fallback list and
/// the first reachable path wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbePath {
    /// The endpoint path itself.
    Root,
    /// One level above the endpoint path.
    OneUp,
    /// Two levels above the endpoint path.
    TwoUp,
}

/// One entry of the backend service catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Deployment-chosen service name (e.g. "nova").
    pub name: String,
    /// Service type as registered in the catalog (e.g. "compute").
    pub service_type: String,
}

impl ServiceDescriptor {
    pub fn new(name: &str, service_type: &str) -> Self {
        Self {
            name: name.to_string(),
            service_type: service_type.to_string(),
        }
    }
}

/// API version metadata, obtainable independently of liveness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub status: String,
    pub version: String,
    pub min_microversion: String,
    pub max_microversion: String,
}

/// Resource kinds the collectors enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Micro-service daemons of a subsystem (schedulers, workers, ...).
    Services,
    /// Network agent daemons.
    Agents,
    Hypervisors,
    Aggregates,
    FloatingIps,
    Routers,
    LoadBalancers,
    /// Traffic statistics of one load balancer (filter: `loadbalancer_id`).
    LoadBalancerStats,
    Listeners,
    Pools,
    /// Members of one pool (filter: `pool_id`).
    PoolMembers,
    HealthMonitors,
    Amphorae,
    /// Identity projects (filter: `id`).
    Projects,
}

/// One decoded backend entity: a stable identifier plus a field bag in the
/// shape the SDK decodes from the REST payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl EntityRecord {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter, used heavily by mock scenarios.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// String field, empty if absent or not a string.
    pub fn str_field(&self, key: &str) -> &str {
        self.fields.get(key).and_then(Value::as_str).unwrap_or("")
    }

    /// Numeric field, zero if absent.
    pub fn f64_field(&self, key: &str) -> f64 {
        self.fields.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    /// Boolean field, false if absent.
    pub fn bool_field(&self, key: &str) -> bool {
        self.fields.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// List-of-strings field, empty if absent.
    pub fn list_field(&self, key: &str) -> Vec<String> {
        self.fields
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Equality filters applied server-side to an entity listing.
pub type Filters<'a> = &'a [(&'a str, &'a str)];

/// Backend access as the collectors consume it.
///
/// All calls may fail with a [`BackendError`]; a failed `list_entities` must
/// never be treated as an empty inventory by callers.
pub trait DataSource: Send {
    /// Returns the service catalog discovered from the backend.
    fn list_services(&mut self) -> Result<Vec<ServiceDescriptor>, BackendError>;

    /// Normalizes a catalog service type to its canonical name
    /// (e.g. `volumev3` -> `block-storage`).
    fn normalize_service_type(&self, service_type: &str) -> String {
        service_type.to_ascii_lowercase()
    }

    /// Whether a working client/proxy exists for the subsystem.
    fn has_proxy(&self, subsystem: &str) -> bool;

    /// Instantiates a client/proxy for the subsystem.
    fn init_proxy(&mut self, subsystem: &str) -> Result<(), BackendError>;

    /// Issues a lightweight read against one probe path.
    fn probe(&mut self, subsystem: &str, path: ProbePath) -> Result<(), BackendError>;

    /// Current API version metadata; `Ok(None)` when the backend publishes
    /// none for this subsystem.
    fn version_info(&mut self, subsystem: &str) -> Result<Option<VersionRecord>, BackendError>;

    /// Lists the current entities of one resource kind.
    fn list_entities(
        &mut self,
        subsystem: &str,
        kind: ResourceKind,
        filters: Filters<'_>,
    ) -> Result<Vec<EntityRecord>, BackendError>;

    /// Toggles the backend client's own call instrumentation, so probe and
    /// statistics traffic does not pollute data-plane self-metrics.
    fn set_stats_collection(&mut self, subsystem: &str, enabled: bool);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_record_field_accessors() {
        let record = EntityRecord::new("uuid-1")
            .with("name", "web-1")
            .with("vcpus", 8)
            .with("deleted", false)
            .with("load_balancers", json!(["lb-a", "lb-b"]));

        assert_eq!(record.str_field("name"), "web-1");
        assert_eq!(record.f64_field("vcpus"), 8.0);
        assert!(!record.bool_field("deleted"));
        assert_eq!(record.list_field("load_balancers"), vec!["lb-a", "lb-b"]);
        assert_eq!(record.str_field("missing"), "");
        assert_eq!(record.f64_field("missing"), 0.0);
    }

    #[test]
    fn test_backend_error_display() {
        let e = BackendError::Unavailable("connection refused".to_string());
        assert_eq!(e.to_string(), "backend unavailable: connection refused");
    }
}

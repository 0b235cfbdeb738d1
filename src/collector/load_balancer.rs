//! Load balancer subsystem collector: load balancers with traffic counters,
//! listeners, pools, pool members, health monitors and amphorae.
//!
//! The backend exposes traffic totals as absolute values per load balancer;
//! they are re-exported as proper counters by diffing against the previous
//! poll with [`CounterTracker`].

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::collector::reconcile::{CounterTracker, SeriesSet, tuple};
use crate::collector::ApiSpecifics;
use crate::metrics::{MetricSink, label_refs};
use crate::source::{BackendError, DataSource, EntityRecord, ResourceKind};

const OPERATING_STATUSES: &[&str] =
    &["ONLINE", "DRAINING", "OFFLINE", "DEGRADED", "ERROR", "NO_MONITOR"];
const PROVISIONING_STATUSES: &[&str] = &[
    "ACTIVE",
    "DELETED",
    "ERROR",
    "PENDING_CREATE",
    "PENDING_UPDATE",
    "PENDING_DELETE",
];
const ADMIN_STATUSES: &[&str] = &["enabled", "disabled"];
const AMPHORA_STATUSES: &[&str] = &[
    "BOOTING",
    "ALLOCATED",
    "READY",
    "PENDING_CREATE",
    "PENDING_DELETE",
    "DELETED",
    "ERROR",
];
const AMPHORA_ROLES: &[&str] = &["STANDALONE", "MASTER", "BACKUP"];

/// Counter metric suffix and the statistics attribute it accumulates.
const LB_COUNTERS: &[(&str, &str)] = &[
    ("lb_in_bytes", "bytes_in"),
    ("lb_out_bytes", "bytes_out"),
    ("lb_connections", "total_connections"),
    ("lb_request_errors", "request_errors"),
];

pub(super) struct LoadBalancerSpecifics {
    subsystem: String,
    prefix: String,
    lbs: SeriesSet,
    listeners: SeriesSet,
    pools: SeriesSet,
    /// Member series per pool id, so a vanished pool cascades.
    members: HashMap<String, SeriesSet>,
    health_monitors: SeriesSet,
    amphorae: SeriesSet,
    /// Counter baselines keyed by metric name.
    counters: HashMap<String, CounterTracker>,
    /// Project id to name, resolved once via the identity subsystem.
    project_names: HashMap<String, String>,
    /// Load balancer id to project id, rebuilt every cycle for amphorae.
    lb_projects: HashMap<String, String>,
    /// Pool id to its (loadbalancers, listeners) label joins, for health
    /// monitors which only reference pools.
    pool_joins: HashMap<String, (String, String)>,
}

impl LoadBalancerSpecifics {
    pub(super) fn new(subsystem: &str, prefix: &str) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            prefix: prefix.to_string(),
            lbs: SeriesSet::new(),
            listeners: SeriesSet::new(),
            pools: SeriesSet::new(),
            members: HashMap::new(),
            health_monitors: SeriesSet::new(),
            amphorae: SeriesSet::new(),
            counters: HashMap::new(),
            project_names: HashMap::new(),
            lb_projects: HashMap::new(),
            pool_joins: HashMap::new(),
        }
    }

    fn m(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.prefix)
    }

    fn project_name(&mut self, source: &mut dyn DataSource, project_id: &str) -> String {
        if project_id.is_empty() {
            return "none".to_string();
        }
        if let Some(name) = self.project_names.get(project_id) {
            return name.clone();
        }
        // Lookup traffic should not show up in identity self-metrics.
        source.set_stats_collection("identity", false);
        let result =
            source.list_entities("identity", ResourceKind::Projects, &[("id", project_id)]);
        source.set_stats_collection("identity", true);
        let name = match result {
            Ok(projects) => match projects.first() {
                Some(project) => project.str_field("name").to_string(),
                None => "none".to_string(),
            },
            Err(e) => {
                debug!(project_id, error = %e, "could not resolve project name");
                "none".to_string()
            }
        };
        self.project_names.insert(project_id.to_string(), name.clone());
        name
    }

    fn fetch_stats(&self, source: &mut dyn DataSource, lb_id: &str) -> Option<EntityRecord> {
        source.set_stats_collection(&self.subsystem, false);
        let result = source.list_entities(
            &self.subsystem,
            ResourceKind::LoadBalancerStats,
            &[("loadbalancer_id", lb_id)],
        );
        source.set_stats_collection(&self.subsystem, true);
        match result {
            Ok(mut records) if !records.is_empty() => Some(records.swap_remove(0)),
            Ok(_) => None,
            Err(e) => {
                // The balancer can disappear between the listing and the
                // statistics fetch.
                debug!(lb_id, error = %e, "statistics unavailable, skipping");
                None
            }
        }
    }

    fn collect_load_balancers(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<(), BackendError> {
        let records =
            source.list_entities(&self.subsystem, ResourceKind::LoadBalancers, &[])?;
        self.lb_projects.clear();
        let mut current = HashSet::new();
        for lb in &records {
            let project_id = lb.str_field("project_id").to_string();
            let t = tuple(&[&lb.id, lb.str_field("name"), &project_id]);
            current.insert(t.clone());
            self.lb_projects.insert(lb.id.clone(), project_id.clone());

            let project_name = self.project_name(source, &project_id);
            let Some(stats) = self.fetch_stats(source, &lb.id) else {
                continue;
            };

            let refs = label_refs(&t);
            sink.set(
                &self.m("lb_active_connections"),
                &refs,
                stats.f64_field("active_connections"),
            );
            for (suffix, attribute) in LB_COUNTERS {
                let metric = self.m(suffix);
                let delta = self
                    .counters
                    .get_mut(&metric)
                    .map(|tracker| tracker.observe(&t, stats.f64_field(attribute)))
                    .unwrap_or(0.0);
                sink.inc(&metric, &refs, delta);
            }
            sink.set_state(
                &self.m("lb_operating_status"),
                &refs,
                lb.str_field("operating_status"),
            );
            sink.set_state(
                &self.m("lb_provisioning_status"),
                &refs,
                lb.str_field("provisioning_status"),
            );
            sink.set_state(
                &self.m("lb_admin_status"),
                &refs,
                admin_state(lb.bool_field("is_admin_state_up")),
            );
            sink.set_info(
                &self.m("lb"),
                &[&lb.id],
                &[
                    ("name", lb.str_field("name").to_string()),
                    ("project_id", project_id),
                    ("project_name", project_name),
                    ("vip_address", lb.str_field("vip_address").to_string()),
                    ("vip_port_id", lb.str_field("vip_port_id").to_string()),
                ],
            );
        }

        for removed in self.lbs.reconcile(current) {
            debug!(labels = ?removed, "removing vanished load balancer");
            let refs = label_refs(&removed);
            for suffix in [
                "lb_active_connections",
                "lb_operating_status",
                "lb_provisioning_status",
                "lb_admin_status",
            ] {
                sink.remove_series(&self.m(suffix), &refs);
            }
            for (suffix, _) in LB_COUNTERS {
                let metric = self.m(suffix);
                sink.remove_series(&metric, &refs);
                if let Some(tracker) = self.counters.get_mut(&metric) {
                    tracker.forget(&removed);
                }
            }
            // The info record is keyed by id only.
            sink.remove_series(&self.m("lb"), &refs[..1]);
        }
        Ok(())
    }

    fn collect_listeners(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<(), BackendError> {
        let records = source.list_entities(&self.subsystem, ResourceKind::Listeners, &[])?;
        let mut current = HashSet::new();
        for listener in &records {
            let lbs = listener.list_field("load_balancers").join(",");
            let t = tuple(&[
                &listener.id,
                listener.str_field("name"),
                listener.str_field("project_id"),
                &lbs,
            ]);
            let refs = label_refs(&t);
            sink.set(
                &self.m("listener_connection_limit"),
                &refs,
                listener.f64_field("connection_limit"),
            );
            set_status_states(sink, &self.m("listener"), &refs, listener);
            current.insert(t);
        }
        for removed in self.listeners.reconcile(current) {
            debug!(labels = ?removed, "removing vanished listener");
            let refs = label_refs(&removed);
            sink.remove_series(&self.m("listener_connection_limit"), &refs);
            remove_status_states(sink, &self.m("listener"), &refs);
        }
        Ok(())
    }

    fn collect_pools(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<(), BackendError> {
        let records = source.list_entities(&self.subsystem, ResourceKind::Pools, &[])?;
        self.pool_joins.clear();
        let mut current = HashSet::new();
        for pool in &records {
            let lbs = pool.list_field("loadbalancers").join(",");
            let listeners = pool.list_field("listeners").join(",");
            let t = tuple(&[
                &pool.id,
                pool.str_field("name"),
                pool.str_field("project_id"),
                &lbs,
                &listeners,
            ]);
            set_status_states(sink, &self.m("pool"), &label_refs(&t), pool);
            current.insert(t);
            self.pool_joins
                .insert(pool.id.clone(), (lbs.clone(), listeners.clone()));

            self.collect_members(source, sink, pool, &lbs, &listeners)?;
        }
        for removed in self.pools.reconcile(current) {
            debug!(labels = ?removed, "removing vanished pool");
            remove_status_states(sink, &self.m("pool"), &label_refs(&removed));
            let pool_id = &removed[0];
            if let Some(members) = self.members.remove(pool_id) {
                for member in members.tuples() {
                    remove_status_states(sink, &self.m("pool_member"), &label_refs(member));
                }
            }
        }
        Ok(())
    }

    fn collect_members(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
        pool: &EntityRecord,
        lbs: &str,
        listeners: &str,
    ) -> Result<(), BackendError> {
        source.set_stats_collection(&self.subsystem, false);
        let result = source.list_entities(
            &self.subsystem,
            ResourceKind::PoolMembers,
            &[("pool_id", &pool.id)],
        );
        source.set_stats_collection(&self.subsystem, true);
        let records = match result {
            Ok(records) => records,
            Err(BackendError::NotFound(_)) => {
                // Pool deleted between the pool listing and the member fetch;
                // its series go away with the pool on the next cycle.
                debug!(pool_id = %pool.id, "pool vanished before member fetch");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut current = HashSet::new();
        for member in &records {
            let t = tuple(&[
                &member.id,
                member.str_field("name"),
                pool.str_field("project_id"),
                lbs,
                listeners,
                &pool.id,
            ]);
            set_status_states(sink, &self.m("pool_member"), &label_refs(&t), member);
            current.insert(t);
        }
        let remembered = self.members.entry(pool.id.clone()).or_default();
        for removed in remembered.reconcile(current) {
            debug!(labels = ?removed, "removing vanished pool member");
            remove_status_states(sink, &self.m("pool_member"), &label_refs(&removed));
        }
        Ok(())
    }

    fn collect_health_monitors(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<(), BackendError> {
        let records =
            source.list_entities(&self.subsystem, ResourceKind::HealthMonitors, &[])?;
        let mut current = HashSet::new();
        for monitor in &records {
            let pool_ids = monitor.list_field("pools");
            let mut lbs = Vec::new();
            let mut listeners = Vec::new();
            for pool_id in &pool_ids {
                if let Some((pool_lbs, pool_listeners)) = self.pool_joins.get(pool_id) {
                    lbs.push(pool_lbs.clone());
                    listeners.push(pool_listeners.clone());
                }
            }
            let t = tuple(&[
                &monitor.id,
                monitor.str_field("name"),
                monitor.str_field("project_id"),
                &lbs.join(","),
                &listeners.join(","),
                &pool_ids.join(","),
            ]);
            set_status_states(sink, &self.m("health_monitor"), &label_refs(&t), monitor);
            current.insert(t);
        }
        for removed in self.health_monitors.reconcile(current) {
            debug!(labels = ?removed, "removing vanished health monitor");
            remove_status_states(sink, &self.m("health_monitor"), &label_refs(&removed));
        }
        Ok(())
    }

    fn collect_amphorae(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<(), BackendError> {
        let records = source.list_entities(&self.subsystem, ResourceKind::Amphorae, &[])?;
        let mut current = HashSet::new();
        for amphora in &records {
            let lb_id = amphora.str_field("loadbalancer_id");
            let project_id = self
                .lb_projects
                .get(lb_id)
                .cloned()
                .unwrap_or_else(|| "none".to_string());
            let t = tuple(&[&amphora.id, lb_id, &project_id]);
            let refs = label_refs(&t);
            sink.set_state(&self.m("amphora_status"), &refs, amphora.str_field("status"));
            let role = amphora.str_field("role");
            if !role.is_empty() {
                sink.set_state(&self.m("amphora_role"), &refs, role);
            }
            current.insert(t);
        }
        for removed in self.amphorae.reconcile(current) {
            debug!(labels = ?removed, "removing vanished amphora");
            let refs = label_refs(&removed);
            sink.remove_series(&self.m("amphora_status"), &refs);
            sink.remove_series(&self.m("amphora_role"), &refs);
        }
        Ok(())
    }
}

impl ApiSpecifics for LoadBalancerSpecifics {
    fn define_metrics(&mut self, sink: &mut dyn MetricSink) {
        let lb_labels = &["id", "name", "project_id"];
        sink.define_info(
            &self.m("lb"),
            "",
            &["id"],
            &["name", "project_id", "project_name", "vip_address", "vip_port_id"],
        );
        sink.define_gauge(&self.m("lb_active_connections"), "", lb_labels);
        for (suffix, _) in LB_COUNTERS {
            let metric = self.m(suffix);
            sink.define_counter(&metric, "", lb_labels);
            self.counters.insert(metric, CounterTracker::new());
        }
        define_status_enums(sink, &self.m("lb"), lb_labels);

        let listener_labels = &["id", "name", "project_id", "loadbalancers"];
        sink.define_gauge(&self.m("listener_connection_limit"), "", listener_labels);
        define_status_enums(sink, &self.m("listener"), listener_labels);

        let pool_labels = &["id", "name", "project_id", "loadbalancers", "listeners"];
        define_status_enums(sink, &self.m("pool"), pool_labels);

        let member_labels =
            &["id", "name", "project_id", "loadbalancers", "listeners", "pool_id"];
        define_status_enums(sink, &self.m("pool_member"), member_labels);

        let monitor_labels =
            &["id", "name", "project_id", "loadbalancers", "listeners", "pools"];
        define_status_enums(sink, &self.m("health_monitor"), monitor_labels);

        let amphora_labels = &["id", "loadbalancer_id", "project_id"];
        sink.define_enum(&self.m("amphora_status"), "", amphora_labels, AMPHORA_STATUSES);
        sink.define_enum(&self.m("amphora_role"), "", amphora_labels, AMPHORA_ROLES);
    }

    fn collect(
        &mut self,
        source: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<(), BackendError> {
        self.collect_load_balancers(source, sink)?;
        self.collect_listeners(source, sink)?;
        self.collect_pools(source, sink)?;
        self.collect_health_monitors(source, sink)?;
        self.collect_amphorae(source, sink)?;
        Ok(())
    }
}

fn admin_state(up: bool) -> &'static str {
    if up { "enabled" } else { "disabled" }
}

/// Every balancer object carries the same status triple.
fn define_status_enums(sink: &mut dyn MetricSink, base: &str, labels: &[&str]) {
    sink.define_enum(&format!("{base}_operating_status"), "", labels, OPERATING_STATUSES);
    sink.define_enum(
        &format!("{base}_provisioning_status"),
        "",
        labels,
        PROVISIONING_STATUSES,
    );
    sink.define_enum(&format!("{base}_admin_status"), "", labels, ADMIN_STATUSES);
}

fn set_status_states(
    sink: &mut dyn MetricSink,
    base: &str,
    labels: &[&str],
    record: &EntityRecord,
) {
    sink.set_state(
        &format!("{base}_operating_status"),
        labels,
        record.str_field("operating_status"),
    );
    sink.set_state(
        &format!("{base}_provisioning_status"),
        labels,
        record.str_field("provisioning_status"),
    );
    sink.set_state(
        &format!("{base}_admin_status"),
        labels,
        admin_state(record.bool_field("is_admin_state_up")),
    );
}

fn remove_status_states(sink: &mut dyn MetricSink, base: &str, labels: &[&str]) {
    sink.remove_series(&format!("{base}_operating_status"), labels);
    sink.remove_series(&format!("{base}_provisioning_status"), labels);
    sink.remove_series(&format!("{base}_admin_status"), labels);
}

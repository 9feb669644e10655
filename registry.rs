// ============================================================================
// AGENT REGISTRY & METRIC CATALOG
// ============================================================================
// Directory of known instrumenters and aggregators, keyed by hostname, and
// the merged catalog of every metric any instrumenter has announced.
// Records are never removed; a second online notice from the same host is a
// restart.
// ============================================================================

use std::collections::BTreeMap;

use ahash::AHashMap;
use tracing::{debug, info};

use crate::error::{RequestError, RequestResult};
use crate::message::{
    AgentInfo, AggregatorStatus, InstrumenterStatus, ModuleInfo, StatInfo, StatusReport,
};
use crate::types::{AgentKind, Timestamp};

/// module → stats → fields
pub type Catalog = BTreeMap<String, ModuleInfo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineOutcome {
    Started,
    Restarted,
}

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InstrumenterRecord {
    pub hostname: String,
    pub routing_key: String,
    pub agent: AgentInfo,
    pub nmetrics_avail: usize,
    /// Active instrumentations on this host
    pub ninsts: usize,
    pub last_online: Timestamp,
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct AggregatorRecord {
    pub hostname: String,
    pub routing_key: String,
    pub agent: AgentInfo,
    /// Instrumentations assigned to this aggregator
    pub ninsts: usize,
    pub last_online: Timestamp,
    seq: u64,
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Registry {
    instrumenters: AHashMap<String, InstrumenterRecord>,
    aggregators: AHashMap<String, AggregatorRecord>,
    catalog: Catalog,
    /// First-seen order shared by both agent kinds
    next_seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Record an instrumenter coming online and merge its metrics into the
    /// catalog. A restart resets the host's active count.
    pub fn on_instrumenter_online(
        &mut self,
        hostname: &str,
        routing_key: &str,
        agent: AgentInfo,
        modules: &BTreeMap<String, ModuleInfo>,
        now: Timestamp,
    ) -> OnlineOutcome {
        let nmetrics_avail = modules.values().map(|m| m.stats.len()).sum();
        self.merge_catalog(modules);

        if let Some(record) = self.instrumenters.get_mut(hostname) {
            info!(
                target: "fleetstat::registry",
                hostname = %hostname,
                previous_insts = record.ninsts,
                "Instrumenter restarted"
            );
            record.routing_key = routing_key.to_string();
            record.agent = agent;
            record.nmetrics_avail = nmetrics_avail;
            record.ninsts = 0;
            record.last_online = now;
            return OnlineOutcome::Restarted;
        }

        let seq = self.next_seq();
        self.instrumenters.insert(
            hostname.to_string(),
            InstrumenterRecord {
                hostname: hostname.to_string(),
                routing_key: routing_key.to_string(),
                agent,
                nmetrics_avail,
                ninsts: 0,
                last_online: now,
                seq,
            },
        );
        info!(
            target: "fleetstat::registry",
            hostname = %hostname,
            metrics = nmetrics_avail,
            "Instrumenter started"
        );
        OnlineOutcome::Started
    }

    pub fn on_aggregator_online(
        &mut self,
        hostname: &str,
        routing_key: &str,
        agent: AgentInfo,
        now: Timestamp,
    ) -> OnlineOutcome {
        if let Some(record) = self.aggregators.get_mut(hostname) {
            info!(
                target: "fleetstat::registry",
                hostname = %hostname,
                previous_insts = record.ninsts,
                "Aggregator restarted"
            );
            record.routing_key = routing_key.to_string();
            record.agent = agent;
            record.ninsts = 0;
            record.last_online = now;
            return OnlineOutcome::Restarted;
        }

        let seq = self.next_seq();
        self.aggregators.insert(
            hostname.to_string(),
            AggregatorRecord {
                hostname: hostname.to_string(),
                routing_key: routing_key.to_string(),
                agent,
                ninsts: 0,
                last_online: now,
                seq,
            },
        );
        info!(target: "fleetstat::registry", hostname = %hostname, "Aggregator started");
        OnlineOutcome::Started
    }

    /// First write wins at every level: module, stat, field.
    fn merge_catalog(&mut self, modules: &BTreeMap<String, ModuleInfo>) {
        for (module_name, module) in modules {
            let entry = self
                .catalog
                .entry(module_name.clone())
                .or_insert_with(|| ModuleInfo {
                    label: module.label.clone(),
                    stats: BTreeMap::new(),
                });

            for (stat_name, stat) in &module.stats {
                let stat_entry = entry
                    .stats
                    .entry(stat_name.clone())
                    .or_insert_with(|| StatInfo {
                        label: stat.label.clone(),
                        unit: stat.unit.clone(),
                        fields: BTreeMap::new(),
                    });

                for (field_name, field) in &stat.fields {
                    if !stat_entry.fields.contains_key(field_name) {
                        debug!(
                            target: "fleetstat::registry",
                            module = %module_name,
                            stat = %stat_name,
                            field = %field_name,
                            "Catalog field added"
                        );
                        stat_entry.fields.insert(field_name.clone(), field.clone());
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    /// Aggregator with the fewest active instrumentations, ties broken by
    /// first-seen order
    pub fn select_aggregator(&self) -> RequestResult<&AggregatorRecord> {
        self.aggregators
            .values()
            .min_by_key(|a| (a.ninsts, a.seq))
            .ok_or(RequestError::NoAggregators)
    }

    /// Instrumenters in first-seen order
    pub fn instrumenters(&self) -> Vec<&InstrumenterRecord> {
        let mut all: Vec<_> = self.instrumenters.values().collect();
        all.sort_by_key(|r| r.seq);
        all
    }

    /// Aggregators in first-seen order
    pub fn aggregators(&self) -> Vec<&AggregatorRecord> {
        let mut all: Vec<_> = self.aggregators.values().collect();
        all.sort_by_key(|r| r.seq);
        all
    }

    pub fn instrumenter(&self, hostname: &str) -> Option<&InstrumenterRecord> {
        self.instrumenters.get(hostname)
    }

    pub fn aggregator(&self, hostname: &str) -> Option<&AggregatorRecord> {
        self.aggregators.get(hostname)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn stat_info(&self, module: &str, stat: &str) -> Option<&StatInfo> {
        self.catalog.get(module).and_then(|m| m.stats.get(stat))
    }

    pub fn instrumenter_count(&self) -> usize {
        self.instrumenters.len()
    }

    pub fn aggregator_count(&self) -> usize {
        self.aggregators.len()
    }

    // ------------------------------------------------------------------------
    // Load counters
    // ------------------------------------------------------------------------

    pub fn acquire_instrumenter(&mut self, hostname: &str) {
        if let Some(r) = self.instrumenters.get_mut(hostname) {
            r.ninsts += 1;
        }
    }

    pub fn release_instrumenter(&mut self, hostname: &str) {
        if let Some(r) = self.instrumenters.get_mut(hostname) {
            r.ninsts = r.ninsts.saturating_sub(1);
        }
    }

    pub fn acquire_aggregator(&mut self, hostname: &str) {
        if let Some(r) = self.aggregators.get_mut(hostname) {
            r.ninsts += 1;
        }
    }

    pub fn release_aggregator(&mut self, hostname: &str) {
        if let Some(r) = self.aggregators.get_mut(hostname) {
            r.ninsts = r.ninsts.saturating_sub(1);
        }
    }

    pub fn status_report(&self, ninstrumentations: usize) -> StatusReport {
        StatusReport {
            component: AgentKind::Coordinator.to_string(),
            ninstrumentations,
            instrumenters: self
                .instrumenters()
                .into_iter()
                .map(|r| InstrumenterStatus {
                    hostname: r.hostname.clone(),
                    nmetrics_avail: r.nmetrics_avail,
                    ninsts: r.ninsts,
                })
                .collect(),
            aggregators: self
                .aggregators()
                .into_iter()
                .map(|r| AggregatorStatus {
                    hostname: r.hostname.clone(),
                    ninsts: r.ninsts,
                })
                .collect(),
        }
    }
}

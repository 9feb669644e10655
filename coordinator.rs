// ============================================================================
// COORDINATOR PROTOCOL ENGINE
// ============================================================================
// Owns every instrumentation and drives its lifecycle:
//
//   create ──► Creating ──(all acks enabled)──► Enabled
//                  │
//                  └──(any failure / deadline)──► Failed (compensated)
//
//   delete removes the record from any state.
//
// The engine is a plain struct mutated through `&mut self`; the service task
// feeds it one event at a time.
// ============================================================================

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{MetricError, RequestError, RequestResult};
use crate::message::{AckStatus, Envelope, Message, StatusReport};
use crate::metric::{validate_request, FieldArity, Predicate};
use crate::registry::{Catalog, OnlineOutcome, Registry};
use crate::transport::Publisher;
use crate::types::{InstId, InstIdAllocator, Timestamp};
use crate::{routing_key, COORDINATOR_KEY_SUFFIX};

// ----------------------------------------------------------------------------
// Request Types
// ----------------------------------------------------------------------------

/// What the request layer asks for
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstrumentationSpec {
    pub module: String,
    pub stat: String,
    #[serde(default)]
    pub predicate: Predicate,
    #[serde(default)]
    pub decomposition: Vec<String>,
    /// Accepted and carried; not used for addressing
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl InstrumentationSpec {
    pub fn new(module: impl Into<String>, stat: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            stat: stat.into(),
            ..Default::default()
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_decomposition(mut self, fields: &[&str]) -> Self {
        self.decomposition = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// One-shot reply slot of a pending create. Consumed on use.
#[derive(Debug)]
pub struct Responder(oneshot::Sender<RequestResult<InstId>>);

impl Responder {
    pub fn new() -> (Self, oneshot::Receiver<RequestResult<InstId>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn respond(self, result: RequestResult<InstId>) {
        if self.0.send(result).is_err() {
            debug!(target: "fleetstat::coordinator", "Requester went away before the reply");
        }
    }
}

// ----------------------------------------------------------------------------
// Instrumentation Records
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentationState {
    Creating,
    Enabled,
    Failed,
}

/// What one participant has told us about an instrumentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    Unknown,
    Enabled,
    Failed,
    TimedOut,
}

impl AckState {
    fn is_failure(self) -> bool {
        matches!(self, AckState::Failed | AckState::TimedOut)
    }
}

#[derive(Debug)]
struct Instrumentation {
    id: InstId,
    spec: InstrumentationSpec,
    stream_key: String,
    aggregator: String,
    aggregator_ack: AckState,
    /// Addressed instrumenters by hostname
    instrumenter_acks: BTreeMap<String, AckState>,
    state: InstrumentationState,
    deadline: Instant,
    responder: Option<Responder>,
    /// Load counters already given back
    released: bool,
    created_at: Timestamp,
}

impl Instrumentation {
    fn waiting(&self) -> bool {
        self.aggregator_ack == AckState::Unknown
            || self.instrumenter_acks.values().any(|a| *a == AckState::Unknown)
    }
}

/// Shape of the values an instrumentation produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatType {
    pub dimension: usize,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Listing entry for one instrumentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationSummary {
    pub inst_id: InstId,
    pub module: String,
    pub stat: String,
    pub predicate: Predicate,
    pub decomposition: Vec<String>,
    pub nodes: Vec<String>,
    pub state: InstrumentationState,
    pub stat_type: StatType,
    pub stream_key: String,
    pub aggregator: String,
    pub created_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Coordinator
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Coordinator {
    key_base: String,
    ack_timeout: Duration,
    registry: Registry,
    instrumentations: BTreeMap<InstId, Instrumentation>,
    ids: InstIdAllocator,
    publisher: Publisher,
}

impl Coordinator {
    pub fn new(config: &CoordinatorConfig, publisher: Publisher) -> Self {
        Self {
            key_base: config.key_base.clone(),
            ack_timeout: config.ack_timeout,
            registry: Registry::new(),
            instrumentations: BTreeMap::new(),
            ids: InstIdAllocator::new(),
            publisher,
        }
    }

    /// Well-known key agents send to
    pub fn routing_key(&self) -> String {
        routing_key(&self.key_base, COORDINATOR_KEY_SUFFIX)
    }

    /// Key an instrumentation's per-host values flow on
    pub fn stream_key(&self, id: InstId) -> String {
        format!("{}.instrumentation.{}", self.key_base, id)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state_of(&self, id: InstId) -> Option<InstrumentationState> {
        self.instrumentations.get(&id).map(|i| i.state)
    }

    pub fn len(&self) -> usize {
        self.instrumentations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrumentations.is_empty()
    }

    /// Earliest deadline among pending creations
    pub fn next_deadline(&self) -> Option<Instant> {
        self.instrumentations
            .values()
            .filter(|i| i.state == InstrumentationState::Creating)
            .map(|i| i.deadline)
            .min()
    }

    fn send(&self, key: &str, message: Message) {
        let kind = message.kind();
        if let Err(e) = self.publisher.send(key, message) {
            warn!(
                target: "fleetstat::coordinator",
                key = %key,
                kind,
                error = %e,
                "Failed to publish"
            );
        }
    }

    // ------------------------------------------------------------------------
    // Request layer operations
    // ------------------------------------------------------------------------

    fn validate(&self, spec: &InstrumentationSpec) -> RequestResult<()> {
        if spec.module.trim().is_empty() {
            return Err(RequestError::validation("module is required"));
        }
        if spec.stat.trim().is_empty() {
            return Err(RequestError::validation("stat is required"));
        }

        let stat = self
            .registry
            .stat_info(&spec.module, &spec.stat)
            .ok_or_else(|| MetricError::UnknownMetric {
                module: spec.module.clone(),
                stat: spec.stat.clone(),
            })?;

        validate_request(
            &spec.module,
            &spec.stat,
            &spec.predicate,
            &spec.decomposition,
            |f| stat.fields.get(f).map(|info| info.arity),
        )?;
        Ok(())
    }

    /// Start creating an instrumentation. The reply arrives through
    /// `responder` once every participant has acked, or immediately on a
    /// validation or placement failure.
    pub fn create_instrumentation(
        &mut self,
        spec: InstrumentationSpec,
        responder: Responder,
        now: Instant,
    ) {
        if let Err(e) = self.validate(&spec) {
            info!(
                target: "fleetstat::coordinator",
                module = %spec.module,
                stat = %spec.stat,
                error = %e,
                "Rejected instrumentation"
            );
            responder.respond(Err(e));
            return;
        }

        let (aggregator, aggregator_key) = match self.registry.select_aggregator() {
            Ok(agg) => (agg.hostname.clone(), agg.routing_key.clone()),
            Err(e) => {
                warn!(target: "fleetstat::coordinator", "No aggregators available");
                responder.respond(Err(e));
                return;
            }
        };

        let id = self.ids.allocate();
        let stream_key = self.stream_key(id);

        self.send(
            &aggregator_key,
            Message::EnableAggregation {
                inst_id: id,
                key: stream_key.clone(),
            },
        );
        self.registry.acquire_aggregator(&aggregator);

        let targets: Vec<(String, String)> = self
            .registry
            .instrumenters()
            .into_iter()
            .map(|r| (r.hostname.clone(), r.routing_key.clone()))
            .collect();

        let mut instrumenter_acks = BTreeMap::new();
        for (hostname, key) in targets {
            self.send(&key, enable_message(id, &stream_key, &spec));
            self.registry.acquire_instrumenter(&hostname);
            instrumenter_acks.insert(hostname, AckState::Unknown);
        }

        info!(
            target: "fleetstat::coordinator",
            inst_id = %id,
            module = %spec.module,
            stat = %spec.stat,
            aggregator = %aggregator,
            instrumenters = instrumenter_acks.len(),
            "Creating instrumentation"
        );

        self.instrumentations.insert(
            id,
            Instrumentation {
                id,
                spec,
                stream_key,
                aggregator,
                aggregator_ack: AckState::Unknown,
                instrumenter_acks,
                state: InstrumentationState::Creating,
                deadline: now + self.ack_timeout,
                responder: Some(responder),
                released: false,
                created_at: Timestamp::now(),
            },
        );
    }

    /// Remove an instrumentation and disable it everywhere. A pending create
    /// is cancelled first.
    pub fn delete_instrumentation(&mut self, id: InstId) -> RequestResult<()> {
        let Some(mut inst) = self.instrumentations.remove(&id) else {
            return Err(RequestError::NotFound { id });
        };

        if let Some(responder) = inst.responder.take() {
            info!(target: "fleetstat::coordinator", inst_id = %id, "Cancelling pending create");
            responder.respond(Err(RequestError::Cancelled { id }));
        }

        if !inst.released {
            if !inst.aggregator_ack.is_failure() {
                self.registry.release_aggregator(&inst.aggregator);
            }
            for (hostname, ack) in &inst.instrumenter_acks {
                if !ack.is_failure() {
                    self.registry.release_instrumenter(hostname);
                }
            }
        }

        let keys: Vec<String> = self
            .registry
            .instrumenters()
            .into_iter()
            .map(|r| r.routing_key.clone())
            .collect();
        for key in keys {
            self.send(&key, Message::DisableInstrumentation { inst_id: id });
        }
        if let Some(agg) = self.registry.aggregator(&inst.aggregator) {
            let key = agg.routing_key.clone();
            self.send(&key, Message::DisableAggregation { inst_id: id });
        }

        info!(
            target: "fleetstat::coordinator",
            inst_id = %id,
            state = ?inst.state,
            "Deleted instrumentation"
        );
        Ok(())
    }

    pub fn list_metrics(&self) -> Catalog {
        self.registry.catalog().clone()
    }

    pub fn list_instrumentations(&self) -> Vec<InstrumentationSummary> {
        self.instrumentations
            .values()
            .map(|inst| InstrumentationSummary {
                inst_id: inst.id,
                module: inst.spec.module.clone(),
                stat: inst.spec.stat.clone(),
                predicate: inst.spec.predicate.clone(),
                decomposition: inst.spec.decomposition.clone(),
                nodes: inst.spec.nodes.clone(),
                state: inst.state,
                stat_type: self.stat_type(&inst.spec),
                stream_key: inst.stream_key.clone(),
                aggregator: inst.aggregator.clone(),
                created_at: inst.created_at,
            })
            .collect()
    }

    fn stat_type(&self, spec: &InstrumentationSpec) -> StatType {
        let stat = self.registry.stat_info(&spec.module, &spec.stat);
        let numeric = spec.decomposition.iter().any(|f| {
            stat.and_then(|s| s.fields.get(f))
                .map(|info| info.arity == FieldArity::Numeric)
                .unwrap_or(false)
        });
        let kind = if spec.decomposition.is_empty() {
            "scalar"
        } else if numeric {
            "numeric"
        } else {
            "discrete"
        };
        StatType {
            dimension: 1 + spec.decomposition.len(),
            kind: kind.to_string(),
        }
    }

    pub fn status(&self) -> StatusReport {
        self.registry.status_report(self.instrumentations.len())
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    pub fn handle_message(&mut self, envelope: Envelope) {
        let Envelope {
            source,
            hostname,
            message,
            ..
        } = envelope;

        match message {
            Message::Ping => {
                self.send(&source, Message::AckPing);
            }
            Message::Status => {
                let report = self.status();
                self.send(&source, Message::AckStatus(report));
            }
            Message::InstrumenterOnline { agent, modules } => {
                let outcome = self.registry.on_instrumenter_online(
                    &hostname,
                    &source,
                    agent,
                    &modules,
                    Timestamp::now(),
                );
                self.enable_existing_on_instrumenter(&hostname, outcome);
            }
            Message::AggregatorOnline { agent } => {
                let outcome =
                    self.registry
                        .on_aggregator_online(&hostname, &source, agent, Timestamp::now());
                if outcome == OnlineOutcome::Restarted {
                    self.reenable_on_aggregator(&hostname);
                }
            }
            Message::Log { message } => {
                warn!(
                    target: "fleetstat::coordinator",
                    hostname = %hostname,
                    "Agent log: {}",
                    message
                );
            }
            Message::InstrumenterError {
                inst_id,
                error,
                status,
            } => self.on_instrumenter_error(&hostname, inst_id, &error, &status),
            Message::AckEnableInstrumentation {
                inst_id,
                status,
                error,
            } => self.on_instrumenter_ack(&hostname, inst_id, &status, error.as_deref()),
            Message::AckEnableAggregation {
                inst_id,
                status,
                error,
            } => self.on_aggregator_ack(&hostname, inst_id, &status, error.as_deref()),
            Message::AckDisableInstrumentation { inst_id, status, .. }
            | Message::AckDisableAggregation { inst_id, status, .. } => {
                debug!(
                    target: "fleetstat::coordinator",
                    hostname = %hostname,
                    inst_id = %inst_id,
                    status = %status,
                    "Disable acknowledged"
                );
            }
            other => {
                debug!(
                    target: "fleetstat::coordinator",
                    hostname = %hostname,
                    kind = other.kind(),
                    "Ignoring unexpected message"
                );
            }
        }
    }

    /// Log-and-drop entry point for raw wire input
    pub fn handle_raw(&mut self, raw: &str) {
        match Envelope::decode(raw) {
            Ok(envelope) => self.handle_message(envelope),
            Err(e) => warn!(target: "fleetstat::coordinator", error = %e, "Dropping message"),
        }
    }

    fn on_instrumenter_error(&self, hostname: &str, inst_id: InstId, error: &str, status: &AckStatus) {
        if self.registry.instrumenter(hostname).is_none() {
            warn!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                "Dropping instrumenter error from unknown host"
            );
            return;
        }
        if !matches!(status, AckStatus::Enabled | AckStatus::Disabled) {
            warn!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                status = %status,
                "Dropping instrumenter error with invalid status"
            );
            return;
        }
        warn!(
            target: "fleetstat::coordinator",
            hostname = %hostname,
            inst_id = %inst_id,
            status = %status,
            "Instrumenter error: {}",
            error
        );
    }

    fn on_instrumenter_ack(
        &mut self,
        hostname: &str,
        id: InstId,
        status: &AckStatus,
        error: Option<&str>,
    ) {
        let Some(inst) = self.instrumentations.get_mut(&id) else {
            warn!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                inst_id = %id,
                "Ack for unknown instrumentation"
            );
            return;
        };
        if inst.state == InstrumentationState::Failed {
            debug!(target: "fleetstat::coordinator", inst_id = %id, "Ack after failure ignored");
            return;
        }
        let Some(ack) = inst.instrumenter_acks.get_mut(hostname) else {
            warn!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                inst_id = %id,
                "Ack from instrumenter that was not addressed"
            );
            return;
        };
        if *ack != AckState::Unknown {
            debug!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                inst_id = %id,
                "Duplicate ack ignored"
            );
            return;
        }

        if status.is_enabled() {
            *ack = AckState::Enabled;
        } else {
            *ack = AckState::Failed;
            warn!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                inst_id = %id,
                status = %status,
                error = error.unwrap_or(""),
                "Instrumenter failed to enable"
            );
            self.registry.release_instrumenter(hostname);
        }

        self.check_completion(id);
    }

    fn on_aggregator_ack(
        &mut self,
        hostname: &str,
        id: InstId,
        status: &AckStatus,
        error: Option<&str>,
    ) {
        let Some(inst) = self.instrumentations.get_mut(&id) else {
            warn!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                inst_id = %id,
                "Ack for unknown instrumentation"
            );
            return;
        };
        if inst.state == InstrumentationState::Failed {
            debug!(target: "fleetstat::coordinator", inst_id = %id, "Ack after failure ignored");
            return;
        }
        if inst.aggregator != hostname {
            warn!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                inst_id = %id,
                "Ack from aggregator that was not assigned"
            );
            return;
        }
        if inst.aggregator_ack != AckState::Unknown {
            debug!(target: "fleetstat::coordinator", inst_id = %id, "Duplicate ack ignored");
            return;
        }

        if status.is_enabled() {
            inst.aggregator_ack = AckState::Enabled;
        } else {
            inst.aggregator_ack = AckState::Failed;
            warn!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                inst_id = %id,
                status = %status,
                error = error.unwrap_or(""),
                "Aggregator failed to enable"
            );
            self.registry.release_aggregator(hostname);
        }

        self.check_completion(id);
    }

    /// Finish a pending create once nothing is outstanding
    fn check_completion(&mut self, id: InstId) {
        let Some(inst) = self.instrumentations.get_mut(&id) else {
            return;
        };
        if inst.state != InstrumentationState::Creating || inst.waiting() {
            return;
        }

        let failure = if inst.aggregator_ack.is_failure() {
            Some("failed to enable aggregator")
        } else if inst.instrumenter_acks.values().any(|a| a.is_failure()) {
            Some("failed to enable some instrumenters")
        } else {
            None
        };

        match failure {
            None => {
                inst.state = InstrumentationState::Enabled;
                if let Some(responder) = inst.responder.take() {
                    responder.respond(Ok(id));
                }
                info!(target: "fleetstat::coordinator", inst_id = %id, "Instrumentation enabled");
            }
            Some(reason) => self.fail(id, reason),
        }
    }

    /// Mark failed, reply, and undo the enable on every participant that did
    /// not report failure itself
    fn fail(&mut self, id: InstId, reason: &str) {
        let Some(inst) = self.instrumentations.get_mut(&id) else {
            return;
        };
        inst.state = InstrumentationState::Failed;
        inst.released = true;
        let responder = inst.responder.take();

        let aggregator = (inst.aggregator_ack != AckState::Failed).then(|| inst.aggregator.clone());
        let hosts: Vec<String> = inst
            .instrumenter_acks
            .iter()
            .filter(|(_, ack)| **ack != AckState::Failed)
            .map(|(h, _)| h.clone())
            .collect();

        warn!(
            target: "fleetstat::coordinator",
            inst_id = %id,
            reason,
            compensating = hosts.len() + aggregator.iter().count(),
            "Instrumentation failed"
        );

        if let Some(agg) = aggregator {
            self.registry.release_aggregator(&agg);
            if let Some(key) = self.registry.aggregator(&agg).map(|a| a.routing_key.clone()) {
                self.send(&key, Message::DisableAggregation { inst_id: id });
            }
        }
        for host in hosts {
            self.registry.release_instrumenter(&host);
            if let Some(key) = self.registry.instrumenter(&host).map(|r| r.routing_key.clone()) {
                self.send(&key, Message::DisableInstrumentation { inst_id: id });
            }
        }

        if let Some(responder) = responder {
            responder.respond(Err(RequestError::enable_failed(reason)));
        }
    }

    /// Fail every pending create whose deadline has passed. Returns how many
    /// expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<InstId> = self
            .instrumentations
            .values()
            .filter(|i| i.state == InstrumentationState::Creating && i.deadline <= now)
            .map(|i| i.id)
            .collect();

        for id in &expired {
            if let Some(inst) = self.instrumentations.get_mut(id) {
                if inst.aggregator_ack == AckState::Unknown {
                    inst.aggregator_ack = AckState::TimedOut;
                }
                let mut missing = 0;
                for ack in inst.instrumenter_acks.values_mut() {
                    if *ack == AckState::Unknown {
                        *ack = AckState::TimedOut;
                        missing += 1;
                    }
                }
                warn!(
                    target: "fleetstat::coordinator",
                    inst_id = %id,
                    missing_instrumenters = missing,
                    "Timed out waiting for acks"
                );
            }
            self.check_completion(*id);
        }

        expired.len()
    }

    // ------------------------------------------------------------------------
    // Agent restarts
    // ------------------------------------------------------------------------

    /// A restarted instrumenter lost its instrumentations; a new one has
    /// none. Enable whatever it should be running.
    fn enable_existing_on_instrumenter(&mut self, hostname: &str, outcome: OnlineOutcome) {
        let Some(key) = self.registry.instrumenter(hostname).map(|r| r.routing_key.clone()) else {
            return;
        };

        let mut messages = Vec::new();
        for inst in self.instrumentations.values_mut() {
            if inst.state == InstrumentationState::Failed {
                continue;
            }
            let addressed = inst.instrumenter_acks.contains_key(hostname);
            let enable = match outcome {
                OnlineOutcome::Restarted => {
                    addressed && inst.instrumenter_acks.get(hostname) != Some(&AckState::Failed)
                }
                OnlineOutcome::Started => {
                    !addressed && inst.state == InstrumentationState::Enabled
                }
            };
            if enable {
                inst.instrumenter_acks
                    .insert(hostname.to_string(), AckState::Unknown);
                messages.push(enable_message(inst.id, &inst.stream_key, &inst.spec));
            }
        }

        if !messages.is_empty() {
            info!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                count = messages.len(),
                "Enabling existing instrumentations on instrumenter"
            );
        }
        for message in messages {
            self.registry.acquire_instrumenter(hostname);
            self.send(&key, message);
        }
    }

    fn reenable_on_aggregator(&mut self, hostname: &str) {
        let Some(key) = self.registry.aggregator(hostname).map(|a| a.routing_key.clone()) else {
            return;
        };

        let mut messages = Vec::new();
        for inst in self.instrumentations.values_mut() {
            if inst.state == InstrumentationState::Failed
                || inst.aggregator != hostname
                || inst.aggregator_ack == AckState::Failed
            {
                continue;
            }
            inst.aggregator_ack = AckState::Unknown;
            messages.push(Message::EnableAggregation {
                inst_id: inst.id,
                key: inst.stream_key.clone(),
            });
        }

        if !messages.is_empty() {
            info!(
                target: "fleetstat::coordinator",
                hostname = %hostname,
                count = messages.len(),
                "Re-enabling aggregations after restart"
            );
        }
        for message in messages {
            self.registry.acquire_aggregator(hostname);
            self.send(&key, message);
        }
    }
}

fn enable_message(id: InstId, stream_key: &str, spec: &InstrumentationSpec) -> Message {
    Message::EnableInstrumentation {
        inst_id: id,
        inst_key: stream_key.to_string(),
        module: spec.module.clone(),
        stat: spec.stat.clone(),
        predicate: spec.predicate.clone(),
        decomposition: spec.decomposition.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AgentInfo, FieldInfo, ModuleInfo, StatInfo};
    use crate::metric::Expr;
    use crate::transport::{LocalBus, Mailbox, Transport};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::oneshot::Receiver;

    type Reply = Receiver<RequestResult<InstId>>;

    struct Harness {
        bus: Arc<LocalBus>,
        coord: Coordinator,
        now: Instant,
        mailboxes: HashMap<String, Mailbox>,
    }

    fn cpu_modules() -> BTreeMap<String, ModuleInfo> {
        let mut fields = BTreeMap::new();
        fields.insert(
            "hostname".to_string(),
            FieldInfo {
                label: "hostname".into(),
                arity: FieldArity::Discrete,
            },
        );
        fields.insert(
            "cpu".to_string(),
            FieldInfo {
                label: "CPU identifier".into(),
                arity: FieldArity::Discrete,
            },
        );
        fields.insert(
            "utilization".to_string(),
            FieldInfo {
                label: "utilization".into(),
                arity: FieldArity::Numeric,
            },
        );
        fields.insert(
            "latency".to_string(),
            FieldInfo {
                label: "latency".into(),
                arity: FieldArity::Numeric,
            },
        );
        let mut stats = BTreeMap::new();
        stats.insert(
            "utilization".to_string(),
            StatInfo {
                label: "utilization".into(),
                unit: "percent".into(),
                fields,
            },
        );
        let mut modules = BTreeMap::new();
        modules.insert(
            "cpu".to_string(),
            ModuleInfo {
                label: "CPU".into(),
                stats,
            },
        );
        modules
    }

    impl Harness {
        fn new() -> Self {
            let bus = LocalBus::shared();
            let publisher = Publisher::new(bus.clone(), "fleetstat.config", "hq");
            let config = CoordinatorConfig {
                ack_timeout: Duration::from_secs(30),
                ..Default::default()
            };
            Self {
                bus,
                coord: Coordinator::new(&config, publisher),
                now: Instant::now(),
                mailboxes: HashMap::new(),
            }
        }

        fn key(host: &str) -> String {
            format!("fleetstat.agent.{}", host)
        }

        fn deliver(&mut self, host: &str, message: Message) {
            let env = Envelope::new(Self::key(host), host, message);
            self.coord.handle_message(env);
        }

        fn bind(&mut self, host: &str) {
            let mailbox = Mailbox::new();
            self.bus.bind(&Self::key(host), &mailbox);
            self.mailboxes.insert(host.to_string(), mailbox);
        }

        fn instrumenter(&mut self, host: &str) {
            self.bind(host);
            self.deliver(
                host,
                Message::InstrumenterOnline {
                    agent: AgentInfo::current("instrumenter"),
                    modules: cpu_modules(),
                },
            );
        }

        fn aggregator(&mut self, host: &str) {
            self.bind(host);
            self.deliver(
                host,
                Message::AggregatorOnline {
                    agent: AgentInfo::current("aggregator"),
                },
            );
        }

        fn create(&mut self, spec: InstrumentationSpec) -> Reply {
            let (responder, rx) = Responder::new();
            self.coord.create_instrumentation(spec, responder, self.now);
            rx
        }

        fn ack_instrumenter(&mut self, host: &str, id: InstId, status: AckStatus) {
            self.deliver(
                host,
                Message::AckEnableInstrumentation {
                    inst_id: id,
                    status,
                    error: None,
                },
            );
        }

        fn ack_aggregator(&mut self, host: &str, id: InstId, status: AckStatus) {
            self.deliver(
                host,
                Message::AckEnableAggregation {
                    inst_id: id,
                    status,
                    error: None,
                },
            );
        }

        fn kinds(&self, host: &str) -> Vec<&'static str> {
            self.mailboxes[host]
                .drain()
                .into_iter()
                .map(|e| e.message.kind())
                .collect()
        }
    }

    fn cpu() -> InstrumentationSpec {
        InstrumentationSpec::new("cpu", "utilization")
    }

    #[test]
    fn test_validation_failures_reply_400_without_fanout() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.aggregator("agg1");
        h.kinds("web1");

        let cases = vec![
            InstrumentationSpec::new("", "utilization"),
            InstrumentationSpec::new("cpu", ""),
            InstrumentationSpec::new("cpu", "bogus"),
            cpu().with_decomposition(&["zone"]),
            cpu().with_decomposition(&["utilization", "latency"]),
            cpu().with_predicate(Predicate::new(Expr::eq("zone", "global"))),
        ];
        for spec in cases {
            let mut rx = h.create(spec);
            let err = rx.try_recv().unwrap().unwrap_err();
            assert_eq!(err.status().as_u16(), 400, "{}", err);
        }
        assert!(h.kinds("web1").is_empty());
        assert!(h.kinds("agg1").is_empty());
        assert!(h.coord.is_empty());
    }

    #[test]
    fn test_no_aggregators() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        let mut rx = h.create(cpu());
        assert_eq!(rx.try_recv().unwrap(), Err(RequestError::NoAggregators));
        assert!(h.coord.is_empty());
        assert!(h.kinds("web1").is_empty());
    }

    #[test]
    fn test_unanimous_acks_enable() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.instrumenter("web2");
        h.aggregator("agg1");

        let mut rx = h.create(cpu().with_decomposition(&["cpu"]));
        let id = InstId::new(1);
        assert_eq!(h.kinds("web1"), vec!["cmd-enable_instrumentation"]);
        assert_eq!(h.kinds("web2"), vec!["cmd-enable_instrumentation"]);
        assert_eq!(h.kinds("agg1"), vec!["cmd-enable_aggregation"]);
        assert_eq!(h.coord.state_of(id), Some(InstrumentationState::Creating));

        h.ack_aggregator("agg1", id, AckStatus::Enabled);
        h.ack_instrumenter("web1", id, AckStatus::Enabled);
        assert!(rx.try_recv().is_err());

        h.ack_instrumenter("web2", id, AckStatus::Enabled);
        assert_eq!(rx.try_recv().unwrap(), Ok(id));
        assert_eq!(h.coord.state_of(id), Some(InstrumentationState::Enabled));

        let status = h.coord.status();
        assert_eq!(status.aggregators[0].ninsts, 1);
        assert!(status.instrumenters.iter().all(|i| i.ninsts == 1));
    }

    #[test]
    fn test_aggregator_failure_compensates() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.aggregator("agg1");

        let mut rx = h.create(cpu());
        let id = InstId::new(1);
        h.kinds("web1");
        h.kinds("agg1");

        h.ack_instrumenter("web1", id, AckStatus::Enabled);
        h.ack_aggregator("agg1", id, AckStatus::Other("failed".into()));

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RequestError::enable_failed("failed to enable aggregator"))
        );
        assert_eq!(h.coord.state_of(id), Some(InstrumentationState::Failed));
        assert_eq!(h.kinds("web1"), vec!["cmd-disable_instrumentation"]);
        assert!(h.kinds("agg1").is_empty());

        let status = h.coord.status();
        assert_eq!(status.aggregators[0].ninsts, 0);
        assert_eq!(status.instrumenters[0].ninsts, 0);
    }

    #[test]
    fn test_instrumenter_failure() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.instrumenter("web2");
        h.aggregator("agg1");

        let mut rx = h.create(cpu());
        let id = InstId::new(1);
        h.ack_aggregator("agg1", id, AckStatus::Enabled);
        h.ack_instrumenter("web1", id, AckStatus::Disabled);
        h.ack_instrumenter("web2", id, AckStatus::Enabled);

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RequestError::enable_failed("failed to enable some instrumenters"))
        );
        let status = h.coord.status();
        assert!(status.instrumenters.iter().all(|i| i.ninsts == 0));
        assert_eq!(status.aggregators[0].ninsts, 0);
    }

    #[test]
    fn test_timeout_fails_closed() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.instrumenter("web2");
        h.aggregator("agg1");

        let mut rx = h.create(cpu());
        let id = InstId::new(1);
        h.kinds("web1");
        h.kinds("web2");
        h.kinds("agg1");
        h.ack_aggregator("agg1", id, AckStatus::Enabled);
        h.ack_instrumenter("web1", id, AckStatus::Enabled);

        assert_eq!(h.coord.expire(h.now + Duration::from_secs(29)), 0);
        assert_eq!(h.coord.next_deadline(), Some(h.now + Duration::from_secs(30)));
        assert_eq!(h.coord.expire(h.now + Duration::from_secs(30)), 1);

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RequestError::enable_failed("failed to enable some instrumenters"))
        );
        assert_eq!(h.kinds("web1"), vec!["cmd-disable_instrumentation"]);
        assert_eq!(h.kinds("web2"), vec!["cmd-disable_instrumentation"]);
        assert_eq!(h.kinds("agg1"), vec!["cmd-disable_aggregation"]);
        assert_eq!(h.coord.next_deadline(), None);

        // A late ack changes nothing
        h.ack_instrumenter("web2", id, AckStatus::Enabled);
        assert_eq!(h.coord.state_of(id), Some(InstrumentationState::Failed));
    }

    #[test]
    fn test_duplicate_and_stray_acks_ignored() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.aggregator("agg1");

        let mut rx = h.create(cpu());
        let id = InstId::new(1);
        h.ack_instrumenter("web1", id, AckStatus::Enabled);
        h.ack_instrumenter("web1", id, AckStatus::Disabled);
        h.ack_instrumenter("stranger", id, AckStatus::Disabled);
        h.ack_aggregator("other-agg", id, AckStatus::Disabled);
        h.ack_instrumenter("web1", InstId::new(99), AckStatus::Enabled);
        assert!(rx.try_recv().is_err());

        h.ack_aggregator("agg1", id, AckStatus::Enabled);
        assert_eq!(rx.try_recv().unwrap(), Ok(id));
    }

    #[test]
    fn test_delete_during_creating_cancels() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.aggregator("agg1");

        let mut rx = h.create(cpu());
        let id = InstId::new(1);
        h.kinds("web1");
        h.kinds("agg1");

        assert_eq!(h.coord.delete_instrumentation(id), Ok(()));
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err, RequestError::Cancelled { id });
        assert_eq!(err.status().as_u16(), 409);

        assert_eq!(h.kinds("web1"), vec!["cmd-disable_instrumentation"]);
        assert_eq!(h.kinds("agg1"), vec!["cmd-disable_aggregation"]);
        assert_eq!(h.coord.status().aggregators[0].ninsts, 0);

        // Acks for the deleted id are dropped
        h.ack_aggregator("agg1", id, AckStatus::Enabled);
        assert!(h.coord.is_empty());
    }

    #[test]
    fn test_delete_unknown_is_404_and_silent() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        let err = h.coord.delete_instrumentation(InstId::new(7)).unwrap_err();
        assert_eq!(err.status().as_u16(), 404);
        assert!(h.kinds("web1").is_empty());
    }

    #[test]
    fn test_instrumenter_restart_reenables() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.aggregator("agg1");
        let mut rx = h.create(cpu());
        let id = InstId::new(1);
        h.ack_aggregator("agg1", id, AckStatus::Enabled);
        h.ack_instrumenter("web1", id, AckStatus::Enabled);
        assert_eq!(rx.try_recv().unwrap(), Ok(id));
        h.kinds("web1");

        h.instrumenter("web1");
        assert_eq!(h.kinds("web1"), vec!["cmd-enable_instrumentation"]);
        assert_eq!(h.coord.registry().instrumenter_count(), 1);
        assert_eq!(h.coord.status().instrumenters[0].ninsts, 1);

        h.ack_instrumenter("web1", id, AckStatus::Enabled);
        assert_eq!(h.coord.state_of(id), Some(InstrumentationState::Enabled));
    }

    #[test]
    fn test_new_instrumenter_joins_enabled() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.aggregator("agg1");
        let _rx = h.create(cpu());
        let id = InstId::new(1);
        h.ack_aggregator("agg1", id, AckStatus::Enabled);
        h.ack_instrumenter("web1", id, AckStatus::Enabled);

        h.instrumenter("web2");
        assert_eq!(h.kinds("web2"), vec!["cmd-enable_instrumentation"]);
        assert_eq!(h.coord.registry().instrumenter("web2").unwrap().ninsts, 1);

        h.coord.delete_instrumentation(id).unwrap();
        assert!(h.coord.status().instrumenters.iter().all(|i| i.ninsts == 0));
    }

    #[test]
    fn test_delete_disables_every_registered_instrumenter_once() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.instrumenter("web2");
        h.aggregator("agg1");
        let mut rx = h.create(cpu());
        let id = InstId::new(1);

        // Joins mid-create, so it is never sent the enable
        h.instrumenter("web3");
        h.ack_aggregator("agg1", id, AckStatus::Enabled);
        h.ack_instrumenter("web1", id, AckStatus::Enabled);
        h.ack_instrumenter("web2", id, AckStatus::Enabled);
        assert_eq!(rx.try_recv().unwrap(), Ok(id));
        assert_eq!(h.kinds("web1"), vec!["cmd-enable_instrumentation"]);
        assert_eq!(h.kinds("web2"), vec!["cmd-enable_instrumentation"]);
        assert!(h.kinds("web3").is_empty());
        h.kinds("agg1");

        h.coord.delete_instrumentation(id).unwrap();
        for host in ["web1", "web2", "web3"] {
            assert_eq!(h.kinds(host), vec!["cmd-disable_instrumentation"], "{}", host);
        }
        assert_eq!(h.kinds("agg1"), vec!["cmd-disable_aggregation"]);
        assert!(h.coord.status().instrumenters.iter().all(|i| i.ninsts == 0));
    }

    #[test]
    fn test_aggregator_restart_reenables() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.aggregator("agg1");
        let mut rx = h.create(cpu());
        let id = InstId::new(1);
        h.ack_instrumenter("web1", id, AckStatus::Enabled);
        h.ack_aggregator("agg1", id, AckStatus::Enabled);
        assert_eq!(rx.try_recv().unwrap(), Ok(id));
        h.kinds("agg1");

        h.aggregator("agg1");
        assert_eq!(h.kinds("agg1"), vec!["cmd-enable_aggregation"]);
        assert_eq!(h.coord.status().aggregators[0].ninsts, 1);
    }

    #[test]
    fn test_ping_and_status() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.aggregator("agg1");
        h.deliver("web1", Message::Ping);
        h.deliver("agg1", Message::Status);

        assert_eq!(h.kinds("web1"), vec!["ack-ping"]);
        let reply = h.mailboxes["agg1"].drain().remove(0);
        let Message::AckStatus(report) = reply.message else {
            panic!("expected ack-status");
        };
        assert_eq!(report.instrumenters[0].hostname, "web1");
        assert_eq!(report.instrumenters[0].nmetrics_avail, 1);
        assert_eq!(report.aggregators[0].hostname, "agg1");
    }

    #[test]
    fn test_malformed_raw_input_is_dropped() {
        let mut h = Harness::new();
        h.aggregator("agg1");
        h.coord.handle_raw("{\"message\": {\"kind\": \"ack-enable_aggregation\"}}");
        h.coord.handle_raw("garbage");
        assert!(h.coord.is_empty());
        assert_eq!(h.coord.registry().aggregator_count(), 1);
    }

    #[test]
    fn test_end_to_end_lifecycle() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.aggregator("agg1");

        let mut rx = h.create(cpu());
        let id = InstId::new(1);
        h.ack_aggregator("agg1", id, AckStatus::Enabled);
        h.ack_instrumenter("web1", id, AckStatus::Enabled);
        assert_eq!(rx.try_recv().unwrap(), Ok(id));

        let list = h.coord.list_instrumentations();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].inst_id, id);
        assert_eq!(list[0].module, "cpu");
        assert_eq!(list[0].stat, "utilization");
        assert!(list[0].decomposition.is_empty());
        assert_eq!(
            list[0].stat_type,
            StatType {
                dimension: 1,
                kind: "scalar".into()
            }
        );

        let err = h.coord.delete_instrumentation(InstId::new(42)).unwrap_err();
        assert_eq!(err.status().as_u16(), 404);

        assert_eq!(h.coord.delete_instrumentation(id), Ok(()));
        assert!(h.coord.list_instrumentations().is_empty());
        assert!(h.coord.list_metrics().contains_key("cpu"));
    }

    #[test]
    fn test_ids_are_monotonic_across_failures() {
        let mut h = Harness::new();
        h.instrumenter("web1");
        h.aggregator("agg1");
        let _a = h.create(cpu());
        let _b = h.create(InstrumentationSpec::new("cpu", "bogus"));
        let _c = h.create(cpu());
        let ids: Vec<InstId> = h.coord.list_instrumentations().iter().map(|s| s.inst_id).collect();
        assert_eq!(ids, vec![InstId::new(1), InstId::new(2)]);
        assert_eq!(h.coord.stream_key(ids[1]), "fleetstat.instrumentation.2");
    }

    #[test]
    fn test_stat_type_numeric() {
        let mut h = Harness::new();
        h.aggregator("agg1");
        h.instrumenter("web1");
        let _rx = h.create(cpu().with_decomposition(&["cpu", "latency"]));
        let list = h.coord.list_instrumentations();
        assert_eq!(list[0].stat_type.dimension, 3);
        assert_eq!(list[0].stat_type.kind, "numeric");
    }
}

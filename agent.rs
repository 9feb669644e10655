// ============================================================================
// AGENT RUNTIME
// ============================================================================
// Instrumenters turn local counter snapshots into reduced values; aggregators
// merge the per-host values into fleet-wide ones.
//
//   SampleSource ──► SampledMetric (Metric) ──► InstrumenterAgent
//                                                  │ data on <key_base>.instrumentation.<id>
//                                                  ▼
//                                            AggregatorAgent ──► AggregateStore
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::AgentConfig;
use crate::error::{FleetResult, MetricError, MetricResult, TransportResult};
use crate::message::{AckStatus, AgentInfo, Envelope, Message, ModuleInfo};
use crate::metric::{CompiledQuery, MetricDescriptor, Predicate, ReducedValue, Sample};
use crate::transport::{Mailbox, Publisher, Transport};
use crate::types::{AgentKind, InstId, Timestamp};
use crate::{routing_key, BROADCAST_KEY_SUFFIX, COORDINATOR_KEY_SUFFIX};

// ============================================================================
// SAMPLE SOURCES
// ============================================================================

/// Backend yielding kstat-like counter snapshots
#[async_trait]
pub trait SampleSource: Send + Sync + Debug {
    async fn read(&self) -> MetricResult<Vec<Sample>>;
}

/// Builds a fresh source for each instantiated metric
pub type SourceFactory = Arc<dyn Fn() -> Arc<dyn SampleSource> + Send + Sync>;

#[derive(Debug, Default)]
struct FeedState {
    samples: BTreeMap<String, Sample>,
    failure: Option<String>,
}

/// Shared, writable set of samples. Tests and the demo push counters here.
#[derive(Debug, Clone, Default)]
pub struct SampleFeed {
    state: Arc<Mutex<FeedState>>,
}

impl SampleFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the sample with the same key
    pub fn set(&self, sample: Sample) {
        self.state.lock().samples.insert(sample.key.clone(), sample);
    }

    pub fn remove(&self, key: &str) {
        self.state.lock().samples.remove(key);
    }

    /// Make every read fail until `recover`
    pub fn fail(&self, message: impl Into<String>) {
        self.state.lock().failure = Some(message.into());
    }

    pub fn recover(&self) {
        self.state.lock().failure = None;
    }

    pub fn snapshot(&self) -> MetricResult<Vec<Sample>> {
        let state = self.state.lock();
        match &state.failure {
            Some(message) => Err(MetricError::source(message.clone())),
            None => Ok(state.samples.values().cloned().collect()),
        }
    }

    /// Factory handing out `MemorySource`s over this feed
    pub fn factory(&self) -> SourceFactory {
        let feed = self.clone();
        Arc::new(move || Arc::new(MemorySource::new(feed.clone())) as Arc<dyn SampleSource>)
    }

    /// Like `factory`, limited to samples whose key starts with `prefix`
    pub fn scoped_factory(&self, prefix: &str) -> SourceFactory {
        let feed = self.clone();
        let prefix = prefix.to_string();
        Arc::new(move || {
            Arc::new(MemorySource::scoped(feed.clone(), prefix.clone())) as Arc<dyn SampleSource>
        })
    }
}

/// In-memory `SampleSource` over a `SampleFeed`
#[derive(Debug, Clone)]
pub struct MemorySource {
    feed: SampleFeed,
    prefix: Option<String>,
}

impl MemorySource {
    pub fn new(feed: SampleFeed) -> Self {
        Self { feed, prefix: None }
    }

    pub fn scoped(feed: SampleFeed, prefix: impl Into<String>) -> Self {
        Self {
            feed,
            prefix: Some(prefix.into()),
        }
    }
}

#[async_trait]
impl SampleSource for MemorySource {
    async fn read(&self) -> MetricResult<Vec<Sample>> {
        let mut samples = self.feed.snapshot()?;
        if let Some(prefix) = &self.prefix {
            samples.retain(|s| s.key.starts_with(prefix.as_str()));
        }
        Ok(samples)
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// One instantiated instrumentation on an instrumenter
#[async_trait]
pub trait Metric: Send + Sync + Debug {
    async fn instrument(&mut self) -> MetricResult<()>;

    async fn deinstrument(&mut self) -> MetricResult<()>;

    /// Current reduced value. The first call after `instrument` returns the
    /// typed zero.
    async fn value(&mut self) -> MetricResult<ReducedValue>;
}

/// `Metric` computed from successive snapshots of a `SampleSource`
#[derive(Debug)]
pub struct SampledMetric {
    query: CompiledQuery,
    source: Arc<dyn SampleSource>,
    previous: Option<Vec<Sample>>,
    instrumented: bool,
}

impl SampledMetric {
    pub fn new(query: CompiledQuery, source: Arc<dyn SampleSource>) -> Self {
        Self {
            query,
            source,
            previous: None,
            instrumented: false,
        }
    }

    pub fn query(&self) -> &CompiledQuery {
        &self.query
    }
}

#[async_trait]
impl Metric for SampledMetric {
    async fn instrument(&mut self) -> MetricResult<()> {
        self.previous = None;
        self.instrumented = true;
        Ok(())
    }

    async fn deinstrument(&mut self) -> MetricResult<()> {
        self.previous = None;
        self.instrumented = false;
        Ok(())
    }

    async fn value(&mut self) -> MetricResult<ReducedValue> {
        if !self.instrumented {
            return Err(MetricError::NotInstrumented);
        }
        let current = self.source.read().await?;
        let value = self.query.evaluate(&current, self.previous.as_deref());
        self.previous = Some(current);
        Ok(value)
    }
}

// ============================================================================
// INSTRUMENTER AGENT
// ============================================================================

struct Registration {
    descriptor: Arc<MetricDescriptor>,
    source: SourceFactory,
}

#[derive(Debug)]
struct ActiveMetric {
    stream_key: String,
    metric: Box<dyn Metric>,
}

/// Keys an agent listens on: its own and the broadcast key
type Bindings = SmallVec<[String; 2]>;

fn bind_agent(
    transport: &Arc<dyn Transport>,
    key_base: &str,
    kind: AgentKind,
    hostname: &str,
) -> (String, Bindings, Mailbox) {
    let key = format!("{}.{}.{}", key_base, kind, hostname);
    let bindings: Bindings = SmallVec::from_buf([key.clone(), routing_key(key_base, BROADCAST_KEY_SUFFIX)]);
    let mailbox = Mailbox::new();
    for binding in &bindings {
        transport.bind(binding, &mailbox);
    }
    (key, bindings, mailbox)
}

pub struct InstrumenterAgent {
    publisher: Publisher,
    coordinator_key: String,
    bindings: Bindings,
    mailbox: Mailbox,
    modules: BTreeMap<String, String>,
    metrics: BTreeMap<(String, String), Registration>,
    active: BTreeMap<InstId, ActiveMetric>,
}

impl InstrumenterAgent {
    /// Bind `<key_base>.instrumenter.<hostname>` and the broadcast key
    pub fn new(transport: Arc<dyn Transport>, key_base: &str, hostname: &str) -> Self {
        let (key, bindings, mailbox) =
            bind_agent(&transport, key_base, AgentKind::Instrumenter, hostname);
        Self {
            publisher: Publisher::new(transport, key, hostname),
            coordinator_key: routing_key(key_base, COORDINATOR_KEY_SUFFIX),
            bindings,
            mailbox,
            modules: BTreeMap::new(),
            metrics: BTreeMap::new(),
            active: BTreeMap::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        self.publisher.hostname()
    }

    pub fn routing_key(&self) -> &str {
        self.publisher.source()
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: InstId) -> bool {
        self.active.contains_key(&id)
    }

    /// Re-registering a module keeps the first label
    pub fn register_module(&mut self, name: impl Into<String>, label: impl Into<String>) {
        self.modules.entry(name.into()).or_insert_with(|| label.into());
    }

    /// Register a metric under an already registered module. The hostname
    /// field is added to its descriptor.
    pub fn register_metric(
        &mut self,
        descriptor: MetricDescriptor,
        source: SourceFactory,
    ) -> MetricResult<()> {
        if !self.modules.contains_key(&descriptor.module) {
            return Err(MetricError::UnknownModule {
                module: descriptor.module,
            });
        }
        let id = (descriptor.module.clone(), descriptor.stat.clone());
        if self.metrics.contains_key(&id) {
            return Err(MetricError::AlreadyRegistered {
                module: id.0,
                stat: id.1,
            });
        }

        let descriptor = descriptor.with_hostname(self.publisher.hostname());
        debug!(
            target: "fleetstat::agent",
            module = %id.0,
            stat = %id.1,
            fields = descriptor.fields().len(),
            "Registered metric"
        );
        self.metrics.insert(
            id,
            Registration {
                descriptor: Arc::new(descriptor),
                source,
            },
        );
        Ok(())
    }

    /// Catalog payload of the online notification
    pub fn modules_info(&self) -> BTreeMap<String, ModuleInfo> {
        let mut modules: BTreeMap<String, ModuleInfo> = self
            .modules
            .iter()
            .map(|(name, label)| {
                (
                    name.clone(),
                    ModuleInfo {
                        label: label.clone(),
                        stats: BTreeMap::new(),
                    },
                )
            })
            .collect();
        for ((module, stat), registration) in &self.metrics {
            if let Some(info) = modules.get_mut(module) {
                info.stats.insert(stat.clone(), registration.descriptor.stat_info());
            }
        }
        modules
    }

    pub fn online_message(&self) -> Message {
        Message::InstrumenterOnline {
            agent: AgentInfo::current("instrumenter"),
            modules: self.modules_info(),
        }
    }

    pub fn announce(&self) -> TransportResult<usize> {
        info!(
            target: "fleetstat::agent",
            hostname = %self.hostname(),
            metrics = self.metrics.len(),
            "Instrumenter online"
        );
        self.publisher.send(&self.coordinator_key, self.online_message())
    }

    async fn enable(
        &mut self,
        id: InstId,
        stream_key: String,
        module: &str,
        stat: &str,
        predicate: Predicate,
        decomposition: &[String],
    ) -> MetricResult<()> {
        let registration = self
            .metrics
            .get(&(module.to_string(), stat.to_string()))
            .ok_or_else(|| MetricError::UnknownMetric {
                module: module.to_string(),
                stat: stat.to_string(),
            })?;

        if self.active.contains_key(&id) {
            debug!(target: "fleetstat::agent", inst_id = %id, "Already enabled");
            return Ok(());
        }

        let query = CompiledQuery::compile(registration.descriptor.clone(), predicate, decomposition)?;
        let mut metric = SampledMetric::new(query, (registration.source)());
        metric.instrument().await?;

        self.active.insert(
            id,
            ActiveMetric {
                stream_key,
                metric: Box::new(metric),
            },
        );
        Ok(())
    }

    async fn disable(&mut self, id: InstId) -> MetricResult<()> {
        match self.active.remove(&id) {
            Some(mut active) => active.metric.deinstrument().await,
            None => Ok(()),
        }
    }

    pub async fn handle(&mut self, envelope: Envelope) {
        let reply = match &envelope.message {
            Message::EnableInstrumentation {
                inst_id,
                inst_key,
                module,
                stat,
                predicate,
                decomposition,
            } => {
                let result = self
                    .enable(*inst_id, inst_key.clone(), module, stat, predicate.clone(), decomposition)
                    .await;
                let (status, error) = match result {
                    Ok(()) => {
                        info!(
                            target: "fleetstat::agent",
                            inst_id = %inst_id,
                            module = %module,
                            stat = %stat,
                            "Instrumentation enabled"
                        );
                        (AckStatus::Enabled, None)
                    }
                    Err(e) => {
                        warn!(
                            target: "fleetstat::agent",
                            inst_id = %inst_id,
                            error = %e,
                            "Failed to enable instrumentation"
                        );
                        (AckStatus::Disabled, Some(e.to_string()))
                    }
                };
                Message::AckEnableInstrumentation {
                    inst_id: *inst_id,
                    status,
                    error,
                }
            }
            Message::DisableInstrumentation { inst_id } => {
                let error = self.disable(*inst_id).await.err().map(|e| e.to_string());
                Message::AckDisableInstrumentation {
                    inst_id: *inst_id,
                    status: AckStatus::Disabled,
                    error,
                }
            }
            Message::Ping => Message::AckPing,
            other => {
                debug!(target: "fleetstat::agent", kind = other.kind(), "Ignoring message");
                return;
            }
        };

        if let Err(e) = self.publisher.reply(&envelope, reply) {
            warn!(target: "fleetstat::agent", error = %e, "Failed to reply");
        }
    }

    /// Publish the current value of every active instrumentation. Returns
    /// how many values were sent.
    pub async fn report(&mut self) -> usize {
        let sampled_at = Timestamp::now();
        let mut sent = 0;

        for (id, active) in self.active.iter_mut() {
            let message = match active.metric.value().await {
                Ok(value) => {
                    trace!(target: "fleetstat::agent", inst_id = %id, kind = value.kind(), "Reporting value");
                    sent += 1;
                    (
                        active.stream_key.as_str(),
                        Message::Data {
                            inst_id: *id,
                            sampled_at,
                            value,
                        },
                    )
                }
                Err(e) => {
                    warn!(target: "fleetstat::agent", inst_id = %id, error = %e, "Failed to read value");
                    (
                        self.coordinator_key.as_str(),
                        Message::InstrumenterError {
                            inst_id: *id,
                            error: e.to_string(),
                            status: AckStatus::Enabled,
                        },
                    )
                }
            };
            if let Err(e) = self.publisher.send(message.0, message.1) {
                warn!(target: "fleetstat::agent", inst_id = %id, error = %e, "Failed to publish");
            }
        }
        sent
    }

    fn unbind(&self) {
        for binding in &self.bindings {
            self.publisher.transport().unbind(binding, &self.mailbox);
        }
    }
}

impl Debug for InstrumenterAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumenterAgent")
            .field("hostname", &self.hostname())
            .field("metrics", &self.metrics.len())
            .field("active", &self.active.len())
            .finish()
    }
}

// ============================================================================
// AGGREGATOR AGENT
// ============================================================================

/// Values reported for one sample second
#[derive(Debug, Clone)]
struct Slot {
    /// Latest value per reporting host
    hosts: BTreeMap<String, ReducedValue>,
    merged: ReducedValue,
}

impl Slot {
    /// Replace `hostname`'s value and re-merge across hosts. The slot is
    /// left untouched when the shapes disagree.
    fn update(&mut self, hostname: &str, value: &ReducedValue) -> MetricResult<()> {
        let mut merged = value.clone();
        for (host, other) in &self.hosts {
            if host != hostname {
                merged.merge(other)?;
            }
        }
        self.hosts.insert(hostname.to_string(), value.clone());
        self.merged = merged;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Aggregation {
    stream_key: String,
    window: BTreeMap<i64, Slot>,
}

/// Read side of an aggregator's merged values. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct AggregateStore {
    inner: Arc<DashMap<InstId, Aggregation>>,
}

impl AggregateStore {
    /// Merged value for one sample second
    pub fn value_at(&self, id: InstId, second: i64) -> Option<ReducedValue> {
        self.inner.get(&id)?.window.get(&second).map(|slot| slot.merged.clone())
    }

    /// Most recent second with data
    pub fn latest(&self, id: InstId) -> Option<(i64, ReducedValue)> {
        let aggregation = self.inner.get(&id)?;
        aggregation
            .window
            .iter()
            .next_back()
            .map(|(second, slot)| (*second, slot.merged.clone()))
    }

    pub fn contains(&self, id: InstId) -> bool {
        self.inner.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Seconds currently retained for `id`
    pub fn seconds(&self, id: InstId) -> Vec<i64> {
        self.inner
            .get(&id)
            .map(|a| a.window.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct AggregatorAgent {
    publisher: Publisher,
    coordinator_key: String,
    bindings: Bindings,
    mailbox: Mailbox,
    retain: usize,
    store: AggregateStore,
}

impl AggregatorAgent {
    /// Bind `<key_base>.aggregator.<hostname>` and the broadcast key
    pub fn new(transport: Arc<dyn Transport>, key_base: &str, hostname: &str, retain: usize) -> Self {
        let (key, bindings, mailbox) =
            bind_agent(&transport, key_base, AgentKind::Aggregator, hostname);
        Self {
            publisher: Publisher::new(transport, key, hostname),
            coordinator_key: routing_key(key_base, COORDINATOR_KEY_SUFFIX),
            bindings,
            mailbox,
            retain: retain.max(1),
            store: AggregateStore::default(),
        }
    }

    pub fn hostname(&self) -> &str {
        self.publisher.hostname()
    }

    pub fn routing_key(&self) -> &str {
        self.publisher.source()
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn store(&self) -> AggregateStore {
        self.store.clone()
    }

    pub fn value_at(&self, id: InstId, second: i64) -> Option<ReducedValue> {
        self.store.value_at(id, second)
    }

    pub fn latest(&self, id: InstId) -> Option<(i64, ReducedValue)> {
        self.store.latest(id)
    }

    pub fn announce(&self) -> TransportResult<usize> {
        info!(target: "fleetstat::agent", hostname = %self.hostname(), "Aggregator online");
        self.publisher.send(
            &self.coordinator_key,
            Message::AggregatorOnline {
                agent: AgentInfo::current("aggregator"),
            },
        )
    }

    pub fn handle(&mut self, envelope: Envelope) {
        let reply = match &envelope.message {
            Message::EnableAggregation { inst_id, key } => {
                if !self.store.contains(*inst_id) {
                    self.publisher.transport().bind(key, &self.mailbox);
                    self.store.inner.insert(
                        *inst_id,
                        Aggregation {
                            stream_key: key.clone(),
                            window: BTreeMap::new(),
                        },
                    );
                    info!(target: "fleetstat::agent", inst_id = %inst_id, key = %key, "Aggregation enabled");
                }
                Message::AckEnableAggregation {
                    inst_id: *inst_id,
                    status: AckStatus::Enabled,
                    error: None,
                }
            }
            Message::DisableAggregation { inst_id } => {
                if let Some((_, aggregation)) = self.store.inner.remove(inst_id) {
                    self.publisher
                        .transport()
                        .unbind(&aggregation.stream_key, &self.mailbox);
                    info!(target: "fleetstat::agent", inst_id = %inst_id, "Aggregation disabled");
                }
                Message::AckDisableAggregation {
                    inst_id: *inst_id,
                    status: AckStatus::Disabled,
                    error: None,
                }
            }
            Message::Data {
                inst_id,
                sampled_at,
                value,
            } => {
                self.merge(&envelope.hostname, *inst_id, *sampled_at, value);
                return;
            }
            Message::Ping => Message::AckPing,
            other => {
                debug!(target: "fleetstat::agent", kind = other.kind(), "Ignoring message");
                return;
            }
        };

        if let Err(e) = self.publisher.reply(&envelope, reply) {
            warn!(target: "fleetstat::agent", error = %e, "Failed to reply");
        }
    }

    fn merge(&self, hostname: &str, id: InstId, sampled_at: Timestamp, value: &ReducedValue) {
        let Some(mut aggregation) = self.store.inner.get_mut(&id) else {
            debug!(target: "fleetstat::agent", inst_id = %id, "Data for unknown aggregation");
            return;
        };

        let second = sampled_at.as_secs();
        match aggregation.window.get_mut(&second) {
            Some(slot) => {
                if let Err(e) = slot.update(hostname, value) {
                    warn!(
                        target: "fleetstat::agent",
                        inst_id = %id,
                        hostname = %hostname,
                        error = %e,
                        "Dropping value"
                    );
                }
            }
            None => {
                let mut hosts = BTreeMap::new();
                hosts.insert(hostname.to_string(), value.clone());
                aggregation.window.insert(
                    second,
                    Slot {
                        hosts,
                        merged: value.clone(),
                    },
                );
            }
        }

        while aggregation.window.len() > self.retain {
            aggregation.window.pop_first();
        }
    }

    fn unbind(&self) {
        let transport = self.publisher.transport();
        for binding in &self.bindings {
            transport.unbind(binding, &self.mailbox);
        }
        for entry in self.store.inner.iter() {
            transport.unbind(&entry.stream_key, &self.mailbox);
        }
    }
}

// ============================================================================
// RUN LOOPS
// ============================================================================

/// Announce, then serve commands and report on every tick until `shutdown`
/// turns true or its sender is dropped
pub async fn run_instrumenter(
    mut agent: InstrumenterAgent,
    config: &AgentConfig,
    mut shutdown: watch::Receiver<bool>,
) -> FleetResult<()> {
    agent.announce()?;

    let mailbox = agent.mailbox().clone();
    let mut tick = interval(config.report_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !*shutdown.borrow() {
        tokio::select! {
            envelope = mailbox.recv() => match envelope {
                Some(envelope) => agent.handle(envelope).await,
                None => break,
            },
            _ = tick.tick() => {
                agent.report().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    agent.unbind();
    info!(target: "fleetstat::agent", hostname = %agent.hostname(), "Instrumenter stopped");
    Ok(())
}

/// Announce, then serve commands and data until `shutdown` turns true
pub async fn run_aggregator(
    mut agent: AggregatorAgent,
    mut shutdown: watch::Receiver<bool>,
) -> FleetResult<()> {
    agent.announce()?;

    let mailbox = agent.mailbox().clone();
    while !*shutdown.borrow() {
        tokio::select! {
            envelope = mailbox.recv() => match envelope {
                Some(envelope) => agent.handle(envelope),
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    agent.unbind();
    info!(target: "fleetstat::agent", hostname = %agent.hostname(), "Aggregator stopped");
    Ok(())
}

/// Hostname → latest per-host values, as seen by one aggregator. Used by the
/// demo to show what each host contributed.
pub fn split_by_host(value: &ReducedValue) -> HashMap<String, f64> {
    match value {
        ReducedValue::Discrete(groups) => groups
            .iter()
            .filter_map(|(host, v)| v.as_scalar().map(|s| (host.clone(), s)))
            .collect(),
        _ => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Bucketizer, Expr, FieldSpec, FieldValue};
    use crate::transport::LocalBus;
    use pretty_assertions::assert_eq;

    fn ops_descriptor() -> MetricDescriptor {
        MetricDescriptor::new("disk", "physio_ops", "I/O operations", "ops")
            .field(FieldSpec::attr("disk", "device name", "name"))
            .field(FieldSpec::fixed("optype", "operation type", &["read", "write"]))
            .with_extract(&["optype"], |point, cur, prev, _| {
                let counter = match point.get("optype")?.as_str()? {
                    "read" => "reads",
                    _ => "writes",
                };
                Some(cur.delta(prev, counter))
            })
    }

    fn disk(name: &str, t: i64, reads: f64, writes: f64) -> Sample {
        Sample::new(format!("sd:{}", name), t)
            .with_attr("name", name)
            .with_counter("reads", reads)
            .with_counter("writes", writes)
    }

    fn instrumenter(bus: &Arc<LocalBus>, host: &str, feed: &SampleFeed) -> InstrumenterAgent {
        let mut agent = InstrumenterAgent::new(bus.clone(), "fleetstat", host);
        agent.register_module("disk", "Disk I/O");
        agent.register_metric(ops_descriptor(), feed.factory()).unwrap();
        agent
    }

    fn enable(id: u64, decomposition: &[&str]) -> Envelope {
        Envelope::new(
            "fleetstat.config",
            "hq",
            Message::EnableInstrumentation {
                inst_id: InstId::new(id),
                inst_key: format!("fleetstat.instrumentation.{}", id),
                module: "disk".into(),
                stat: "physio_ops".into(),
                predicate: Predicate::trivial(),
                decomposition: decomposition.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    #[tokio::test]
    async fn test_sampled_metric_first_value_is_zero() {
        let feed = SampleFeed::new();
        feed.set(disk("sd0", 0, 10.0, 5.0));
        let descriptor = Arc::new(ops_descriptor());
        let query = CompiledQuery::compile(descriptor, Predicate::trivial(), &[]).unwrap();
        let mut metric = SampledMetric::new(query, Arc::new(MemorySource::new(feed.clone())));

        assert_eq!(metric.value().await.unwrap_err(), MetricError::NotInstrumented);
        metric.instrument().await.unwrap();
        assert_eq!(metric.value().await.unwrap(), ReducedValue::Scalar(0.0));

        feed.set(disk("sd0", 1_000_000_000, 13.0, 9.0));
        assert_eq!(metric.value().await.unwrap(), ReducedValue::Scalar(7.0));

        feed.fail("kstat chain changed");
        assert!(matches!(metric.value().await, Err(MetricError::Source { .. })));
    }

    #[test]
    fn test_register_metric_rules() {
        let bus = LocalBus::shared();
        let feed = SampleFeed::new();
        let mut agent = InstrumenterAgent::new(bus.clone(), "fleetstat", "web1");
        assert_eq!(
            agent.register_metric(ops_descriptor(), feed.factory()),
            Err(MetricError::UnknownModule {
                module: "disk".into()
            })
        );
        agent.register_module("disk", "Disk I/O");
        agent.register_module("disk", "ignored");
        agent.register_metric(ops_descriptor(), feed.factory()).unwrap();
        assert!(matches!(
            agent.register_metric(ops_descriptor(), feed.factory()),
            Err(MetricError::AlreadyRegistered { .. })
        ));

        let modules = agent.modules_info();
        assert_eq!(modules["disk"].label, "Disk I/O");
        let fields = &modules["disk"].stats["physio_ops"].fields;
        assert!(fields.contains_key("hostname"));
        assert!(fields.contains_key("optype"));
        assert_eq!(bus.subscribers("fleetstat.instrumenter.web1"), 1);
        assert_eq!(bus.subscribers("fleetstat.all"), 1);
    }

    #[tokio::test]
    async fn test_enable_report_disable() {
        let bus = LocalBus::shared();
        let coordinator = Mailbox::new();
        let stream = Mailbox::new();
        bus.bind("fleetstat.config", &coordinator);
        bus.bind("fleetstat.instrumentation.1", &stream);

        let feed = SampleFeed::new();
        feed.set(disk("sd0", 0, 0.0, 0.0));
        let mut agent = instrumenter(&bus, "web1", &feed);

        agent.handle(enable(1, &["optype"])).await;
        let ack = coordinator.drain().remove(0);
        assert_eq!(
            ack.message,
            Message::AckEnableInstrumentation {
                inst_id: InstId::new(1),
                status: AckStatus::Enabled,
                error: None
            }
        );
        assert_eq!(ack.hostname, "web1");

        assert_eq!(agent.report().await, 1);
        feed.set(disk("sd0", 1_000_000_000, 4.0, 1.0));
        assert_eq!(agent.report().await, 1);

        let values: Vec<ReducedValue> = stream
            .drain()
            .into_iter()
            .filter_map(|e| match e.message {
                Message::Data { value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], ReducedValue::Discrete(BTreeMap::new()));
        let ReducedValue::Discrete(groups) = &values[1] else {
            panic!("expected discrete value");
        };
        assert_eq!(groups["read"], ReducedValue::Scalar(4.0));
        assert_eq!(groups["write"], ReducedValue::Scalar(1.0));

        agent
            .handle(Envelope::new(
                "fleetstat.config",
                "hq",
                Message::DisableInstrumentation {
                    inst_id: InstId::new(1),
                },
            ))
            .await;
        assert_eq!(agent.active_count(), 0);
        assert_eq!(coordinator.drain()[0].message.kind(), "ack-disable_instrumentation");
    }

    #[tokio::test]
    async fn test_enable_failures_ack_with_error() {
        let bus = LocalBus::shared();
        let coordinator = Mailbox::new();
        bus.bind("fleetstat.config", &coordinator);
        let feed = SampleFeed::new();
        let mut agent = instrumenter(&bus, "web1", &feed);

        agent.handle(enable(1, &["zone"])).await;
        let mut unknown = enable(2, &[]);
        if let Message::EnableInstrumentation { stat, .. } = &mut unknown.message {
            *stat = "bogus".into();
        }
        agent.handle(unknown).await;

        for envelope in coordinator.drain() {
            let Message::AckEnableInstrumentation { status, error, .. } = envelope.message else {
                panic!("expected enable ack");
            };
            assert_eq!(status, AckStatus::Disabled);
            assert!(error.is_some());
        }
        assert_eq!(agent.active_count(), 0);

        // Unknown ids still ack disabled
        agent
            .handle(Envelope::new(
                "fleetstat.config",
                "hq",
                Message::DisableInstrumentation {
                    inst_id: InstId::new(77),
                },
            ))
            .await;
        let Message::AckDisableInstrumentation { status, .. } = &coordinator.drain()[0].message else {
            panic!("expected disable ack");
        };
        assert_eq!(*status, AckStatus::Disabled);
    }

    #[tokio::test]
    async fn test_failing_source_reports_error() {
        let bus = LocalBus::shared();
        let coordinator = Mailbox::new();
        bus.bind("fleetstat.config", &coordinator);
        let feed = SampleFeed::new();
        let mut agent = instrumenter(&bus, "web1", &feed);
        agent.handle(enable(1, &[])).await;
        coordinator.drain();

        feed.fail("device gone");
        assert_eq!(agent.report().await, 0);
        let Message::InstrumenterError { inst_id, error, status } =
            coordinator.drain().remove(0).message
        else {
            panic!("expected instrumenter error");
        };
        assert_eq!(inst_id, InstId::new(1));
        assert!(error.contains("device gone"));
        assert_eq!(status, AckStatus::Enabled);
    }

    #[test]
    fn test_aggregator_merges_per_second() {
        let bus = LocalBus::shared();
        let coordinator = Mailbox::new();
        bus.bind("fleetstat.config", &coordinator);
        let mut agg = AggregatorAgent::new(bus.clone(), "fleetstat", "agg1", 2);
        let id = InstId::new(3);

        agg.handle(Envelope::new(
            "fleetstat.config",
            "hq",
            Message::EnableAggregation {
                inst_id: id,
                key: "fleetstat.instrumentation.3".into(),
            },
        ));
        assert_eq!(coordinator.drain()[0].message.kind(), "ack-enable_aggregation");
        assert_eq!(bus.subscribers("fleetstat.instrumentation.3"), 1);

        let data = |host: &str, secs: i64, v: f64| {
            Envelope::new(
                format!("fleetstat.instrumenter.{}", host),
                host,
                Message::Data {
                    inst_id: id,
                    sampled_at: Timestamp::from_secs(secs),
                    value: ReducedValue::Scalar(v),
                },
            )
        };
        agg.handle(data("web1", 100, 2.0));
        agg.handle(data("web2", 100, 3.0));
        agg.handle(data("web1", 101, 1.0));
        assert_eq!(agg.value_at(id, 100), Some(ReducedValue::Scalar(5.0)));
        assert_eq!(agg.latest(id), Some((101, ReducedValue::Scalar(1.0))));

        agg.handle(data("web1", 102, 1.0));
        assert_eq!(agg.store().seconds(id), vec![101, 102]);

        // Mismatched shapes are dropped
        agg.handle(Envelope::new(
            "fleetstat.instrumenter.web3",
            "web3",
            Message::Data {
                inst_id: id,
                sampled_at: Timestamp::from_secs(102),
                value: ReducedValue::Discrete(BTreeMap::new()),
            },
        ));
        assert_eq!(agg.value_at(id, 102), Some(ReducedValue::Scalar(1.0)));

        agg.handle(Envelope::new(
            "fleetstat.config",
            "hq",
            Message::DisableAggregation { inst_id: id },
        ));
        assert!(agg.store().is_empty());
        assert_eq!(bus.subscribers("fleetstat.instrumentation.3"), 0);
    }

    #[test]
    fn test_aggregator_keeps_latest_value_per_host() {
        let bus = LocalBus::shared();
        let mut agg = AggregatorAgent::new(bus.clone(), "fleetstat", "agg1", 10);
        let id = InstId::new(4);
        agg.handle(Envelope::new(
            "fleetstat.config",
            "hq",
            Message::EnableAggregation {
                inst_id: id,
                key: "fleetstat.instrumentation.4".into(),
            },
        ));

        let data = |host: &str, nanos: i64, v: f64| {
            Envelope::new(
                format!("fleetstat.instrumenter.{}", host),
                host,
                Message::Data {
                    inst_id: id,
                    sampled_at: Timestamp::from_nanos(nanos),
                    value: ReducedValue::Scalar(v),
                },
            )
        };
        // Sub-second report interval: two reports from web1 in second 100
        agg.handle(data("web1", 100_000_000_000, 40.0));
        agg.handle(data("web1", 100_500_000_000, 40.0));
        assert_eq!(agg.value_at(id, 100), Some(ReducedValue::Scalar(40.0)));

        agg.handle(data("web2", 100_200_000_000, 30.0));
        assert_eq!(agg.value_at(id, 100), Some(ReducedValue::Scalar(70.0)));

        agg.handle(data("web1", 100_900_000_000, 45.0));
        assert_eq!(agg.value_at(id, 100), Some(ReducedValue::Scalar(75.0)));
    }

    #[tokio::test]
    async fn test_fleet_wide_numeric_decomposition() {
        let bus = LocalBus::shared();
        let feed = SampleFeed::new();
        let descriptor = MetricDescriptor::new("disk", "latency", "latency", "ops").field(
            FieldSpec::numeric("latency", "latency", Bucketizer::linear(10.0), |cur, prev, _| {
                let ops = cur.delta(prev, "ops");
                if ops <= 0.0 {
                    return vec![];
                }
                vec![FieldValue::from(cur.delta(prev, "time") / ops)]
            }),
        );
        let mut agent = InstrumenterAgent::new(bus.clone(), "fleetstat", "web1");
        agent.register_module("disk", "Disk I/O");
        agent.register_metric(descriptor, feed.factory()).unwrap();

        let stream = Mailbox::new();
        bus.bind("fleetstat.instrumentation.1", &stream);
        let mut env = enable(1, &["latency"]);
        if let Message::EnableInstrumentation {
            stat, predicate, ..
        } = &mut env.message
        {
            *stat = "latency".into();
            *predicate = Predicate::new(Expr::eq("hostname", "web1"));
        }
        agent.handle(env).await;
        assert!(agent.is_active(InstId::new(1)));

        feed.set(Sample::new("sd0", 0).with_counter("ops", 0.0).with_counter("time", 0.0));
        agent.report().await;
        feed.set(
            Sample::new("sd0", 1_000_000_000)
                .with_counter("ops", 4.0)
                .with_counter("time", 100.0),
        );
        agent.report().await;

        let last = stream.drain().pop().unwrap();
        let Message::Data {
            value: ReducedValue::Distribution(dist),
            ..
        } = last.message
        else {
            panic!("expected distribution");
        };
        assert_eq!(dist.weight_at(20.0), Some(1.0));
    }

    #[tokio::test]
    async fn test_run_loops_stop_on_shutdown_flag() {
        let bus = LocalBus::shared();
        let coordinator = Mailbox::new();
        bus.bind("fleetstat.config", &coordinator);
        let (stop, shutdown) = watch::channel(false);

        let feed = SampleFeed::new();
        let agent = instrumenter(&bus, "web1", &feed);
        let config = AgentConfig::default();
        let inst = tokio::spawn(async move { run_instrumenter(agent, &config, shutdown).await });
        let agg = tokio::spawn(run_aggregator(
            AggregatorAgent::new(bus.clone(), "fleetstat", "agg1", 10),
            stop.subscribe(),
        ));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stop.send_replace(true);
        let stopped = std::time::Duration::from_secs(1);
        tokio::time::timeout(stopped, inst).await.unwrap().unwrap().unwrap();
        tokio::time::timeout(stopped, agg).await.unwrap().unwrap().unwrap();

        let kinds: Vec<&str> = coordinator.drain().iter().map(|e| e.message.kind()).collect();
        assert!(kinds.contains(&"notify-instrumenter_online"));
        assert!(kinds.contains(&"notify-aggregator_online"));
        assert_eq!(bus.subscribers("fleetstat.instrumenter.web1"), 0);
        assert_eq!(bus.subscribers("fleetstat.all"), 0);

        // A flag raised before start stops the loop right after announcing
        let (_stop, shutdown) = watch::channel(true);
        let agg = AggregatorAgent::new(bus.clone(), "fleetstat", "agg2", 10);
        tokio::time::timeout(stopped, run_aggregator(agg, shutdown))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_split_by_host() {
        let mut groups = BTreeMap::new();
        groups.insert("web1".to_string(), ReducedValue::Scalar(2.0));
        groups.insert("web2".to_string(), ReducedValue::Scalar(5.0));
        let split = split_by_host(&ReducedValue::Discrete(groups));
        assert_eq!(split["web2"], 5.0);
        assert!(split_by_host(&ReducedValue::Scalar(1.0)).is_empty());
    }
}

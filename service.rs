// ============================================================================
// COORDINATOR SERVICE
// ============================================================================
// One tokio task owns the `Coordinator` and feeds it, one event at a time:
//   - request-layer calls arriving through `CoordinatorHandle`
//   - envelopes arriving on the coordinator's routing key
//   - deadline sweeps
// No lock guards engine state.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::config::CoordinatorConfig;
use crate::coordinator::{Coordinator, InstrumentationSpec, InstrumentationSummary, Responder};
use crate::error::{FleetResult, RequestError, RequestResult};
use crate::message::StatusReport;
use crate::registry::Catalog;
use crate::transport::{Mailbox, Publisher, Transport};
use crate::types::InstId;

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum Request {
    Create {
        spec: InstrumentationSpec,
        responder: Responder,
    },
    Delete {
        id: InstId,
        reply: oneshot::Sender<RequestResult<()>>,
    },
    ListMetrics {
        reply: oneshot::Sender<Catalog>,
    },
    ListInstrumentations {
        reply: oneshot::Sender<Vec<InstrumentationSummary>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Request-layer entry point. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    requests: mpsc::Sender<Request>,
    shutdown: Arc<Notify>,
}

impl CoordinatorHandle {
    async fn submit(&self, request: Request) -> RequestResult<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| RequestError::Unavailable)
    }

    /// Resolves once every participant has acked, or on the first failure
    pub async fn create_instrumentation(&self, spec: InstrumentationSpec) -> RequestResult<InstId> {
        let (responder, rx) = Responder::new();
        self.submit(Request::Create { spec, responder }).await?;
        rx.await.map_err(|_| RequestError::Unavailable)?
    }

    pub async fn delete_instrumentation(&self, id: InstId) -> RequestResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Delete { id, reply }).await?;
        rx.await.map_err(|_| RequestError::Unavailable)?
    }

    pub async fn list_metrics(&self) -> RequestResult<Catalog> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::ListMetrics { reply }).await?;
        rx.await.map_err(|_| RequestError::Unavailable)
    }

    pub async fn list_instrumentations(&self) -> RequestResult<Vec<InstrumentationSummary>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::ListInstrumentations { reply }).await?;
        rx.await.map_err(|_| RequestError::Unavailable)
    }

    pub async fn status(&self) -> RequestResult<StatusReport> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Status { reply }).await?;
        rx.await.map_err(|_| RequestError::Unavailable)
    }

    /// Ask the service loop to stop. Safe to call before it starts waiting.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct CoordinatorService {
    coordinator: Coordinator,
    requests: mpsc::Receiver<Request>,
    mailbox: Mailbox,
    transport: Arc<dyn Transport>,
    key: String,
    sweep_interval: Duration,
    shutdown: Arc<Notify>,
}

impl CoordinatorService {
    /// Build the service and its handle. Binds the coordinator's routing key
    /// right away so nothing sent before `run` is lost.
    pub fn new(config: &CoordinatorConfig, transport: Arc<dyn Transport>) -> (Self, CoordinatorHandle) {
        let key = crate::routing_key(&config.key_base, crate::COORDINATOR_KEY_SUFFIX);
        let publisher = Publisher::new(transport.clone(), key.clone(), config.effective_hostname());
        let coordinator = Coordinator::new(config, publisher);

        let mailbox = Mailbox::new();
        transport.bind(&key, &mailbox);

        let (tx, rx) = mpsc::channel(config.request_queue);
        let shutdown = Arc::new(Notify::new());

        let service = Self {
            coordinator,
            requests: rx,
            mailbox,
            transport,
            key,
            sweep_interval: config.sweep_interval,
            shutdown: shutdown.clone(),
        };
        let handle = CoordinatorHandle {
            requests: tx,
            shutdown,
        };
        (service, handle)
    }

    /// Build and run on the current runtime
    pub fn spawn(
        config: &CoordinatorConfig,
        transport: Arc<dyn Transport>,
    ) -> (CoordinatorHandle, JoinHandle<FleetResult<()>>) {
        let (service, handle) = Self::new(config, transport);
        (handle, tokio::spawn(service.run()))
    }

    pub fn routing_key(&self) -> &str {
        &self.key
    }

    pub async fn run(mut self) -> FleetResult<()> {
        info!(
            target: "fleetstat::coordinator",
            key = %self.key,
            sweep_ms = self.sweep_interval.as_millis() as u64,
            "Coordinator service started"
        );

        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!(target: "fleetstat::coordinator", "All handles dropped");
                        break;
                    }
                },
                envelope = self.mailbox.recv() => {
                    if let Some(envelope) = envelope {
                        trace!(
                            target: "fleetstat::coordinator",
                            kind = envelope.message.kind(),
                            hostname = %envelope.hostname,
                            "Received message"
                        );
                        self.coordinator.handle_message(envelope);
                    }
                }
                _ = sweep.tick() => {
                    let expired = self.coordinator.expire(Instant::now().into_std());
                    if expired > 0 {
                        debug!(target: "fleetstat::coordinator", expired, "Swept pending creations");
                    }
                }
                _ = self.shutdown.notified() => {
                    info!(target: "fleetstat::coordinator", "Shutdown notification received");
                    break;
                }
            }
        }

        self.transport.unbind(&self.key, &self.mailbox);
        info!(
            target: "fleetstat::coordinator",
            instrumentations = self.coordinator.len(),
            "Coordinator service stopped"
        );
        Ok(())
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Create { spec, responder } => {
                self.coordinator
                    .create_instrumentation(spec, responder, Instant::now().into_std());
            }
            Request::Delete { id, reply } => {
                let _ = reply.send(self.coordinator.delete_instrumentation(id));
            }
            Request::ListMetrics { reply } => {
                let _ = reply.send(self.coordinator.list_metrics());
            }
            Request::ListInstrumentations { reply } => {
                let _ = reply.send(self.coordinator.list_instrumentations());
            }
            Request::Status { reply } => {
                let _ = reply.send(self.coordinator.status());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckStatus, AgentInfo, Envelope, Message, ModuleInfo, StatInfo};
    use crate::transport::LocalBus;
    use std::collections::BTreeMap;

    fn config(ack_timeout: Duration) -> CoordinatorConfig {
        CoordinatorConfig {
            hostname: Some("hq".into()),
            ack_timeout,
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn modules() -> BTreeMap<String, ModuleInfo> {
        let mut stats = BTreeMap::new();
        stats.insert(
            "utilization".to_string(),
            StatInfo {
                label: "utilization".into(),
                unit: "percent".into(),
                fields: BTreeMap::new(),
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

    /// Minimal agent that acks every enable with `status`
    fn spawn_acker(bus: Arc<LocalBus>, host: &'static str, aggregator: bool, status: AckStatus) {
        let key = format!("fleetstat.test.{}", host);
        let mailbox = Mailbox::new();
        bus.bind(&key, &mailbox);
        let publisher = Publisher::new(bus, key, host);

        let online = if aggregator {
            Message::AggregatorOnline {
                agent: AgentInfo::current("aggregator"),
            }
        } else {
            Message::InstrumenterOnline {
                agent: AgentInfo::current("instrumenter"),
                modules: modules(),
            }
        };
        publisher.send("fleetstat.config", online).unwrap();

        tokio::spawn(async move {
            while let Some(envelope) = mailbox.recv().await {
                let reply = match envelope.message {
                    Message::EnableAggregation { inst_id, .. } => Message::AckEnableAggregation {
                        inst_id,
                        status: status.clone(),
                        error: None,
                    },
                    Message::EnableInstrumentation { inst_id, .. } => {
                        Message::AckEnableInstrumentation {
                            inst_id,
                            status: status.clone(),
                            error: None,
                        }
                    }
                    _ => continue,
                };
                publisher.reply(&envelope, reply).unwrap();
            }
        });
    }

    async fn wait_for_agents(handle: &CoordinatorHandle, instrumenters: usize, aggregators: usize) {
        for _ in 0..200 {
            let status = handle.status().await.unwrap();
            if status.instrumenters.len() == instrumenters && status.aggregators.len() == aggregators {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("agents never came online");
    }

    #[tokio::test]
    async fn test_end_to_end_through_handle() {
        let bus = LocalBus::shared();
        let (handle, task) = CoordinatorService::spawn(&config(Duration::from_secs(5)), bus.clone());
        spawn_acker(bus.clone(), "web1", false, AckStatus::Enabled);
        spawn_acker(bus.clone(), "agg1", true, AckStatus::Enabled);
        wait_for_agents(&handle, 1, 1).await;

        let catalog = handle.list_metrics().await.unwrap();
        assert!(catalog["cpu"].stats.contains_key("utilization"));

        let id = handle
            .create_instrumentation(InstrumentationSpec::new("cpu", "utilization"))
            .await
            .unwrap();
        assert_eq!(id, InstId::new(1));

        let list = handle.list_instrumentations().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].stat_type.dimension, 1);
        assert_eq!(list[0].stat_type.kind, "scalar");

        let err = handle.delete_instrumentation(InstId::new(9)).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 404);
        handle.delete_instrumentation(id).await.unwrap();
        assert!(handle.list_instrumentations().await.unwrap().is_empty());

        handle.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(bus.subscribers("fleetstat.config"), 0);
    }

    #[tokio::test]
    async fn test_silent_participant_times_out() {
        let bus = LocalBus::shared();
        let (handle, task) =
            CoordinatorService::spawn(&config(Duration::from_millis(50)), bus.clone());
        spawn_acker(bus.clone(), "agg1", true, AckStatus::Enabled);

        // An instrumenter that comes online and never answers
        let silent = Mailbox::new();
        bus.bind("fleetstat.test.web1", &silent);
        let env = Envelope::new(
            "fleetstat.test.web1",
            "web1",
            Message::InstrumenterOnline {
                agent: AgentInfo::current("instrumenter"),
                modules: modules(),
            },
        );
        bus.publish("fleetstat.config", env).unwrap();
        wait_for_agents(&handle, 1, 1).await;

        let err = handle
            .create_instrumentation(InstrumentationSpec::new("cpu", "utilization"))
            .await
            .unwrap_err();
        assert_eq!(err, RequestError::enable_failed("failed to enable some instrumenters"));

        let kinds: Vec<&str> = silent.drain().iter().map(|e| e.message.kind()).collect();
        assert_eq!(kinds, vec!["cmd-enable_instrumentation", "cmd-disable_instrumentation"]);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_aggregator_reply() {
        let bus = LocalBus::shared();
        let (handle, _task) = CoordinatorService::spawn(&config(Duration::from_secs(5)), bus.clone());
        spawn_acker(bus.clone(), "web1", false, AckStatus::Enabled);
        spawn_acker(bus.clone(), "agg1", true, AckStatus::Disabled);
        wait_for_agents(&handle, 1, 1).await;

        let err = handle
            .create_instrumentation(InstrumentationSpec::new("cpu", "utilization"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "error: failed to enable aggregator");
        assert_eq!(err.status().as_u16(), 500);
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_is_unavailable() {
        let bus = LocalBus::shared();
        let (handle, task) = CoordinatorService::spawn(&config(Duration::from_secs(5)), bus);
        handle.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(handle.status().await.unwrap_err(), RequestError::Unavailable);
    }
}

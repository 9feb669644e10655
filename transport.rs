// ============================================================================
// TRANSPORT
// ============================================================================
// Publish/subscribe plumbing. Components bind mailboxes to named routing
// keys; a publish delivers a copy of the envelope to every mailbox bound to
// the key. Delivery is best-effort and unordered across keys.
// ============================================================================

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use flume::{Receiver as FlumeReceiver, Sender as FlumeSender};
use tracing::{debug, trace};

use crate::error::{TransportError, TransportResult};
use crate::message::{Envelope, Message};

// ----------------------------------------------------------------------------
// Mailbox
// ----------------------------------------------------------------------------

/// Receiving end of one component. Cloning shares the same queue.
#[derive(Clone)]
pub struct Mailbox {
    sender: FlumeSender<Envelope>,
    receiver: FlumeReceiver<Envelope>,
}

impl Mailbox {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self { sender, receiver }
    }

    pub async fn recv(&self) -> Option<Envelope> {
        self.receiver.recv_async().await.ok()
    }

    /// Everything queued right now
    pub fn drain(&self) -> Vec<Envelope> {
        self.receiver.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    fn sender(&self) -> &FlumeSender<Envelope> {
        &self.sender
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Mailbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox").field("queued", &self.len()).finish()
    }
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

pub trait Transport: Send + Sync + Debug {
    /// Deliver `envelope` to every mailbox bound to `key`. Returns the
    /// number of mailboxes reached; zero is not an error.
    fn publish(&self, key: &str, envelope: Envelope) -> TransportResult<usize>;

    fn bind(&self, key: &str, mailbox: &Mailbox);

    fn unbind(&self, key: &str, mailbox: &Mailbox);
}

// ----------------------------------------------------------------------------
// Local Bus
// ----------------------------------------------------------------------------

/// Routing keys are non-empty and free of whitespace
fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.chars().any(char::is_whitespace)
}

/// In-process transport backed by flume channels
#[derive(Default)]
pub struct LocalBus {
    routes: DashMap<String, Vec<FlumeSender<Envelope>>>,
    published: AtomicU64,
    unrouted: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of mailboxes bound to `key`
    pub fn subscribers(&self, key: &str) -> usize {
        self.routes.get(key).map(|r| r.len()).unwrap_or(0)
    }

    pub fn published(&self) -> u64 {
        self.published.load(AtomicOrdering::Relaxed)
    }

    /// Publishes that reached no mailbox
    pub fn unrouted(&self) -> u64 {
        self.unrouted.load(AtomicOrdering::Relaxed)
    }
}

impl Transport for LocalBus {
    fn publish(&self, key: &str, envelope: Envelope) -> TransportResult<usize> {
        if !is_valid_key(key) {
            return Err(TransportError::invalid_key(key));
        }
        self.published.fetch_add(1, AtomicOrdering::Relaxed);

        let delivered = match self.routes.get_mut(key) {
            Some(mut senders) => {
                senders.retain(|s| !s.is_disconnected());
                let mut delivered = 0;
                for sender in senders.iter() {
                    if sender.send(envelope.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                delivered
            }
            None => 0,
        };

        if delivered == 0 {
            self.unrouted.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(
                target: "fleetstat::transport",
                key = %key,
                kind = envelope.message.kind(),
                "Message had no subscribers"
            );
        } else {
            trace!(
                target: "fleetstat::transport",
                key = %key,
                kind = envelope.message.kind(),
                delivered,
                "Message published"
            );
        }

        Ok(delivered)
    }

    fn bind(&self, key: &str, mailbox: &Mailbox) {
        let mut senders = self.routes.entry(key.to_string()).or_default();
        if !senders.iter().any(|s| s.same_channel(mailbox.sender())) {
            senders.push(mailbox.sender().clone());
        }
    }

    fn unbind(&self, key: &str, mailbox: &Mailbox) {
        if let Some(mut senders) = self.routes.get_mut(key) {
            senders.retain(|s| !s.same_channel(mailbox.sender()));
        }
        self.routes.remove_if(key, |_, senders| senders.is_empty());
    }
}

impl Debug for LocalBus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("routes", &self.routes.len())
            .field("published", &self.published())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Publisher
// ----------------------------------------------------------------------------

/// Stamps outgoing messages with this component's identity
#[derive(Debug, Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    source: String,
    hostname: String,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        source: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            source: source.into(),
            hostname: hostname.into(),
        }
    }

    /// Routing key replies come back on
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn send(&self, key: &str, message: Message) -> TransportResult<usize> {
        let envelope = Envelope::new(self.source.clone(), self.hostname.clone(), message);
        self.transport.publish(key, envelope)
    }

    /// Send to the routing key `to` came from
    pub fn reply(&self, to: &Envelope, message: Message) -> TransportResult<usize> {
        self.send(&to.source, message)
    }
}

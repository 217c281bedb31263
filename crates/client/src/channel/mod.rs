// Push channel manager: one long-lived connection per namespace.
//
// The manager hands out `Channel` handles. A channel owns the handler
// registry and the pending-ack table, so both outlive any single
// transport. Calling `connect` again with the same credential is a no-op;
// with a different credential the transport is torn down and reopened, and
// every registered event is replayed onto the new one.
//
// Connection status is published on a `watch` channel. Each time a
// transport (re)establishes its socket the channel's `established` count
// goes up, so owners of server-side state such as room membership can
// re-announce it.
//
// Transport is abstracted via `TransportFactory`/`PushTransport`. The
// WebSocket implementation lives in `ws`, the in-process one in `memory`.

pub mod ack;
pub mod memory;
pub mod registry;
pub mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use eventsync_common::protocol::push::{ClientEvent, Frame};

use crate::config::{AnonymousPolicy, NamespaceConfig};
use crate::lock;

pub use ack::{AckOutcome, AckTracker};
pub use registry::{HandlerRegistry, Subscription, SubscriptionId};

// ── Transport traits ────────────────────────────────────────────────

/// Connection state of a channel's current transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// One open connection to a namespace.
pub trait PushTransport: Send {
    /// Queue a frame for delivery.
    fn send(&self, frame: Frame) -> Result<()>;

    /// Start forwarding inbound frames for `events`. Additive.
    fn listen(&self, events: &[String]);

    /// Close the connection. Inbound delivery stops.
    fn close(&self);
}

/// Opens transports for the channel manager.
pub trait TransportFactory: Send + Sync {
    fn open(
        &self,
        namespace: &NamespaceConfig,
        credential: Option<&str>,
        sink: InboundSink,
    ) -> Result<Box<dyn PushTransport>>;
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("unknown namespace `{0}`")]
    UnknownNamespace(String),
    #[error("namespace `{0}` requires a credential")]
    CredentialRequired(String),
    #[error("namespace `{0}` is not connected")]
    NotConnected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

// ── Channel ─────────────────────────────────────────────────────────

struct Link {
    credential: Option<String>,
    transport: Box<dyn PushTransport>,
}

struct ChannelInner {
    namespace: String,
    registry: HandlerRegistry,
    acks: AckTracker,
    link: Mutex<Option<Link>>,
    status: watch::Sender<ConnectionStatus>,
    /// Times a transport reached `Connected`.
    established: AtomicU64,
    /// Bumped whenever the transport is replaced; stale sinks go quiet.
    generation: AtomicU64,
}

impl ChannelInner {
    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if status == ConnectionStatus::Connected {
                self.established.fetch_add(1, Ordering::SeqCst);
            }
            *current = status;
            true
        });
        if changed {
            debug!(namespace = %self.namespace, ?status, "push channel status");
        }
    }
}

/// Handle to one namespace's connection. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("namespace", &self.inner.namespace)
            .field("status", &self.status())
            .finish()
    }
}

impl Channel {
    fn new(namespace: &str) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                namespace: namespace.to_string(),
                registry: HandlerRegistry::new(),
                acks: AckTracker::new(),
                link: Mutex::new(None),
                status,
                established: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Watch status transitions. The current value counts as seen.
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// How many times a transport of this channel reached `Connected`.
    pub fn established(&self) -> u64 {
        self.inner.established.load(Ordering::SeqCst)
    }

    /// Whether a transport is attached (it may still be reconnecting).
    pub fn is_attached(&self) -> bool {
        lock(&self.inner.link).is_some()
    }

    /// Subscribe to an inbound event. Dropping the guard unsubscribes.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let subscription = self.inner.registry.on(event, handler);
        if let Some(link) = lock(&self.inner.link).as_ref() {
            link.transport.listen(&[event.to_string()]);
        }
        subscription
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.registry.off(id)
    }

    /// Fire-and-forget emit.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.send(Frame::new(event, payload))
    }

    pub fn emit_event(&self, event: ClientEvent) -> Result<(), ChannelError> {
        self.send(event.into_frame())
    }

    /// Emit and wait up to `timeout` for the server's acknowledgment.
    ///
    /// A missing acknowledgment is `Ok(AckOutcome::NoAck)`; only a channel
    /// that cannot send at all is an error.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<AckOutcome, ChannelError> {
        let (ack_id, rx) = self.inner.acks.register();
        if let Err(error) = self.send(Frame::new(event, payload).with_ack(ack_id)) {
            self.inner.acks.forget(ack_id);
            return Err(error);
        }
        let outcome = self.inner.acks.wait(ack_id, rx, timeout).await;
        if !outcome.is_acked() {
            debug!(namespace = %self.inner.namespace, event, ack_id, "no acknowledgment before timeout");
        }
        Ok(outcome)
    }

    pub async fn emit_event_with_ack(
        &self,
        event: ClientEvent,
        timeout: Duration,
    ) -> Result<AckOutcome, ChannelError> {
        let name = event.name();
        self.emit_with_ack(name, event.payload(), timeout).await
    }

    /// Acknowledgments still awaited.
    pub fn pending_acks(&self) -> usize {
        self.inner.acks.pending()
    }

    /// Close the transport. Handlers stay registered for the next `connect`.
    pub fn disconnect(&self) {
        let stale = lock(&self.inner.link).take();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(stale) = stale {
            stale.transport.close();
            info!(namespace = %self.inner.namespace, "push channel closed");
        }
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let link = lock(&self.inner.link);
        let Some(link) = link.as_ref() else {
            return Err(ChannelError::NotConnected(self.inner.namespace.clone()));
        };
        trace!(namespace = %self.inner.namespace, event = %frame.event, "emit");
        link.transport.send(frame).map_err(|error| ChannelError::Transport(format!("{error:#}")))
    }

    fn attach(
        &self,
        factory: &dyn TransportFactory,
        config: &NamespaceConfig,
        credential: Option<&str>,
    ) -> Result<(), ChannelError> {
        let mut link = lock(&self.inner.link);
        if let Some(current) = link.as_ref() {
            if current.credential.as_deref() == credential {
                return Ok(());
            }
            info!(namespace = %self.inner.namespace, "credential changed, recreating push connection");
        }
        if let Some(stale) = link.take() {
            stale.transport.close();
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_status(ConnectionStatus::Connecting);
        let sink = InboundSink { channel: Arc::downgrade(&self.inner), generation };

        let transport = match factory.open(config, credential, sink) {
            Ok(transport) => transport,
            Err(error) => {
                self.inner.set_status(ConnectionStatus::Disconnected);
                return Err(ChannelError::Transport(format!("{error:#}")));
            }
        };
        transport.listen(&self.inner.registry.events());
        *link = Some(Link { credential: credential.map(str::to_string), transport });
        info!(namespace = %self.inner.namespace, generation, anonymous = credential.is_none(), "push channel opened");
        Ok(())
    }
}

// ── Inbound sink ────────────────────────────────────────────────────

/// Where a transport delivers inbound frames and status changes.
///
/// Bound to one transport generation: once the channel replaces or closes
/// that transport, the sink drops everything it is handed.
#[derive(Clone)]
pub struct InboundSink {
    channel: Weak<ChannelInner>,
    generation: u64,
}

impl InboundSink {
    fn current(&self) -> Option<Arc<ChannelInner>> {
        let inner = self.channel.upgrade()?;
        (inner.generation.load(Ordering::SeqCst) == self.generation).then_some(inner)
    }

    pub fn is_live(&self) -> bool {
        self.current().is_some()
    }

    /// Route one inbound frame. Returns false if the sink is stale.
    pub fn deliver(&self, frame: Frame) -> bool {
        let Some(inner) = self.current() else {
            trace!(event = %frame.event, "dropping frame from retired connection");
            return false;
        };
        if frame.is_ack_reply() {
            if let Some(ack_id) = frame.ack {
                inner.acks.resolve(ack_id, frame.data);
            }
            return true;
        }
        let handled = inner.registry.dispatch(&frame.event, &frame.data);
        if handled == 0 {
            trace!(namespace = %inner.namespace, event = %frame.event, "no handlers for event");
        }
        true
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        if let Some(inner) = self.current() {
            inner.set_status(status);
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// Owns one `Channel` per configured namespace.
pub struct ChannelManager {
    factory: Arc<dyn TransportFactory>,
    namespaces: HashMap<String, NamespaceConfig>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl ChannelManager {
    pub fn new(
        factory: impl TransportFactory + 'static,
        namespaces: impl IntoIterator<Item = NamespaceConfig>,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            namespaces: namespaces.into_iter().map(|ns| (ns.name.clone(), ns)).collect(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Get the channel for `namespace`, opening or re-opening its transport
    /// as needed.
    pub fn connect(&self, namespace: &str, credential: Option<&str>) -> Result<Channel, ChannelError> {
        let config = self
            .namespaces
            .get(namespace)
            .ok_or_else(|| ChannelError::UnknownNamespace(namespace.to_string()))?;
        if credential.is_none() && config.anonymous == AnonymousPolicy::Refuse {
            debug!(namespace, "no credential; not opening push channel");
            return Err(ChannelError::CredentialRequired(namespace.to_string()));
        }

        let channel = lock(&self.channels)
            .entry(namespace.to_string())
            .or_insert_with(|| Channel::new(namespace))
            .clone();
        channel.attach(self.factory.as_ref(), config, credential)?;
        Ok(channel)
    }

    /// The existing channel for `namespace`, connected or not.
    pub fn channel(&self, namespace: &str) -> Option<Channel> {
        lock(&self.channels).get(namespace).cloned()
    }

    pub fn disconnect_all(&self) {
        let channels: Vec<Channel> = lock(&self.channels).values().cloned().collect();
        for channel in channels {
            channel.disconnect();
        }
    }
}

// In-process push transport.
//
// Records every outbound frame and lets the owner inject inbound frames
// and status changes. Used for embedding without a network and in tests.
// An optional responder answers frames that request acknowledgment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use serde_json::Value;

use eventsync_common::protocol::push::Frame;

use super::{ConnectionStatus, InboundSink, PushTransport, TransportFactory};
use crate::config::NamespaceConfig;
use crate::lock;

pub type AckResponder = Arc<dyn Fn(&Frame) -> Option<Value> + Send + Sync>;

#[derive(Clone)]
struct LinkState {
    namespace: String,
    credential: Option<String>,
    sink: InboundSink,
    sent: Arc<Mutex<Vec<Frame>>>,
    listened: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Hub {
    links: Vec<LinkState>,
    responder: Option<AckResponder>,
    fail_next_open: Option<String>,
}

#[derive(Clone, Default)]
pub struct MemoryTransportFactory {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer ack-requesting frames with `responder`'s payload (`None` = stay silent).
    pub fn with_ack_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&Frame) -> Option<Value> + Send + Sync + 'static,
    {
        lock(&self.hub).responder = Some(Arc::new(responder));
        self
    }

    /// Make the next `open` fail with `reason`.
    pub fn fail_next_open(&self, reason: &str) {
        lock(&self.hub).fail_next_open = Some(reason.to_string());
    }

    pub fn open_count(&self, namespace: &str) -> usize {
        lock(&self.hub).links.iter().filter(|link| link.namespace == namespace).count()
    }

    /// Credential used by the newest link of `namespace`; `None` if never opened.
    pub fn credential(&self, namespace: &str) -> Option<Option<String>> {
        self.latest(namespace).map(|link| link.credential)
    }

    /// Frames sent over the newest link of `namespace`.
    pub fn sent(&self, namespace: &str) -> Vec<Frame> {
        self.latest(namespace).map(|link| lock(&link.sent).clone()).unwrap_or_default()
    }

    pub fn sent_events(&self, namespace: &str) -> Vec<String> {
        self.sent(namespace).into_iter().map(|frame| frame.event).collect()
    }

    pub fn clear_sent(&self, namespace: &str) {
        if let Some(link) = self.latest(namespace) {
            lock(&link.sent).clear();
        }
    }

    pub fn listened(&self, namespace: &str) -> Vec<String> {
        self.latest(namespace).map(|link| lock(&link.listened).clone()).unwrap_or_default()
    }

    /// Whether the `index`-th link opened for `namespace` was closed.
    pub fn is_closed(&self, namespace: &str, index: usize) -> bool {
        self.nth(namespace, index).is_some_and(|link| link.closed.load(Ordering::SeqCst))
    }

    /// Deliver an inbound event over the newest link of `namespace`.
    pub fn push(&self, namespace: &str, event: &str, data: Value) -> bool {
        match self.latest(namespace) {
            Some(link) => deliver(&link, Frame::new(event, data)),
            None => false,
        }
    }

    /// Deliver an inbound event over a specific (possibly retired) link.
    pub fn push_via(&self, namespace: &str, index: usize, event: &str, data: Value) -> bool {
        match self.nth(namespace, index) {
            Some(link) => deliver(&link, Frame::new(event, data)),
            None => false,
        }
    }

    pub fn set_status(&self, namespace: &str, status: ConnectionStatus) {
        if let Some(link) = self.latest(namespace) {
            link.sink.set_status(status);
        }
    }

    /// Report a status change from a specific (possibly retired) link.
    pub fn set_status_via(&self, namespace: &str, index: usize, status: ConnectionStatus) {
        if let Some(link) = self.nth(namespace, index) {
            link.sink.set_status(status);
        }
    }

    /// Simulate the transport losing its socket and reconnecting.
    pub fn bounce(&self, namespace: &str) {
        self.set_status(namespace, ConnectionStatus::Disconnected);
        self.set_status(namespace, ConnectionStatus::Connecting);
        self.set_status(namespace, ConnectionStatus::Connected);
    }

    fn latest(&self, namespace: &str) -> Option<LinkState> {
        lock(&self.hub).links.iter().rev().find(|link| link.namespace == namespace).cloned()
    }

    fn nth(&self, namespace: &str, index: usize) -> Option<LinkState> {
        lock(&self.hub).links.iter().filter(|link| link.namespace == namespace).nth(index).cloned()
    }
}

fn deliver(link: &LinkState, frame: Frame) -> bool {
    if link.closed.load(Ordering::SeqCst) || !lock(&link.listened).contains(&frame.event) {
        return false;
    }
    link.sink.deliver(frame)
}

impl TransportFactory for MemoryTransportFactory {
    fn open(
        &self,
        namespace: &NamespaceConfig,
        credential: Option<&str>,
        sink: InboundSink,
    ) -> Result<Box<dyn PushTransport>> {
        let mut hub = lock(&self.hub);
        if let Some(reason) = hub.fail_next_open.take() {
            bail!("{reason}");
        }
        let state = LinkState {
            namespace: namespace.name.clone(),
            credential: credential.map(str::to_string),
            sink: sink.clone(),
            sent: Arc::default(),
            listened: Arc::default(),
            closed: Arc::default(),
        };
        hub.links.push(state.clone());
        let transport = MemoryTransport { state, responder: hub.responder.clone() };
        drop(hub);

        sink.set_status(ConnectionStatus::Connected);
        Ok(Box::new(transport))
    }
}

struct MemoryTransport {
    state: LinkState,
    responder: Option<AckResponder>,
}

impl PushTransport for MemoryTransport {
    fn send(&self, frame: Frame) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            bail!("memory transport for `{}` is closed", self.state.namespace);
        }
        let reply = match (frame.ack, self.responder.as_ref()) {
            (Some(ack_id), Some(responder)) => {
                responder(&frame).map(|payload| Frame::ack_reply(ack_id, payload))
            }
            _ => None,
        };
        lock(&self.state.sent).push(frame);
        if let Some(reply) = reply {
            self.state.sink.deliver(reply);
        }
        Ok(())
    }

    fn listen(&self, events: &[String]) {
        let mut listened = lock(&self.state.listened);
        for event in events {
            if !listened.contains(event) {
                listened.push(event.clone());
            }
        }
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.sink.set_status(ConnectionStatus::Disconnected);
    }
}

// WebSocket push transport (tokio-tungstenite).
//
// Each open transport owns one background task that connects, pumps
// frames both ways, and reconnects with exponential backoff when the
// socket drops. Outbound frames queue while disconnected and flush after
// the next successful connect.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, trace, warn};
use url::Url;

use eventsync_common::protocol::push::Frame;

use super::{ConnectionStatus, InboundSink, PushTransport, TransportFactory};
use crate::config::{NamespaceConfig, ReconnectConfig};
use crate::lock;

// ── Reconnect policy ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            max_attempts: config.max_attempts.unwrap_or(u32::MAX),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `consecutive_failures` failures.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.min(7);
        let delay = DurationSaturatingMul::saturating_mul(self.base_delay, 1u64 << exp);
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, consecutive_failures: u32) -> bool {
        consecutive_failures < self.max_attempts
    }
}

trait DurationSaturatingMul {
    fn saturating_mul(self, rhs: u64) -> Self;
}

impl DurationSaturatingMul for Duration {
    fn saturating_mul(self, rhs: u64) -> Self {
        let nanos = self.as_nanos().saturating_mul(rhs as u128);
        if nanos > u64::MAX as u128 {
            Duration::from_secs(u64::MAX)
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

// ── Endpoint ────────────────────────────────────────────────────────

/// Build the connect URL: `wss://` required, `ws://` only for loopback.
/// The credential rides along as a `token` query parameter.
pub fn endpoint_url(value: &str, credential: Option<&str>) -> Result<Url> {
    let mut url =
        Url::parse(value).map_err(|error| anyhow!("invalid namespace url `{value}`: {error}"))?;
    match url.scheme() {
        "wss" => {}
        "ws" if is_loopback_host(url.host_str()) => {}
        _ => return Err(anyhow!("namespace url must use wss (ws is allowed only for localhost)")),
    }
    if let Some(token) = credential {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

// ── Factory ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct WsTransportFactory {
    policy: ReconnectPolicy,
}

impl WsTransportFactory {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self { policy: ReconnectPolicy::from(config) }
    }

    pub fn with_policy(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }
}

impl TransportFactory for WsTransportFactory {
    fn open(
        &self,
        namespace: &NamespaceConfig,
        credential: Option<&str>,
        sink: InboundSink,
    ) -> Result<Box<dyn PushTransport>> {
        let url = endpoint_url(&namespace.url, credential)?;
        let handle = tokio::runtime::Handle::try_current()
            .context("websocket transport must be opened inside a tokio runtime")?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listened = Arc::new(Mutex::new(HashSet::new()));

        handle.spawn(run_connection(Connection {
            url,
            namespace: namespace.name.clone(),
            policy: self.policy.clone(),
            outbound: outbound_rx,
            listened: Arc::clone(&listened),
            sink,
            shutdown: shutdown_rx,
        }));

        Ok(Box::new(WsTransport { outbound: outbound_tx, listened, shutdown: shutdown_tx }))
    }
}

// ── Transport handle ────────────────────────────────────────────────

struct WsTransport {
    outbound: mpsc::UnboundedSender<Frame>,
    listened: Arc<Mutex<HashSet<String>>>,
    shutdown: watch::Sender<bool>,
}

impl PushTransport for WsTransport {
    fn send(&self, frame: Frame) -> Result<()> {
        self.outbound.send(frame).map_err(|_| anyhow!("websocket connection task has stopped"))
    }

    fn listen(&self, events: &[String]) {
        lock(&self.listened).extend(events.iter().cloned());
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

// ── Connection task ─────────────────────────────────────────────────

struct Connection {
    url: Url,
    namespace: String,
    policy: ReconnectPolicy,
    outbound: mpsc::UnboundedReceiver<Frame>,
    listened: Arc<Mutex<HashSet<String>>>,
    sink: InboundSink,
    shutdown: watch::Receiver<bool>,
}

enum PumpExit {
    Shutdown,
    Dropped(String),
}

async fn run_connection(mut conn: Connection) {
    let mut consecutive_failures: u32 = 0;
    loop {
        if *conn.shutdown.borrow() || !conn.sink.is_live() {
            break;
        }
        conn.sink.set_status(ConnectionStatus::Connecting);

        let connected = tokio::select! {
            result = connect_async(conn.url.as_str()) => result,
            _ = conn.shutdown.changed() => break,
        };
        match connected {
            Ok((stream, _response)) => {
                consecutive_failures = 0;
                conn.sink.set_status(ConnectionStatus::Connected);
                info!(namespace = %conn.namespace, "push channel connected");
                match pump(stream, &mut conn).await {
                    PumpExit::Shutdown => break,
                    PumpExit::Dropped(reason) => {
                        warn!(namespace = %conn.namespace, reason = %reason, "push channel dropped");
                    }
                }
            }
            Err(error) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                warn!(
                    namespace = %conn.namespace,
                    error = %error,
                    consecutive_failures,
                    "push channel connect failed"
                );
            }
        }

        conn.sink.set_status(ConnectionStatus::Disconnected);
        if !conn.policy.should_retry(consecutive_failures) {
            warn!(namespace = %conn.namespace, consecutive_failures, "giving up on push channel");
            break;
        }
        let delay = conn.policy.delay(consecutive_failures);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = conn.shutdown.changed() => break,
        }
    }
    conn.sink.set_status(ConnectionStatus::Disconnected);
    trace!(namespace = %conn.namespace, "push connection task finished");
}

async fn pump(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, conn: &mut Connection) -> PumpExit {
    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            _ = conn.shutdown.changed() => {
                let _ = writer.send(Message::Close(None)).await;
                return PumpExit::Shutdown;
            }
            frame = conn.outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = writer.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                };
                let encoded = match serde_json::to_string(&frame) {
                    Ok(encoded) => encoded,
                    Err(error) => {
                        warn!(event = %frame.event, error = %error, "failed to encode push frame");
                        continue;
                    }
                };
                if let Err(error) = writer.send(Message::Text(encoded.into())).await {
                    return PumpExit::Dropped(error.to_string());
                }
            }
            message = reader.next() => match message {
                Some(Ok(Message::Text(payload))) => handle_inbound(&payload, &conn.listened, &conn.sink),
                Some(Ok(Message::Close(_))) | None => {
                    return PumpExit::Dropped("closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return PumpExit::Dropped(error.to_string()),
            },
        }
    }
}

fn handle_inbound(payload: &str, listened: &Mutex<HashSet<String>>, sink: &InboundSink) {
    let frame: Frame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(error = %error, "dropping malformed push frame");
            return;
        }
    };
    if !frame.is_ack_reply() && !lock(listened).contains(&frame.event) {
        trace!(event = %frame.event, "ignoring event with no listener");
        return;
    }
    sink.deliver(frame);
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use eventsync_client::api::{ChatApi, LoadError};
use eventsync_client::channel::ws::{ReconnectPolicy, WsTransportFactory};
use eventsync_client::channel::{AckOutcome, ChannelManager, ConnectionStatus};
use eventsync_client::chat::{ChatSession, ChatUpdate};
use eventsync_client::config::{AnonymousPolicy, ChatConfig, NamespaceConfig};
use eventsync_common::protocol::push::Frame;
use eventsync_common::types::{ChatMessage, HistoryPage};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async, WebSocketStream};

type ServerSocket = WebSocketStream<TcpStream>;

fn namespace(addr: std::net::SocketAddr) -> NamespaceConfig {
    NamespaceConfig {
        name: "actor".into(),
        url: format!("ws://{addr}/actor"),
        anonymous: AnonymousPolicy::BestEffort,
    }
}

fn fast_reconnect() -> WsTransportFactory {
    WsTransportFactory::with_policy(ReconnectPolicy {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        max_attempts: u32::MAX,
    })
}

async fn send_frame(socket: &mut ServerSocket, frame: Frame) {
    let encoded = serde_json::to_string(&frame).expect("frame should encode");
    socket.send(Message::Text(encoded.into())).await.expect("server should send frame");
}

async fn recv_frame(socket: &mut ServerSocket) -> Frame {
    loop {
        let message = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("client frame should arrive")
            .expect("socket should stay open")
            .expect("frame should be readable");
        if let Message::Text(payload) = message {
            return serde_json::from_str(&payload).expect("client frame should decode");
        }
    }
}

async fn wait_for_status(channel: &eventsync_client::channel::Channel, status: ConnectionStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while channel.status() != status {
        assert!(Instant::now() < deadline, "channel never reached {status:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn ack_and_listened_events_cross_a_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    let (uri_tx, mut uri_rx) = mpsc::unbounded_channel::<String>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("client should connect");
        let record_uri = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let _ = uri_tx.send(request.uri().to_string());
            Ok(response)
        };
        let mut socket = accept_hdr_async(stream, record_uri).await.expect("handshake should succeed");

        let join = recv_frame(&mut socket).await;
        assert_eq!(join.event, "joinRoom");
        let ack_id = join.ack.expect("join should request an ack");
        send_frame(&mut socket, Frame::ack_reply(ack_id, json!({"ok": true}))).await;

        // Not subscribed: must be filtered out before any handler.
        send_frame(&mut socket, Frame::new("chat:typing", json!({"roomId": "a", "isTyping": true}))).await;
        send_frame(&mut socket, Frame::new("chat:deleted", json!({"roomId": "a", "msgId": "m1"}))).await;

        let _ = socket.next().await;
    });

    let manager = ChannelManager::new(fast_reconnect(), vec![namespace(addr)]);
    let channel = manager.connect("actor", Some("secret")).expect("channel should open");
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(String, Value)>();
    let _deleted = channel.on("chat:deleted", move |data| {
        let _ = event_tx.send(("chat:deleted".into(), data.clone()));
    });

    let outcome = channel
        .emit_with_ack("joinRoom", json!({"roomId": "a"}), Duration::from_secs(5))
        .await
        .expect("emit should be accepted");
    assert_eq!(outcome, AckOutcome::Acked(json!({"ok": true})));
    wait_for_status(&channel, ConnectionStatus::Connected).await;

    let (event, data) = timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("listened event should arrive")
        .expect("handler channel open");
    assert_eq!(event, "chat:deleted");
    assert_eq!(data["msgId"], "m1");
    assert!(event_rx.try_recv().is_err());

    let uri = uri_rx.recv().await.expect("handshake uri recorded");
    assert_eq!(uri, "/actor?token=secret");

    manager.disconnect_all();
    timeout(Duration::from_secs(5), server).await.expect("server should finish").expect("server task");
}

#[tokio::test]
async fn transport_reconnects_and_keeps_subscriptions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");

    let server = tokio::spawn(async move {
        // First connection is dropped straight away.
        let (stream, _) = listener.accept().await.expect("first connection");
        let socket = accept_async(stream).await.expect("first handshake");
        drop(socket);

        let (stream, _) = listener.accept().await.expect("reconnection");
        let mut socket = accept_async(stream).await.expect("second handshake");
        send_frame(&mut socket, Frame::new("chat:seen", json!({"roomId": "a", "msgIds": ["m1"]}))).await;
        let _ = socket.next().await;
    });

    let manager = ChannelManager::new(fast_reconnect(), vec![namespace(addr)]);
    let channel = manager.connect("actor", None).expect("channel should open");
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let _seen = channel.on("chat:seen", move |data| {
        let _ = tx.send(data.clone());
    });

    let data = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event should arrive after reconnect")
        .expect("handler channel open");
    assert_eq!(data["msgIds"], json!(["m1"]));
    assert_eq!(channel.status(), ConnectionStatus::Connected);

    manager.disconnect_all();
    timeout(Duration::from_secs(5), server).await.expect("server should finish").expect("server task");
}

/// History that is empty on join and holds a missed message afterwards.
#[derive(Default)]
struct MissedWhileAway {
    fetches: Mutex<usize>,
}

impl ChatApi for MissedWhileAway {
    async fn fetch_history(
        &self,
        room_id: &str,
        _before: Option<&str>,
        _limit: u32,
    ) -> Result<HistoryPage, LoadError> {
        let fetch = {
            let mut fetches = self.fetches.lock().unwrap();
            *fetches += 1;
            *fetches
        };
        if fetch == 1 {
            return Ok(HistoryPage::default());
        }
        Ok(HistoryPage {
            messages: vec![ChatMessage {
                id: "missed".into(),
                room_id: room_id.into(),
                sender_id: "them".into(),
                text: "sent while the socket was down".into(),
                attachments: Vec::new(),
                created_at: Utc::now(),
                seen_by_me: false,
            }],
            next_cursor: None,
        })
    }

    async fn mark_seen(&self, _room_id: &str, _ids: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_system(&self, _room_id: &str, _text: &str, _files: &[String]) -> anyhow::Result<Option<ChatMessage>> {
        Ok(None)
    }
}

#[tokio::test]
async fn dropped_socket_rejoins_the_room_and_merges_missed_history() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    let (rejoin_tx, mut rejoin_rx) = mpsc::unbounded_channel::<Frame>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("first connection");
        let mut socket = accept_async(stream).await.expect("first handshake");
        let join = recv_frame(&mut socket).await;
        assert_eq!(join.event, "joinRoom");
        let ack_id = join.ack.expect("join should request an ack");
        send_frame(&mut socket, Frame::ack_reply(ack_id, json!({"ok": true}))).await;
        drop(socket);

        let (stream, _) = listener.accept().await.expect("reconnection");
        let mut socket = accept_async(stream).await.expect("second handshake");
        let _ = rejoin_tx.send(recv_frame(&mut socket).await);
        let _ = socket.next().await;
    });

    let manager = ChannelManager::new(fast_reconnect(), vec![namespace(addr)]);
    let channel = manager.connect("actor", Some("secret")).expect("channel should open");
    let api = Arc::new(MissedWhileAway::default());
    let mut session = ChatSession::new(channel, Arc::clone(&api), ChatConfig::default(), "me");

    assert!(session.join("a").await.expect("join should succeed").is_empty());

    let update = timeout(Duration::from_secs(5), session.next_update())
        .await
        .expect("reconnect should produce an update");
    assert_eq!(update, Some(ChatUpdate::View));
    let ids: Vec<String> = session.view().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["missed".to_string()]);
    assert_eq!(*api.fetches.lock().unwrap(), 2);

    let rejoin = timeout(Duration::from_secs(5), rejoin_rx.recv())
        .await
        .expect("second socket should see a frame")
        .expect("server task alive");
    assert_eq!(rejoin.event, "joinRoom");
    assert_eq!(rejoin.data["roomId"], "a");

    drop(session);
    manager.disconnect_all();
    timeout(Duration::from_secs(5), server).await.expect("server should finish").expect("server task");
}

#[tokio::test]
async fn plain_ws_to_a_remote_host_is_refused() {
    let manager = ChannelManager::new(
        WsTransportFactory::default(),
        vec![NamespaceConfig {
            name: "actor".into(),
            url: "ws://events.example.com/actor".into(),
            anonymous: AnonymousPolicy::BestEffort,
        }],
    );
    assert!(manager.connect("actor", Some("t")).is_err());
}

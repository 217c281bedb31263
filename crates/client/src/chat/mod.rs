// Room-scoped chat session over one push channel.
//
// Ties together membership, the merged message buffer, outbound typing,
// the remote typing indicator, and seen tracking for whichever room is
// active. Inbound events arrive through channel handlers into a queue and
// are applied only while their room is accepted by the membership state,
// so leaving a room cuts off its live ingestion even for events already
// queued.
//
// The server forgets room membership when the socket drops. Whenever the
// channel re-establishes, the session rejoins the active room and folds
// the newest history page back in.

pub mod membership;
pub mod merge;
pub mod seen;
pub mod typing;

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use eventsync_common::protocol::push::{ClientEvent, ServerEvent, CHAT_EVENTS};
use eventsync_common::types::{local_id, ChatMessage};

use crate::api::{Attachment, AttachmentUploader, ChatApi, LoadError};
use crate::channel::{AckOutcome, Channel, ChannelError, ConnectionStatus, Subscription};
use crate::config::ChatConfig;

pub use membership::{MembershipAction, MembershipState, RoomMembership};
pub use merge::{merge, IngestOutcome, LoadState, MessageBuffer};
pub use seen::{SeenBatch, SeenTracker, Viewport};
pub use typing::{TypingEmit, TypingIndicator, TypingSignal};

/// Something the UI should re-render for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdate {
    /// The merged message view changed.
    View,
    /// The remote typing indicator turned on or off.
    TheirTyping(bool),
    /// A seen batch was accepted by the server.
    SeenSubmitted(Vec<String>),
}

/// How a system message reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Acknowledged over the push channel.
    Pushed { message_id: Option<String> },
    /// No acknowledgment; delivered through the REST fallback.
    Posted { message_id: Option<String> },
}

struct ActiveRoom {
    buffer: MessageBuffer,
    typing: TypingSignal,
    indicator: TypingIndicator,
    seen: SeenTracker,
}

impl ActiveRoom {
    fn new(room_id: &str, me: &str, config: &ChatConfig) -> Self {
        Self {
            buffer: MessageBuffer::new(room_id),
            typing: TypingSignal::from_config(config),
            indicator: TypingIndicator::from_config(config),
            seen: SeenTracker::new(room_id, me, config.seen_debounce()),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.typing.next_deadline(), self.indicator.their_typing_until(), self.seen.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }
}

pub struct ChatSession<A> {
    channel: Channel,
    api: Arc<A>,
    config: ChatConfig,
    me: String,
    membership: RoomMembership,
    room: Option<ActiveRoom>,
    inbound: mpsc::UnboundedReceiver<ServerEvent>,
    status: watch::Receiver<ConnectionStatus>,
    /// Channel `established` count already accounted for.
    established: u64,
    updates: VecDeque<ChatUpdate>,
    _subscriptions: Vec<Subscription>,
}

impl<A: ChatApi> ChatSession<A> {
    pub fn new(channel: Channel, api: Arc<A>, config: ChatConfig, me: impl Into<String>) -> Self {
        let (tx, inbound) = mpsc::unbounded_channel();
        let subscriptions = CHAT_EVENTS
            .iter()
            .map(|event| {
                let tx = tx.clone();
                let name = (*event).to_string();
                channel.on(event, move |payload| match ServerEvent::decode(&name, payload) {
                    Ok(decoded) => {
                        let _ = tx.send(decoded);
                    }
                    Err(error) => warn!(event = %name, error = %error, "dropping undecodable chat event"),
                })
            })
            .collect();

        let status = channel.status_changes();
        let established = channel.established();
        Self {
            channel,
            api,
            config,
            me: me.into(),
            membership: RoomMembership::new(),
            room: None,
            inbound,
            status,
            established,
            updates: VecDeque::new(),
            _subscriptions: subscriptions,
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn membership(&self) -> &MembershipState {
        self.membership.state()
    }

    pub fn active_room(&self) -> Option<&str> {
        self.membership.active_room()
    }

    pub fn view(&self) -> Vec<ChatMessage> {
        self.room.as_ref().map(|room| room.buffer.view()).unwrap_or_default()
    }

    pub fn load_state(&self) -> Option<&LoadState> {
        self.room.as_ref().map(|room| room.buffer.load_state())
    }

    pub fn their_typing(&self) -> bool {
        self.room.as_ref().is_some_and(|room| room.indicator.is_typing())
    }

    // ── Membership ───────────────────────────────────────────────────

    /// Join `room_id`, leaving the current room first, then load the newest
    /// history page. A history failure is reported through `load_state`.
    pub async fn join(&mut self, room_id: &str) -> Result<Vec<ChatMessage>, ChannelError> {
        let actions = self.membership.request_join(room_id);
        if actions.is_empty() {
            return Ok(self.view());
        }
        for action in actions {
            match action {
                MembershipAction::Leave(previous) => self.leave_room(&previous),
                MembershipAction::Join(next) => {
                    self.room = Some(ActiveRoom::new(&next, &self.me, &self.config));
                    let event = ClientEvent::JoinRoom { room_id: next.clone() };
                    match self.channel.emit_event_with_ack(event, self.config.ack_timeout()).await {
                        Ok(outcome) => {
                            self.membership.confirm_joined(&next, Utc::now());
                            info!(room_id = %next, acked = outcome.is_acked(), "joined room");
                        }
                        Err(error) => {
                            self.membership.reset();
                            self.room = None;
                            return Err(error);
                        }
                    }
                }
            }
        }
        if let Err(error) = self.load_older().await {
            warn!(room_id, error = %error, "initial history load failed");
        }
        Ok(self.view())
    }

    /// Leave the active room. Fire-and-forget.
    pub fn leave(&mut self) {
        if let Some(MembershipAction::Leave(room_id)) = self.membership.request_leave() {
            self.leave_room(&room_id);
            self.membership.confirm_left();
        }
    }

    fn leave_room(&mut self, room_id: &str) {
        if let Some(mut room) = self.room.take() {
            if let Some(stop) = room.typing.cancel() {
                emit_typing(&self.channel, room_id, stop);
            }
        }
        if let Err(error) = self.channel.emit_event(ClientEvent::LeaveRoom { room_id: room_id.to_string() }) {
            debug!(room_id, error = %error, "leave not sent");
        }
        info!(room_id, "left room");
    }

    // ── History ──────────────────────────────────────────────────────

    pub async fn load_older(&mut self) -> Result<Vec<ChatMessage>, LoadError> {
        let limit = self.config.history_page_limit();
        let api = Arc::clone(&self.api);
        match self.room.as_mut() {
            Some(room) => room.buffer.load_older(api.as_ref(), limit).await,
            None => Ok(Vec::new()),
        }
    }

    /// After the channel reconnects: re-announce the room and fold the
    /// newest history page into the buffer.
    pub async fn resync(&mut self) -> Result<(), LoadError> {
        let Some(room_id) = self.membership.active_room().map(str::to_string) else {
            return Ok(());
        };
        if let Err(error) = self.channel.emit_event(ClientEvent::JoinRoom { room_id: room_id.clone() }) {
            debug!(room_id = %room_id, error = %error, "rejoin not sent");
        }
        let page = self.api.fetch_history(&room_id, None, self.config.history_page_limit()).await?;
        if let Some(room) = self.room.as_mut().filter(|room| room.buffer.room_id() == room_id) {
            room.buffer.apply_resync(page);
            self.updates.push_back(ChatUpdate::View);
        }
        Ok(())
    }

    /// Whether the channel came back after a drop since the last check.
    /// The very first connection does not count, but a reconnect that lands
    /// before the first one was observed does.
    fn reestablished(&mut self) -> bool {
        let connected = *self.status.borrow_and_update() == ConnectionStatus::Connected;
        let established = self.channel.established();
        if !connected || established <= self.established {
            return false;
        }
        self.established = established;
        established > 1
    }

    // ── Inbound ──────────────────────────────────────────────────────

    pub fn apply(&mut self, event: ServerEvent) -> Option<ChatUpdate> {
        self.apply_at(event, Instant::now())
    }

    pub fn apply_at(&mut self, event: ServerEvent, now: Instant) -> Option<ChatUpdate> {
        if !self.membership.accepts(event.room_id()) {
            debug!(room_id = %event.room_id(), event = event.name(), "ignoring event for inactive room");
            return None;
        }
        let room = self.room.as_mut()?;
        match event {
            ServerEvent::ChatNew { msg, .. } | ServerEvent::ChatSystem { msg, .. } => {
                match room.buffer.ingest_live(msg) {
                    IngestOutcome::Duplicate => None,
                    IngestOutcome::Appended | IngestOutcome::Updated => Some(ChatUpdate::View),
                }
            }
            ServerEvent::ChatDeleted { msg_id, .. } => {
                room.seen.forget(&msg_id);
                room.buffer.remove(&msg_id).then_some(ChatUpdate::View)
            }
            ServerEvent::ChatTyping { is_typing, user_id, .. } => {
                if user_id.as_deref() == Some(self.me.as_str()) {
                    return None;
                }
                room.indicator.on_remote_at(is_typing, now);
                Some(ChatUpdate::TheirTyping(is_typing))
            }
            ServerEvent::ChatSeen { msg_ids, .. } => {
                room.seen.confirm_remote(&msg_ids);
                (room.buffer.mark_seen(&msg_ids) > 0).then_some(ChatUpdate::View)
            }
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────

    pub fn keystroke(&mut self) {
        self.keystroke_at(Instant::now());
    }

    pub fn keystroke_at(&mut self, now: Instant) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if let Some(emit) = room.typing.keystroke_at(now) {
            emit_typing(&self.channel, room.buffer.room_id(), emit);
        }
    }

    pub fn observe(&mut self, viewport: Viewport) -> usize {
        self.observe_at(viewport, Instant::now())
    }

    pub fn observe_at(&mut self, viewport: Viewport, now: Instant) -> usize {
        match self.room.as_mut() {
            Some(room) => {
                let view = room.buffer.view();
                room.seen.observe_at(&view, viewport, now)
            }
            None => 0,
        }
    }

    /// Send a system message: upload attachments, emit with ack, and post
    /// over REST when the push channel does not acknowledge.
    pub async fn send_system<U: AttachmentUploader>(
        &mut self,
        text: &str,
        attachments: &[Attachment],
        uploader: &U,
    ) -> Result<SendOutcome> {
        let room_id = self
            .membership
            .active_room()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("no active room to send to"))?;
        let staged_id = local_id();
        if let Some(room) = self.room.as_mut() {
            if let Some(stop) = room.typing.cancel() {
                emit_typing(&self.channel, &room_id, stop);
            }
            room.buffer.stage_outgoing(ChatMessage {
                id: staged_id.clone(),
                room_id: room_id.clone(),
                sender_id: self.me.clone(),
                text: text.to_string(),
                attachments: Vec::new(),
                created_at: Utc::now(),
                seen_by_me: true,
            });
        }

        let mut files = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            match uploader.upload(attachment).await {
                Ok(url) => files.push(url),
                Err(error) => {
                    self.discard_staged(&staged_id);
                    return Err(error.context(format!("failed to upload `{}`", attachment.name)));
                }
            }
        }

        let event = ClientEvent::SendSystem {
            room_id: room_id.clone(),
            text: text.to_string(),
            files: files.clone(),
        };
        let outcome = match self.channel.emit_event_with_ack(event, self.config.ack_timeout()).await {
            Ok(outcome) => outcome,
            Err(error) => {
                debug!(room_id = %room_id, error = %error, "push send unavailable, using REST");
                AckOutcome::NoAck
            }
        };

        match outcome {
            AckOutcome::Acked(payload) => {
                let confirmed = serde_json::from_value::<ChatMessage>(payload).ok();
                let message_id = self.settle_staged(&staged_id, confirmed);
                Ok(SendOutcome::Pushed { message_id })
            }
            AckOutcome::NoAck => match self.api.post_system(&room_id, text, &files).await {
                Ok(stored) => {
                    let message_id = self.settle_staged(&staged_id, stored);
                    info!(room_id = %room_id, "system message delivered over REST fallback");
                    Ok(SendOutcome::Posted { message_id })
                }
                Err(error) => {
                    self.discard_staged(&staged_id);
                    Err(error.context("system message fallback failed"))
                }
            },
        }
    }

    /// Swap the staged copy for the server's, or drop it and wait for the
    /// push echo when the server returned nothing usable.
    fn settle_staged(&mut self, staged_id: &str, confirmed: Option<ChatMessage>) -> Option<String> {
        let room = self.room.as_mut()?;
        match confirmed {
            Some(message) if message.room_id == room.buffer.room_id() => {
                let id = message.id.clone();
                room.buffer.confirm_outgoing(staged_id, message);
                self.updates.push_back(ChatUpdate::View);
                Some(id)
            }
            _ => {
                room.buffer.discard_outgoing(staged_id);
                None
            }
        }
    }

    fn discard_staged(&mut self, staged_id: &str) {
        if let Some(room) = self.room.as_mut() {
            room.buffer.discard_outgoing(staged_id);
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    pub fn next_deadline(&self) -> Option<Instant> {
        self.room.as_ref().and_then(ActiveRoom::next_deadline)
    }

    /// Run every timer due at `now`: typing stop, indicator expiry, seen flush.
    pub async fn fire_timers_at(&mut self, now: Instant) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if let Some(stop) = room.typing.poll_at(now) {
            emit_typing(&self.channel, room.buffer.room_id(), stop);
        }
        if room.indicator.expire_at(now) {
            self.updates.push_back(ChatUpdate::TheirTyping(false));
        }
        if let Some(batch) = room.seen.drain_ready_at(now) {
            match self.api.mark_seen(&batch.room_id, &batch.message_ids).await {
                Ok(()) => {
                    room.buffer.mark_seen(&batch.message_ids);
                    debug!(room_id = %batch.room_id, count = batch.message_ids.len(), "seen batch submitted");
                    self.updates.push_back(ChatUpdate::SeenSubmitted(batch.message_ids));
                }
                Err(error) => {
                    warn!(room_id = %batch.room_id, error = %error, "seen batch failed; will retry");
                    room.seen.retry(batch, now);
                }
            }
        }
    }

    /// Wait for the next update from inbound events, reconnects or timers.
    /// `None` once the channel's handlers are gone.
    pub async fn next_update(&mut self) -> Option<ChatUpdate> {
        loop {
            if let Some(update) = self.updates.pop_front() {
                return Some(update);
            }
            let deadline = self.next_deadline();
            tokio::select! {
                event = self.inbound.recv() => {
                    let update = self.apply(event?);
                    if update.is_some() {
                        return update;
                    }
                }
                Ok(()) = self.status.changed() => {
                    if self.reestablished() {
                        info!(namespace = %self.channel.namespace(), "push channel re-established; resyncing room");
                        if let Err(error) = self.resync().await {
                            warn!(error = %error, "resync after reconnect failed");
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    self.fire_timers_at(Instant::now()).await;
                }
            }
        }
    }
}

impl<A> Drop for ChatSession<A> {
    fn drop(&mut self) {
        if let Some(room_id) = self.membership.active_room() {
            let _ = self.channel.emit_event(ClientEvent::LeaveRoom { room_id: room_id.to_string() });
        }
    }
}

fn emit_typing(channel: &Channel, room_id: &str, emit: TypingEmit) {
    let event = ClientEvent::Typing { room_id: room_id.to_string(), is_typing: emit.is_typing() };
    if let Err(error) = channel.emit_event(event) {
        debug!(room_id, error = %error, "typing signal not sent");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

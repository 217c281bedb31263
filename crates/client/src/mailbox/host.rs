// Mailbox host: drives one `Mailbox` from timers, bus signals and store
// change notifications, and talks to the notice API.
//
// The fixed tick is the fallback for writers we cannot hear (other
// processes on the SQLite store); notifications just make us faster. It
// also keeps this instance's publisher lease fresh.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use eventsync_common::types::NoticeItem;

use crate::api::{LoadError, NoticeApi};
use crate::config::MailboxConfig;

use super::bus::{BusSignal, NoticeBus};
use super::reconcile::{Mailbox, TickOutcome};
use super::slot::SharedSlot;

pub struct MailboxHost<N> {
    mailbox: Mailbox,
    api: Arc<N>,
    bus: NoticeBus,
    tick: Duration,
    poll_interval: Duration,
}

impl<N: NoticeApi> MailboxHost<N> {
    pub fn new(slot: SharedSlot, bus: NoticeBus, api: Arc<N>, config: &MailboxConfig) -> Self {
        Self {
            mailbox: Mailbox::new(slot, config.min_priority).with_lease(config.publisher_lease()),
            api,
            bus,
            tick: config.tick(),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Take pending show requests, run one pass, and send the acks it owes.
    /// A failed ack goes back to the slot and is retried on a later pass.
    pub async fn reconcile(&mut self) -> TickOutcome {
        for item in self.bus.take_requests() {
            self.mailbox.enqueue_local(item);
        }
        let outcome = self.mailbox.tick();

        for owed in &outcome.owed {
            let Some(notice_id) = owed.item.ack_id() else {
                continue;
            };
            match self.api.acknowledge(notice_id).await {
                Ok(()) => info!(notice_id = %notice_id, "acknowledged notice"),
                Err(error) => {
                    warn!(notice_id = %notice_id, error = %error, attempts = owed.ack_attempts + 1, "notice ack failed");
                    self.mailbox.retry_ack(owed.clone(), Utc::now());
                }
            }
        }
        if outcome.published.is_some() {
            self.bus.publish(BusSignal::Changed);
        }
        outcome
    }

    /// Fetch server notices and queue the new ones.
    pub async fn poll(&mut self) -> Result<usize, LoadError> {
        let items = self.api.list_notices().await?;
        let queued = self.mailbox.ingest_poll(items);
        if queued > 0 {
            debug!(queued, "queued polled notices");
        }
        Ok(queued)
    }

    /// Run until `shutdown` fires or its sender is dropped.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut signals = self.bus.subscribe();
        let mut changes = self.mailbox.slot().subscribe();

        let mut tick = interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(instance = %self.mailbox.instance_id(), "mailbox started");
        self.bus.publish(BusSignal::Ready);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => {
                    self.reconcile().await;
                }
                _ = poll.tick() => {
                    match self.poll().await {
                        Ok(_) => {
                            self.reconcile().await;
                        }
                        Err(error) => {
                            warn!(error = %error, retryable = error.is_retryable(), "notice poll failed");
                        }
                    }
                }
                signal = signals.recv() => match signal {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        self.reconcile().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = next_change(&mut changes) => {
                    if changed {
                        self.reconcile().await;
                    }
                }
            }
        }

        info!(instance = %self.mailbox.instance_id(), "mailbox stopped");
    }
}

async fn next_change(changes: &mut Option<broadcast::Receiver<String>>) -> bool {
    let Some(rx) = changes.as_mut() else {
        return pending().await;
    };
    match rx.recv().await {
        Ok(_) | Err(RecvError::Lagged(_)) => true,
        Err(RecvError::Closed) => {
            *changes = None;
            false
        }
    }
}

/// What a rendering component needs: the notice to show and a way to
/// dismiss it.
#[derive(Clone)]
pub struct NoticePresenter {
    slot: SharedSlot,
    bus: NoticeBus,
}

impl NoticePresenter {
    pub fn new(slot: SharedSlot, bus: NoticeBus) -> Self {
        Self { slot, bus }
    }

    pub fn current(&self) -> Option<NoticeItem> {
        self.slot.current()
    }

    /// Clear the slot. Returns the notice that was dismissed, if any.
    pub fn dismiss(&self) -> Result<Option<NoticeItem>> {
        let dismissed = self.slot.clear()?;
        if let Some(item) = &dismissed {
            debug!(notice_id = %item.id, "notice dismissed by user");
            self.bus.publish(BusSignal::Closed);
        }
        Ok(dismissed)
    }

    pub fn show(&self, item: NoticeItem) {
        self.bus.show(item);
    }
}

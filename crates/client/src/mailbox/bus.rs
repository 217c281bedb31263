// In-process notice bus.
//
// Signals wake every mailbox loop in the process. Show requests go into a
// shared inbox instead, so exactly one loop takes each local notice. The
// inbox is bounded; with no loop draining it the oldest request is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use eventsync_common::types::NoticeItem;

use crate::lock;

const SIGNAL_CAPACITY: usize = 64;
pub const INBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSignal {
    /// A mailbox loop started.
    Ready,
    /// Something worth reconciling happened.
    Changed,
    /// The published notice was dismissed.
    Closed,
}

#[derive(Clone)]
pub struct NoticeBus {
    signals: broadcast::Sender<BusSignal>,
    inbox: Arc<Mutex<VecDeque<NoticeItem>>>,
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBus {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { signals, inbox: Arc::default() }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
        self.signals.subscribe()
    }

    /// Broadcast a signal. Returns how many loops were listening.
    pub fn publish(&self, signal: BusSignal) -> usize {
        self.signals.send(signal).unwrap_or(0)
    }

    /// Ask for a notice to be shown. Any mailbox loop may pick it up.
    pub fn show(&self, item: NoticeItem) {
        {
            let mut inbox = lock(&self.inbox);
            if inbox.len() >= INBOX_CAPACITY {
                if let Some(dropped) = inbox.pop_front() {
                    warn!(notice_id = %dropped.id, capacity = INBOX_CAPACITY, "notice inbox full, dropping oldest request");
                }
            }
            inbox.push_back(item);
        }
        self.publish(BusSignal::Changed);
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.inbox).len()
    }

    pub fn take_requests(&self) -> Vec<NoticeItem> {
        lock(&self.inbox).drain(..).collect()
    }
}

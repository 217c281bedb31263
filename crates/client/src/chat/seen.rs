// Seen tracking for the active room.
//
// Each visibility observation collects inbound messages that are on
// screen, not yet seen, and not yet submitted. Observations coalesce: the
// batch goes out once the debounce window passes without a new qualifying
// observation. An id is submitted at most once, unless a submission
// failed and was handed back with `retry`.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

use eventsync_common::types::ChatMessage;

/// Which slice of the merged view is on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    /// Index of the first visible message in `view()`.
    pub first: usize,
    /// Index one past the last visible message.
    pub end: usize,
    /// Whether the conversation has focus at all.
    pub focused: bool,
}

impl Viewport {
    pub fn all(len: usize) -> Self {
        Self { first: 0, end: len, focused: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenBatch {
    pub room_id: String,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SeenTracker {
    room_id: String,
    me: String,
    debounce: Duration,
    pending: Vec<String>,
    submitted: HashSet<String>,
    deadline: Option<Instant>,
}

impl SeenTracker {
    pub fn new(room_id: impl Into<String>, me: impl Into<String>, debounce: Duration) -> Self {
        Self {
            room_id: room_id.into(),
            me: me.into(),
            debounce,
            pending: Vec::new(),
            submitted: HashSet::new(),
            deadline: None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    pub fn observe(&mut self, view: &[ChatMessage], viewport: Viewport) -> usize {
        self.observe_at(view, viewport, Instant::now())
    }

    /// Queue visible unseen inbound messages. Returns how many were added;
    /// a non-zero result pushes the flush deadline back.
    pub fn observe_at(&mut self, view: &[ChatMessage], viewport: Viewport, now: Instant) -> usize {
        if !viewport.focused {
            return 0;
        }
        let end = viewport.end.min(view.len());
        let first = viewport.first.min(end);
        let mut added = 0;
        for message in &view[first..end] {
            if message.seen_by_me
                || message.sender_id == self.me
                || message.is_local()
                || self.submitted.contains(&message.id)
                || self.pending.contains(&message.id)
            {
                continue;
            }
            self.pending.push(message.id.clone());
            added += 1;
        }
        if added > 0 {
            self.deadline = Some(now + self.debounce);
        }
        added
    }

    pub fn drain_ready(&mut self) -> Option<SeenBatch> {
        self.drain_ready_at(Instant::now())
    }

    /// Take the pending batch once its debounce window has elapsed.
    pub fn drain_ready_at(&mut self, now: Instant) -> Option<SeenBatch> {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return None,
        }
        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }
        let message_ids = std::mem::take(&mut self.pending);
        self.submitted.extend(message_ids.iter().cloned());
        Some(SeenBatch { room_id: self.room_id.clone(), message_ids })
    }

    /// The server reported these ids as seen; never submit them.
    pub fn confirm_remote(&mut self, ids: &[String]) {
        self.pending.retain(|id| !ids.contains(id));
        self.submitted.extend(ids.iter().cloned());
        if self.pending.is_empty() {
            self.deadline = None;
        }
    }

    /// The message is gone; drop it from the pending batch.
    pub fn forget(&mut self, id: &str) {
        self.pending.retain(|pending| pending != id);
        self.submitted.insert(id.to_string());
        if self.pending.is_empty() {
            self.deadline = None;
        }
    }

    /// Hand back a batch whose submission failed so a later flush retries it.
    pub fn retry(&mut self, batch: SeenBatch, now: Instant) {
        for id in batch.message_ids {
            self.submitted.remove(&id);
            if !self.pending.contains(&id) {
                self.pending.push(id);
            }
        }
        if !self.pending.is_empty() {
            self.deadline = Some(now + self.debounce);
        }
    }
}

// Typed view over the shared store: the published-notice slot.
//
// Everything lives in one JSON document under `SLOT_KEY`, so every change
// is a single atomic `update`:
// - `showing`: the visible notice, its publisher and the publisher's lease
// - `owed`: dismissed server notices whose acknowledgment is still pending
// - `seen`: server ids that were published at least once
//
// Leases are TTL-driven. A live publisher renews before `expires_at`; once
// a lease lapses, any instance may take over the notice and its ack. A
// value that fails to decode reads as empty so a corrupt write can never
// wedge every instance.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use eventsync_common::types::{NoticeItem, NoticeSource};

use super::store::KeyValueStore;

pub const SLOT_KEY: &str = "eventsync.notice.slot";

/// Oldest seen ids are forgotten past this many.
const SEEN_CAPACITY: usize = 512;
/// A notice whose ack failed this many times is given up on.
pub const MAX_ACK_ATTEMPTS: u32 = 5;

/// A notice together with the instance answering for its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publication {
    pub publisher: String,
    pub item: NoticeItem,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub ack_attempts: u32,
}

impl Publication {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlotState {
    #[serde(default)]
    showing: Option<Publication>,
    #[serde(default)]
    owed: Vec<Publication>,
    #[serde(default)]
    seen: Vec<String>,
}

impl SlotState {
    fn remember(&mut self, id: &str) {
        if self.seen.iter().any(|existing| existing == id) {
            return;
        }
        self.seen.push(id.to_string());
        if self.seen.len() > SEEN_CAPACITY {
            let excess = self.seen.len() - SEEN_CAPACITY;
            self.seen.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishResult {
    Published,
    /// Another notice is showing. Try again later.
    Occupied,
    /// This server notice was already published by some instance.
    AlreadySeen,
}

#[derive(Clone)]
pub struct SharedSlot {
    store: Arc<dyn KeyValueStore>,
}

impl SharedSlot {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn load(&self) -> SlotState {
        match self.store.get(SLOT_KEY) {
            Ok(Some(raw)) => decode_state(&raw),
            Ok(None) => SlotState::default(),
            Err(error) => {
                warn!(error = %error, "failed to read notice slot");
                SlotState::default()
            }
        }
    }

    /// Apply `change` atomically. `None` from `change` leaves the store untouched.
    fn modify<T>(&self, mut change: impl FnMut(&mut SlotState) -> Option<T>) -> Result<Option<T>> {
        let mut result = None;
        let mut encode_error = None;
        self.store.update(SLOT_KEY, &mut |current: Option<&str>| {
            let mut state = current.map(decode_state).unwrap_or_default();
            let value = change(&mut state)?;
            match serde_json::to_string(&state) {
                Ok(encoded) => {
                    result = Some(value);
                    Some(encoded)
                }
                Err(error) => {
                    encode_error = Some(error);
                    None
                }
            }
        })?;
        if let Some(error) = encode_error {
            return Err(error).context("failed to encode notice slot");
        }
        Ok(result)
    }

    /// What is showing, as a list of at most one item. Read failures read as empty.
    pub fn read(&self) -> Vec<NoticeItem> {
        self.current().into_iter().collect()
    }

    pub fn current(&self) -> Option<NoticeItem> {
        self.showing().map(|publication| publication.item)
    }

    pub fn showing(&self) -> Option<Publication> {
        self.load().showing
    }

    /// Dismissed server notices still waiting for an acknowledgment.
    pub fn owed(&self) -> Vec<Publication> {
        self.load().owed
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.load().seen.iter().any(|existing| existing == id)
    }

    /// Show `item` if nothing is showing. Server ids are remembered in the
    /// same write, so each server notice is published once across instances.
    pub fn publish_if_empty(
        &self,
        publisher: &str,
        item: &NoticeItem,
        expires_at: DateTime<Utc>,
    ) -> Result<PublishResult> {
        let mut result = PublishResult::Occupied;
        self.modify(|state| {
            if state.showing.is_some() {
                result = PublishResult::Occupied;
                return None;
            }
            if let Some(id) = item.ack_id() {
                if state.seen.iter().any(|existing| existing == id) {
                    result = PublishResult::AlreadySeen;
                    return None;
                }
                state.remember(id);
            }
            state.showing = Some(Publication {
                publisher: publisher.to_string(),
                item: item.clone(),
                expires_at,
                ack_attempts: 0,
            });
            result = PublishResult::Published;
            Some(())
        })?;
        Ok(result)
    }

    /// Empty the slot. A dismissed server notice moves to `owed` under its
    /// publisher's lease. Returns the notice that was showing, if any.
    pub fn clear(&self) -> Result<Option<NoticeItem>> {
        let removed = self.modify(|state| {
            let publication = state.showing.take()?;
            let item = publication.item.clone();
            if item.ack_id().is_some() {
                state.owed.push(publication);
            }
            Some(item)
        })?;
        Ok(removed)
    }

    /// Extend `publisher`'s lease on the showing notice with `key`.
    pub fn renew(
        &self,
        publisher: &str,
        key: (NoticeSource, &str),
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let renewed = self.modify(|state| {
            let showing = state.showing.as_mut()?;
            if showing.publisher != publisher || showing.item.key() != key {
                return None;
            }
            showing.expires_at = expires_at;
            Some(())
        })?;
        Ok(renewed.is_some())
    }

    /// Take over a showing server notice whose publisher's lease lapsed.
    pub fn adopt_expired(
        &self,
        publisher: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<NoticeItem>> {
        self.modify(|state| {
            let showing = state.showing.as_mut()?;
            let orphaned = showing.publisher != publisher
                && showing.item.ack_id().is_some()
                && showing.is_expired_at(now);
            if !orphaned {
                return None;
            }
            showing.publisher = publisher.to_string();
            showing.expires_at = expires_at;
            Some(showing.item.clone())
        })
    }

    /// Remove and return every owed acknowledgment this instance must send:
    /// its own, plus any whose publisher's lease lapsed.
    pub fn take_owed(&self, publisher: &str, now: DateTime<Utc>) -> Result<Vec<Publication>> {
        let taken = self.modify(|state| {
            let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.owed)
                .into_iter()
                .partition(|owed| owed.publisher == publisher || owed.is_expired_at(now));
            state.owed = rest;
            (!mine.is_empty()).then_some(mine)
        })?;
        Ok(taken.unwrap_or_default())
    }

    /// Put back an acknowledgment that failed, owned by `publisher`.
    /// Returns false once the notice has used up its attempts.
    pub fn owe(
        &self,
        mut publication: Publication,
        publisher: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        publication.ack_attempts += 1;
        if publication.ack_attempts >= MAX_ACK_ATTEMPTS {
            return Ok(false);
        }
        publication.publisher = publisher.to_string();
        publication.expires_at = expires_at;
        self.modify(|state| {
            state.owed.push(publication.clone());
            Some(())
        })?;
        Ok(true)
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        self.store.subscribe()
    }
}

fn decode_state(raw: &str) -> SlotState {
    serde_json::from_str(raw).unwrap_or_else(|error| {
        warn!(error = %error, "corrupt notice slot; treating as empty");
        SlotState::default()
    })
}

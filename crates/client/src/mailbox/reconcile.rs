// Notice reconciliation for one mailbox instance.
//
// Many instances share one slot. Each keeps a private queue and, after a
// successful publish, a marker naming what it wrote. The slot records the
// publisher next to the notice, so only that instance acknowledges and a
// dismissal seen by N observers produces one ack.
//
// Ownership is a lease. The publisher renews it while its notice shows;
// when a publisher exits, its lease lapses and the next instance to tick
// takes over the notice (or the pending ack of a dismissed one). Every
// hand-over is a single atomic slot update, so exactly one instance ends
// up owing each acknowledgment.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use eventsync_common::types::{NoticeItem, NoticePriority, NoticeSource};

use super::slot::{Publication, PublishResult, SharedSlot};

pub const DEFAULT_LEASE: Duration = Duration::from_secs(10);

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Item this instance just wrote into the slot.
    pub published: Option<NoticeItem>,
    /// Our item left the slot.
    pub dismissed: Option<NoticeItem>,
    /// A showing notice this instance took over from a vanished publisher.
    pub adopted: Option<NoticeItem>,
    /// Acknowledgments this instance must now send.
    pub owed: Vec<Publication>,
    /// The slot went empty under someone else's marker.
    pub observed_dismissal: bool,
}

impl TickOutcome {
    /// Server ids to acknowledge.
    pub fn acknowledgments(&self) -> Vec<&str> {
        self.owed.iter().filter_map(|owed| owed.item.ack_id()).collect()
    }
}

pub struct Mailbox {
    instance_id: String,
    slot: SharedSlot,
    queue: VecDeque<NoticeItem>,
    marker: Option<NoticeItem>,
    last_observed: Option<NoticeItem>,
    min_priority: NoticePriority,
    lease: chrono::Duration,
}

impl Mailbox {
    pub fn new(slot: SharedSlot, min_priority: NoticePriority) -> Self {
        Self {
            instance_id: Uuid::new_v4().simple().to_string(),
            slot,
            queue: VecDeque::new(),
            marker: None,
            last_observed: None,
            min_priority,
            lease: lease_delta(DEFAULT_LEASE),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease_delta(lease);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn slot(&self) -> &SharedSlot {
        &self.slot
    }

    pub fn queued(&self) -> impl Iterator<Item = &NoticeItem> {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn marker(&self) -> Option<&NoticeItem> {
        self.marker.as_ref()
    }

    /// Queue a notice raised by application code. No priority filter.
    pub fn enqueue_local(&mut self, item: NoticeItem) {
        if self.is_tracked(&item) {
            debug!(notice_id = %item.id, "notice already queued");
            return;
        }
        self.queue.push_back(item);
    }

    /// Fold in one poll result. Returns how many items were queued.
    ///
    /// Ids already published by any instance are skipped. Several instances
    /// may queue the same new id; the slot publishes it once and the others
    /// drop their copy when they try.
    pub fn ingest_poll(&mut self, items: Vec<NoticeItem>) -> usize {
        let mut queued = 0;
        for mut item in items {
            item.source = NoticeSource::Server;
            if let Err(error) = item.validate() {
                warn!(error = %error, kind = %item.kind, "dropping polled notice");
                continue;
            }
            if item.priority < self.min_priority {
                debug!(notice_id = %item.id, priority = ?item.priority, "notice below threshold");
                continue;
            }
            if self.is_tracked(&item) || self.slot.is_seen(&item.id) {
                continue;
            }
            debug!(notice_id = %item.id, instance = %self.instance_id, "queued server notice");
            self.queue.push_back(item);
            queued += 1;
        }
        queued
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.tick_at(Utc::now())
    }

    /// One reconciliation pass: settle our marker, take over orphans,
    /// collect owed acks, then publish the next queued item if the slot is free.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let expires_at = now + self.lease;
        let showing = self.slot.showing();

        if let Some(marker) = self.marker.take() {
            match showing.as_ref().filter(|shown| shown.item.key() == marker.key()) {
                Some(shown) if shown.publisher == self.instance_id => {
                    if shown.expires_at - now < self.lease / 2 {
                        if let Err(error) = self.slot.renew(&self.instance_id, marker.key(), expires_at) {
                            warn!(notice_id = %marker.id, error = %error, "failed to renew notice lease");
                        }
                    }
                    self.marker = Some(marker);
                }
                Some(_) => {
                    debug!(notice_id = %marker.id, instance = %self.instance_id, "notice taken over after lease lapsed");
                }
                None => {
                    info!(
                        notice_id = %marker.id,
                        source = ?marker.source,
                        instance = %self.instance_id,
                        "notice dismissed"
                    );
                    outcome.dismissed = Some(marker);
                }
            }
        } else if self.last_observed.is_some() && showing.is_none() {
            debug!(instance = %self.instance_id, "dismissal observed; not the publisher");
            outcome.observed_dismissal = true;
        }

        if self.marker.is_none() {
            match self.slot.adopt_expired(&self.instance_id, now, expires_at) {
                Ok(Some(item)) => {
                    info!(notice_id = %item.id, instance = %self.instance_id, "adopted notice from vanished publisher");
                    self.marker = Some(item.clone());
                    outcome.adopted = Some(item);
                }
                Ok(None) => {}
                Err(error) => warn!(error = %error, "failed to check for orphaned notice"),
            }
        }

        match self.slot.take_owed(&self.instance_id, now) {
            Ok(owed) => outcome.owed = owed,
            Err(error) => warn!(error = %error, "failed to collect owed acknowledgments"),
        }

        if showing.is_none() {
            self.publish_next(expires_at, &mut outcome);
        }

        self.last_observed = match &outcome.published {
            Some(item) => Some(item.clone()),
            None => self.slot.current(),
        };
        outcome
    }

    /// Hand an acknowledgment that failed back to the slot for a later tick.
    pub fn retry_ack(&self, publication: Publication, now: DateTime<Utc>) {
        let notice_id = publication.item.id.clone();
        match self.slot.owe(publication, &self.instance_id, now + self.lease) {
            Ok(true) => {}
            Ok(false) => warn!(notice_id = %notice_id, "giving up on notice acknowledgment"),
            Err(error) => warn!(notice_id = %notice_id, error = %error, "failed to requeue notice acknowledgment"),
        }
    }

    fn publish_next(&mut self, expires_at: DateTime<Utc>, outcome: &mut TickOutcome) {
        while let Some(next) = self.queue.pop_front() {
            match self.slot.publish_if_empty(&self.instance_id, &next, expires_at) {
                Ok(PublishResult::Published) => {
                    info!(
                        notice_id = %next.id,
                        source = ?next.source,
                        instance = %self.instance_id,
                        "published notice"
                    );
                    self.marker = Some(next.clone());
                    outcome.published = Some(next);
                    return;
                }
                Ok(PublishResult::AlreadySeen) => {
                    debug!(notice_id = %next.id, "notice already published elsewhere; dropping");
                }
                Ok(PublishResult::Occupied) => {
                    debug!(notice_id = %next.id, "slot taken by another publisher");
                    self.queue.push_front(next);
                    return;
                }
                Err(error) => {
                    warn!(notice_id = %next.id, error = %error, "failed to publish notice");
                    self.queue.push_front(next);
                    return;
                }
            }
        }
    }

    fn is_tracked(&self, item: &NoticeItem) -> bool {
        let key = item.key();
        self.marker.as_ref().is_some_and(|m| m.key() == key)
            || self.queue.iter().any(|queued| queued.key() == key)
    }
}

fn lease_delta(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::store::MemoryStore;
    use std::sync::Arc;

    fn shared() -> SharedSlot {
        SharedSlot::new(Arc::new(MemoryStore::new()))
    }

    fn server(id: &str) -> NoticeItem {
        NoticeItem::server(id, "billing", format!("Notice {id}"), "", Utc::now()).unwrap()
    }

    fn past_lease(now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(DEFAULT_LEASE).unwrap() + chrono::Duration::seconds(1)
    }

    #[test]
    fn queued_notices_show_one_at_a_time_in_order() {
        let slot = shared();
        let mut mailbox = Mailbox::new(slot.clone(), NoticePriority::Normal);
        let x = NoticeItem::local("info", "X", "");
        let y = NoticeItem::local("info", "Y", "");
        mailbox.enqueue_local(x.clone());
        mailbox.enqueue_local(y.clone());

        assert_eq!(mailbox.tick().published, Some(x.clone()));
        assert_eq!(slot.read(), vec![x.clone()]);

        // Nothing moves while X is up.
        assert_eq!(mailbox.tick(), TickOutcome::default());

        slot.clear().unwrap();
        let outcome = mailbox.tick();
        assert_eq!(outcome.dismissed, Some(x));
        assert!(outcome.acknowledgments().is_empty());
        assert_eq!(outcome.published, Some(y.clone()));
        assert_eq!(slot.read(), vec![y]);
    }

    #[test]
    fn only_the_publisher_acknowledges() {
        let slot = shared();
        let mut publisher = Mailbox::new(slot.clone(), NoticePriority::Normal);
        let mut observers: Vec<_> =
            (0..3).map(|_| Mailbox::new(slot.clone(), NoticePriority::Normal)).collect();

        publisher.ingest_poll(vec![server("n1")]);
        publisher.tick();
        for observer in &mut observers {
            observer.tick();
        }

        slot.clear().unwrap();
        let mut acks = Vec::new();
        for observer in &mut observers {
            let outcome = observer.tick();
            assert!(outcome.observed_dismissal);
            acks.extend(outcome.acknowledgments().into_iter().map(str::to_string));
        }
        acks.extend(publisher.tick().acknowledgments().into_iter().map(str::to_string));
        assert_eq!(acks, vec!["n1".to_string()]);

        // No second ack on later ticks.
        assert!(publisher.tick().acknowledgments().is_empty());
    }

    #[test]
    fn dismissal_followed_by_foreign_publish_still_acks() {
        let slot = shared();
        let mut a = Mailbox::new(slot.clone(), NoticePriority::Normal);
        let mut b = Mailbox::new(slot.clone(), NoticePriority::Normal);
        a.ingest_poll(vec![server("n1")]);
        b.enqueue_local(NoticeItem::local("info", "B", ""));
        a.tick();

        slot.clear().unwrap();
        assert!(b.tick().published.is_some());

        let outcome = a.tick();
        assert_eq!(outcome.acknowledgments(), vec!["n1"]);
        assert!(outcome.published.is_none());
        assert!(a.marker().is_none());
    }

    #[test]
    fn lost_race_keeps_item_queued() {
        let slot = shared();
        let mut a = Mailbox::new(slot.clone(), NoticePriority::Normal);
        a.enqueue_local(NoticeItem::local("info", "A", ""));

        let other = NoticeItem::local("info", "other", "");
        slot.publish_if_empty("someone-else", &other, past_lease(Utc::now())).unwrap();
        let outcome = a.tick();
        assert!(outcome.published.is_none());
        assert_eq!(a.queue_len(), 1);
        assert!(a.marker().is_none());
    }

    #[test]
    fn duplicate_queues_publish_each_notice_once() {
        let slot = shared();
        let mut a = Mailbox::new(slot.clone(), NoticePriority::Normal);
        let mut b = Mailbox::new(slot.clone(), NoticePriority::Normal);

        assert_eq!(a.ingest_poll(vec![server("n1"), server("n2")]), 2);
        assert_eq!(b.ingest_poll(vec![server("n1"), server("n2")]), 2);
        assert_eq!(a.ingest_poll(vec![server("n1")]), 0);

        let mut shown = Vec::new();
        for _ in 0..4 {
            for mailbox in [&mut a, &mut b] {
                if let Some(item) = mailbox.tick().published {
                    shown.push(item.id);
                }
            }
            slot.clear().unwrap();
        }
        shown.sort();
        assert_eq!(shown, vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(a.queue_len() + b.queue_len(), 0);

        // Published ids are not queued again.
        assert_eq!(b.ingest_poll(vec![server("n1")]), 0);
    }

    #[test]
    fn poll_filters_priority_and_blank_ids() {
        let mut mailbox = Mailbox::new(shared(), NoticePriority::High);
        let mut blank = server("n0");
        blank.id = "  ".into();
        let items = vec![
            server("low").with_priority(NoticePriority::Low),
            server("urgent").with_priority(NoticePriority::Urgent),
            blank,
        ];
        assert_eq!(mailbox.ingest_poll(items), 1);
        assert_eq!(mailbox.queued().next().unwrap().id, "urgent");
    }

    #[test]
    fn local_notices_skip_the_priority_filter() {
        let mut mailbox = Mailbox::new(shared(), NoticePriority::Urgent);
        mailbox.enqueue_local(NoticeItem::local("info", "hi", "").with_priority(NoticePriority::Low));
        assert_eq!(mailbox.queue_len(), 1);
    }

    #[test]
    fn successor_acks_a_notice_dismissed_after_its_publisher_exited() {
        let slot = shared();
        let now = Utc::now();
        let mut first = Mailbox::new(slot.clone(), NoticePriority::Normal);
        first.ingest_poll(vec![server("n1"), server("n2")]);
        assert!(first.tick_at(now).published.is_some());
        drop(first);

        let mut second = Mailbox::new(slot.clone(), NoticePriority::Normal);
        slot.clear().unwrap();
        assert_eq!(second.ingest_poll(vec![server("n1"), server("n2")]), 1);

        let outcome = second.tick_at(now);
        assert_eq!(outcome.published.as_ref().unwrap().id, "n2");
        assert!(outcome.acknowledgments().is_empty(), "the old lease still runs");

        let later = past_lease(now);
        assert_eq!(second.tick_at(later).acknowledgments(), vec!["n1"]);
        assert!(second.tick_at(later).acknowledgments().is_empty());
    }

    #[test]
    fn successor_adopts_a_notice_still_showing() {
        let slot = shared();
        let now = Utc::now();
        let mut first = Mailbox::new(slot.clone(), NoticePriority::Normal);
        first.ingest_poll(vec![server("n1")]);
        first.tick_at(now);
        drop(first);

        let mut second = Mailbox::new(slot.clone(), NoticePriority::Normal);
        assert!(second.tick_at(now).adopted.is_none());
        let later = past_lease(now);
        assert_eq!(second.tick_at(later).adopted.unwrap().id, "n1");
        assert_eq!(second.marker().unwrap().id, "n1");

        slot.clear().unwrap();
        let outcome = second.tick_at(later);
        assert_eq!(outcome.dismissed.as_ref().unwrap().id, "n1");
        assert_eq!(outcome.acknowledgments(), vec!["n1"]);
    }

    #[test]
    fn live_publisher_keeps_its_lease() {
        let slot = shared();
        let now = Utc::now();
        let mut publisher = Mailbox::new(slot.clone(), NoticePriority::Normal);
        let mut other = Mailbox::new(slot.clone(), NoticePriority::Normal);
        publisher.ingest_poll(vec![server("n1")]);
        publisher.tick_at(now);

        // Ticking every few seconds keeps renewing well ahead of expiry.
        let mut t = now;
        for _ in 0..10 {
            t += chrono::Duration::seconds(3);
            publisher.tick_at(t);
            assert!(other.tick_at(t).adopted.is_none());
        }
        assert_eq!(slot.showing().unwrap().publisher, publisher.instance_id());
    }

    #[test]
    fn failed_ack_is_owed_again_by_the_same_instance() {
        let slot = shared();
        let now = Utc::now();
        let mut mailbox = Mailbox::new(slot.clone(), NoticePriority::Normal);
        mailbox.ingest_poll(vec![server("n1")]);
        mailbox.tick_at(now);
        slot.clear().unwrap();

        let mut outcome = mailbox.tick_at(now);
        let owed = outcome.owed.remove(0);
        mailbox.retry_ack(owed, now);
        assert_eq!(mailbox.tick_at(now).acknowledgments(), vec!["n1"]);
    }
}

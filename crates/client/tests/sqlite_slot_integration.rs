use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration, Utc};
use eventsync_client::mailbox::{KeyValueStore, Mailbox, PublishResult, SharedSlot, SqliteStore};
use eventsync_common::types::{NoticeItem, NoticePriority};
use tempfile::TempDir;

fn open_slot(dir: &TempDir) -> SharedSlot {
    let store = SqliteStore::open(dir.path().join("mailbox.db")).expect("store should open");
    SharedSlot::new(Arc::new(store))
}

fn server(id: &str) -> NoticeItem {
    NoticeItem::server(id, "billing", "Title", "", Utc::now()).expect("server notice should build")
}

#[test]
fn concurrent_writers_publish_exactly_once() {
    let dir = TempDir::new().expect("temp dir should be created");
    let path = dir.path().join("mailbox.db");
    // Run migrations once up front so the threads only race on the slot.
    SqliteStore::open(&path).expect("store should open");

    let writers = 8;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let slot = SharedSlot::new(Arc::new(SqliteStore::open(&path).expect("store should open")));
                barrier.wait();
                let expires_at = Utc::now() + Duration::seconds(10);
                slot.publish_if_empty(&format!("writer-{i}"), &server(&format!("n{i}")), expires_at)
                    .expect("publish should not error")
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|handle| handle.join().expect("writer thread should finish"))
        .filter(|result| *result == PublishResult::Published)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(open_slot(&dir).read().len(), 1);
}

#[test]
fn dismissal_in_one_process_is_acknowledged_by_the_publisher() {
    let dir = TempDir::new().expect("temp dir should be created");
    let mut a = Mailbox::new(open_slot(&dir), NoticePriority::Normal);
    let mut b = Mailbox::new(open_slot(&dir), NoticePriority::Normal);

    assert_eq!(a.ingest_poll(vec![server("n1")]), 1);
    assert!(a.tick().published.is_some());
    assert_eq!(b.ingest_poll(vec![server("n1")]), 0, "published ids are shared through the file");
    assert!(b.tick().published.is_none());
    assert_eq!(b.slot().current().expect("b sees a's notice").id, "n1");

    b.slot().clear().expect("dismiss should succeed");
    let b_outcome = b.tick();
    assert!(b_outcome.observed_dismissal);
    assert!(b_outcome.acknowledgments().is_empty());
    assert_eq!(a.tick().acknowledgments(), vec!["n1"]);
}

#[test]
fn restarted_instance_shows_the_rest_and_acks_the_orphan() {
    let dir = TempDir::new().expect("temp dir should be created");
    let now = Utc::now();

    let mut first = Mailbox::new(open_slot(&dir), NoticePriority::Normal);
    assert_eq!(first.ingest_poll(vec![server("n1"), server("n2")]), 2);
    assert_eq!(first.tick_at(now).published.expect("n1 shows").id, "n1");
    drop(first);

    // The user dismisses n1 while no instance runs.
    let slot = open_slot(&dir);
    assert_eq!(slot.clear().expect("dismiss should succeed").expect("n1 was showing").id, "n1");

    let mut second = Mailbox::new(open_slot(&dir), NoticePriority::Normal);
    assert_eq!(second.ingest_poll(vec![server("n1"), server("n2")]), 1);
    assert_eq!(second.tick_at(now).published.expect("n2 shows").id, "n2");

    let after_lease = now + Duration::seconds(11);
    assert_eq!(second.tick_at(after_lease).acknowledgments(), vec!["n1"]);

    slot.clear().expect("dismiss should succeed");
    assert_eq!(second.tick_at(after_lease).acknowledgments(), vec!["n2"]);
    assert!(slot.owed().is_empty());
}

#[test]
fn corrupt_slot_on_disk_reads_as_empty() {
    let dir = TempDir::new().expect("temp dir should be created");
    let store = SqliteStore::open(dir.path().join("mailbox.db")).expect("store should open");
    store.set("eventsync.notice.slot", "not json").expect("raw write should succeed");

    let slot = open_slot(&dir);
    assert!(slot.current().is_none());
    let result = slot
        .publish_if_empty("a", &server("n1"), Utc::now() + Duration::seconds(10))
        .expect("publish should succeed");
    assert_eq!(result, PublishResult::Published);
}

// Notification mailbox.
//
// Notices from the server poll and from application code share one queue
// per instance and one published slot across instances. At most one notice
// is visible at a time, and each server notice is acknowledged once, by
// the instance that published it or, if that instance is gone, by the one
// that took over its lease.

pub mod bus;
pub mod host;
pub mod reconcile;
pub mod slot;
pub mod store;

pub use bus::{BusSignal, NoticeBus};
pub use host::{MailboxHost, NoticePresenter};
pub use reconcile::{Mailbox, TickOutcome};
pub use slot::{Publication, PublishResult, SharedSlot};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};

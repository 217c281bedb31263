// eventsync-client: real-time synchronization layer.
//
// Push channels per namespace, room-scoped chat state (membership, merged
// history + live tail, typing, seen), and the cross-instance notice mailbox.

pub mod api;
pub mod channel;
pub mod chat;
pub mod config;
pub mod mailbox;
pub mod runtime;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

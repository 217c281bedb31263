// Event → ordered handler list.
//
// One registry per namespace, owned by the channel rather than by the
// underlying transport, so handlers survive transport recreation. Handlers
// for the same event run in subscription order.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::lock;

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    handlers: HashMap<String, Vec<(SubscriptionId, Handler)>>,
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("events", &self.events()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`. Dropping the returned guard removes it.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.handlers.entry(event.to_string()).or_default().push((id, Arc::new(handler)));
        Subscription { id, registry: Arc::downgrade(&self.inner) }
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        remove_handler(&self.inner, id)
    }

    /// Run every handler registered for `event`. Returns how many ran.
    ///
    /// Handlers are called outside the registry lock, so they may
    /// subscribe or unsubscribe while being dispatched.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let handlers: Vec<Handler> = {
            let inner = lock(&self.inner);
            match inner.handlers.get(event) {
                Some(list) => list.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
                None => return 0,
            }
        };
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    /// Events with at least one live handler, sorted.
    pub fn events(&self) -> Vec<String> {
        let inner = lock(&self.inner);
        let mut events: Vec<String> = inner
            .handlers
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(event, _)| event.clone())
            .collect();
        events.sort();
        events
    }

    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.inner).handlers.get(event).map_or(0, Vec::len)
    }
}

fn remove_handler(inner: &Mutex<RegistryInner>, id: SubscriptionId) -> bool {
    let mut inner = lock(inner);
    let mut removed = false;
    inner.handlers.retain(|_, list| {
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        removed |= list.len() != before;
        !list.is_empty()
    });
    removed
}

/// Unsubscribe guard returned by [`HandlerRegistry::on`].
#[must_use = "dropping a Subscription removes the handler"]
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the handler now.
    pub fn cancel(self) {
        drop(self);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            remove_handler(&inner, self.id);
        }
    }
}

//! A topic-keyed, fire-and-forget fan-out bus.
//!
//! Each subscriber registers a callback on a [`Topic`]. Publishing a message spawns one task per
//! callback registered at that moment, so a slow or panicking subscriber cannot hold up the
//! publisher or any other subscriber. Delivery order across subscribers is unspecified.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use ahash::AHashMap as HashMap;
use flowtag_core::Topic;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, trace};

pub type Callback<M> = Arc<dyn Fn(M) + Send + Sync + 'static>;

pub type SharedPubSub<M> = Arc<PubSub<M>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("subscription id must not be empty")]
    EmptySubscriptionId,
}

pub struct PubSub<M> {
    /// Runtime on which callbacks are dispatched.
    handle: Handle,
    subscribers: RwLock<HashMap<Topic, HashMap<String, Callback<M>>>>,
}

// === impl PubSub ===

impl<M> PubSub<M>
where
    M: Clone + Send + 'static,
{
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            subscribers: RwLock::new(HashMap::default()),
        }
    }

    pub fn shared(handle: Handle) -> SharedPubSub<M> {
        Arc::new(Self::new(handle))
    }

    /// Registers `callback` on `topic`, returning the id used to unsubscribe.
    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> String
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers
            .write()
            .entry(topic)
            .or_default()
            .insert(id.clone(), Arc::new(callback));
        debug!(%topic, %id, "Subscribed");
        id
    }

    /// Removes a subscription. Unknown ids and topics are ignored.
    pub fn unsubscribe(&self, topic: Topic, id: &str) -> Result<(), Error> {
        if id.is_empty() {
            return Err(Error::EmptySubscriptionId);
        }

        let mut subscribers = self.subscribers.write();
        if let Some(subs) = subscribers.get_mut(&topic) {
            if subs.remove(id).is_some() {
                debug!(%topic, %id, "Unsubscribed");
            }
            if subs.is_empty() {
                subscribers.remove(&topic);
            }
        }
        Ok(())
    }

    /// Hands `msg` to every callback currently registered on `topic` without waiting for any of
    /// them to run.
    pub fn publish(&self, topic: Topic, msg: M) {
        // Copy the callbacks out so the lock is not held while tasks are spawned.
        let callbacks = match self.subscribers.read().get(&topic) {
            Some(subs) => subs.values().cloned().collect::<Vec<_>>(),
            None => return,
        };

        trace!(%topic, subscribers = callbacks.len(), "Publishing");
        for callback in callbacks {
            let msg = msg.clone();
            self.handle.spawn(async move { callback(msg) });
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers.read().get(&topic).map_or(0, |subs| subs.len())
    }
}

impl<M> std::fmt::Debug for PubSub<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.read();
        f.debug_struct("PubSub")
            .field("topics", &subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests;

//! Message bus boundary
//!
//! The broker itself is an external collaborator. Gateways and devices only
//! need exact-topic publish and subscribe, expressed by [`MessageBus`].
//! [`LocalBus`] is an in-process implementation for single-host setups and
//! tests.
//!
//! Handlers run on whatever thread publishes (for [`LocalBus`]) or on the
//! broker's delivery threads (for networked brokers). They must not block.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::message::encode;
use crate::Result;

/// Callback invoked with `(topic, payload)` for each delivered message
pub type BusHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Exact-topic publish/subscribe
pub trait MessageBus: Send + Sync {
    /// Publish raw bytes on a topic
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to a topic. Delivery stops when the returned guard drops.
    fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<Subscription>;
}

/// Convenience methods for any [`MessageBus`]
pub trait MessageBusExt: MessageBus {
    /// CBOR-encode and publish
    fn publish_cbor<T: Serialize>(&self, topic: &str, value: &T) -> Result<()> {
        let payload = encode(value)?;
        self.publish(topic, &payload)
    }
}

impl<B: MessageBus + ?Sized> MessageBusExt for B {}

/// Live subscription, cancelled on drop
pub struct Subscription {
    topic: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Guard that runs `cancel` when dropped
    pub fn new(topic: impl Into<String>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            topic: topic.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

#[derive(Default)]
struct LocalBusInner {
    next_id: AtomicU64,
    topics: RwLock<HashMap<String, Vec<(u64, BusHandler)>>>,
}

impl LocalBusInner {
    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write();
        if let Some(handlers) = topics.get_mut(topic) {
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// In-process broker with synchronous delivery
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

impl LocalBus {
    /// Empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handlers on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.read().get(topic).map_or(0, Vec::len)
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        // Snapshot so handlers may publish or subscribe re-entrantly.
        let handlers: Vec<BusHandler> = self
            .inner
            .topics
            .read()
            .get(topic)
            .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        trace!(topic, subscribers = handlers.len(), bytes = payload.len(), "Publish");
        for handler in handlers {
            handler(topic, payload);
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<Subscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));

        let weak: Weak<LocalBusInner> = Arc::downgrade(&self.inner);
        let owned_topic = topic.to_string();
        Ok(Subscription::new(topic, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(&owned_topic, id);
            }
        }))
    }
}

impl fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("topics", &self.inner.topics.read().len())
            .finish()
    }
}

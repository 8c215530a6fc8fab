//! Fan-out hub: routes ingested events to UI subscribers
//!
//! Each subscriber owns a bounded queue. Publishing is non-blocking: the
//! event is pushed onto every matching subscriber's queue, and when a queue
//! is full the oldest event is dropped and a counter incremented - the
//! subscriber is never disconnected and retained events are never
//! reordered.
//!
//! # Architecture
//!
//! ```text
//! Ingestor ──publish()──→ FanoutHub
//!                             │
//!                             ├──→ Subscriber 1 (filter: instance "abc")
//!                             ├──→ Subscriber 2 (filter: instance "def")
//!                             └──→ Subscriber 3 (filter: all)
//!                                      │
//!                                      └──→ HTTP SSE handler (recv loop)
//! ```

use crate::events::StreamEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// What a subscriber wants to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// Every event on every endpoint
    All,
    /// Only events for one tunnel instance
    Instance(String),
}

impl SubscriptionFilter {
    fn matches(&self, event: &StreamEvent) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Instance(id) => event.instance_id() == Some(id.as_str()),
        }
    }
}

struct SubscriberState {
    queue: Mutex<VecDeque<StreamEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    filter: SubscriptionFilter,
}

struct HubInner {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberState>>>,
    next_id: AtomicU64,
    capacity: usize,
    published: AtomicU64,
    dropped_total: AtomicU64,
}

/// Shared handle to the hub
#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<HubInner>,
}

impl FanoutHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                published: AtomicU64::new(0),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber; dropping the returned handle unsubscribes
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubscriberState {
            queue: Mutex::new(VecDeque::with_capacity(self.inner.capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            filter,
        });
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .insert(id, state.clone());
        tracing::debug!(subscriber = id, "Fan-out subscriber registered");
        Subscription {
            id,
            state,
            hub: self.inner.clone(),
        }
    }

    /// Non-blocking publish to every matching subscriber
    ///
    /// Per-subscriber ordering is preserved; overflow drops the oldest
    /// queued event for that subscriber only.
    pub fn publish(&self, event: &StreamEvent) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let subscribers = self.inner.subscribers.lock().unwrap();
        for state in subscribers.values() {
            if !state.filter.matches(event) {
                continue;
            }
            {
                let mut queue = state.queue.lock().unwrap();
                if queue.len() >= self.inner.capacity {
                    queue.pop_front();
                    state.dropped.fetch_add(1, Ordering::Relaxed);
                    self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(event.clone());
            }
            state.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    pub fn published_total(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }
}

/// A live subscription; receive with [`Subscription::recv`]
pub struct Subscription {
    id: u64,
    state: Arc<SubscriberState>,
    hub: Arc<HubInner>,
}

impl Subscription {
    /// Wait for the next event matching the filter
    pub async fn recv(&mut self) -> StreamEvent {
        loop {
            // Arm the notification before checking the queue so a publish
            // between the check and the await cannot be missed
            let notified = self.state.notify.notified();
            if let Some(event) = self.state.queue.lock().unwrap().pop_front() {
                return event;
            }
            notified.await;
        }
    }

    /// Drain everything currently queued, without waiting
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        self.state.queue.lock().unwrap().drain(..).collect()
    }

    /// Events dropped from this subscriber's queue due to overflow
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.subscribers.lock().unwrap().remove(&self.id);
        tracing::debug!(subscriber = self.id, "Fan-out subscriber removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn log_event(instance: &str, n: usize) -> StreamEvent {
        StreamEvent::Log {
            endpoint_id: 1,
            instance_id: instance.into(),
            time: Utc::now(),
            logs: format!("event {n}"),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let hub = FanoutHub::new(16);
        let mut sub = hub.subscribe(SubscriptionFilter::Instance("abc".into()));
        for i in 0..5 {
            hub.publish(&log_event("abc", i));
        }
        for i in 0..5 {
            match sub.recv().await {
                StreamEvent::Log { logs, .. } => assert_eq!(logs, format!("event {i}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let hub = FanoutHub::new(4);
        let mut sub = hub.subscribe(SubscriptionFilter::Instance("abc".into()));
        for i in 0..10 {
            hub.publish(&log_event("abc", i));
        }

        // Exactly 4 retained, in publish order, newest last
        let retained = sub.drain();
        assert_eq!(retained.len(), 4);
        let texts: Vec<String> = retained
            .into_iter()
            .map(|e| match e {
                StreamEvent::Log { logs, .. } => logs,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["event 6", "event 7", "event 8", "event 9"]);
        assert_eq!(sub.dropped(), 6);
    }

    #[tokio::test]
    async fn filter_scopes_delivery() {
        let hub = FanoutHub::new(16);
        let mut for_abc = hub.subscribe(SubscriptionFilter::Instance("abc".into()));
        let mut for_all = hub.subscribe(SubscriptionFilter::All);

        hub.publish(&log_event("abc", 1));
        hub.publish(&log_event("other", 2));
        hub.publish(&StreamEvent::Shutdown {
            endpoint_id: 1,
            time: Utc::now(),
        });

        // Instance filter sees only its own event
        assert_eq!(for_abc.drain().len(), 1);
        // Wildcard sees all three, including the endpoint-wide shutdown
        assert_eq!(for_all.drain().len(), 3);
    }

    #[tokio::test]
    async fn unsubscribe_on_drop() {
        let hub = FanoutHub::new(4);
        let sub = hub.subscribe(SubscriptionFilter::All);
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        // Publishing with no subscribers is fine
        hub.publish(&log_event("abc", 0));
    }

    #[tokio::test]
    async fn recv_wakes_on_later_publish() {
        let hub = FanoutHub::new(4);
        let mut sub = hub.subscribe(SubscriptionFilter::All);
        let publisher = hub.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish(&log_event("abc", 42));
        });
        let event = sub.recv().await;
        assert!(matches!(event, StreamEvent::Log { .. }));
        handle.await.unwrap();
    }
}

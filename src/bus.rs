//! Frame Bus (C6): publishes reassembled media frames with telemetry to
//! subscribers. See `SPEC_FULL.md` §4.6.
//!
//! Grounded on `knightofdemons-a9-v720/src/pipeline.rs`'s `WorkerPool`
//! (`mpsc` ingress, per-item dispatch), generalized into a fan-out
//! publish/subscribe registry. Tokio's `mpsc` has no drop-oldest mode,
//! so subscriber queues are a small hand-rolled bounded ring guarded by
//! a `Mutex` + `Notify`, matching the "drop rather than block the
//! protocol path" principle the teacher follows on its hot path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::messages::LocationRecord;

const DEFAULT_RECENT_FRAMES: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBusEvent {
    pub device_id: String,
    pub channel: u8,
    pub data_type: u8,
    pub payload: Vec<u8>,
    pub telemetry: Option<LocationRecord>,
    pub sequence: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub device_id: Option<String>,
    pub channel: Option<u8>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        SubscriptionFilter::default()
    }

    fn matches(&self, event: &FrameBusEvent) -> bool {
        if let Some(device_id) = &self.device_id {
            if device_id != &event.device_id {
                return false;
            }
        }
        if let Some(channel) = self.channel {
            if channel != event.channel {
                return false;
            }
        }
        true
    }
}

struct DropOldestQueue {
    items: Mutex<VecDeque<FrameBusEvent>>,
    notify: Notify,
    capacity: usize,
}

impl DropOldestQueue {
    fn new(capacity: usize) -> Self {
        DropOldestQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    async fn push(&self, event: FrameBusEvent) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(event);
        drop(items);
        self.notify.notify_one();
    }

    async fn pop(&self) -> FrameBusEvent {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(event) = items.pop_front() {
                    return event;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Handle held by a subscriber; dropping it unsubscribes on next publish.
pub struct FrameSubscription {
    queue: Arc<DropOldestQueue>,
}

impl FrameSubscription {
    pub async fn recv(&self) -> FrameBusEvent {
        self.queue.pop().await
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    queue: std::sync::Weak<DropOldestQueue>,
}

struct StreamState {
    sequence: u64,
    recent: VecDeque<FrameBusEvent>,
}

pub struct FrameBus {
    subscribers: Mutex<Vec<Subscriber>>,
    streams: Mutex<HashMap<(String, u8), StreamState>>,
    recent_cap: usize,
    subscriber_queue_cap: usize,
    next_subscriber_id: AtomicU64,
}

impl FrameBus {
    pub fn new(subscriber_queue_cap: usize) -> Self {
        FrameBus {
            subscribers: Mutex::new(Vec::new()),
            streams: Mutex::new(HashMap::new()),
            recent_cap: DEFAULT_RECENT_FRAMES,
            subscriber_queue_cap,
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    pub async fn subscribe(&self, filter: SubscriptionFilter) -> FrameSubscription {
        let _id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(DropOldestQueue::new(self.subscriber_queue_cap));
        let mut subs = self.subscribers.lock().await;
        subs.push(Subscriber {
            filter,
            queue: Arc::downgrade(&queue),
        });
        FrameSubscription { queue }
    }

    /// Publish one reassembled frame. Never blocks on a slow subscriber:
    /// drop-oldest queues absorb backpressure instead.
    pub async fn publish(
        &self,
        device_id: &str,
        channel: u8,
        data_type: u8,
        payload: Vec<u8>,
        telemetry: Option<LocationRecord>,
    ) {
        let sequence = {
            let mut streams = self.streams.lock().await;
            let state = streams
                .entry((device_id.to_string(), channel))
                .or_insert_with(|| StreamState {
                    sequence: 0,
                    recent: VecDeque::with_capacity(self.recent_cap),
                });
            state.sequence += 1;
            state.sequence
        };

        let event = FrameBusEvent {
            device_id: device_id.to_string(),
            channel,
            data_type,
            payload,
            telemetry,
            sequence,
        };

        {
            let mut streams = self.streams.lock().await;
            if let Some(state) = streams.get_mut(&(device_id.to_string(), channel)) {
                if state.recent.len() >= self.recent_cap {
                    state.recent.pop_front();
                }
                state.recent.push_back(event.clone());
            }
        }

        let mut subs = self.subscribers.lock().await;
        subs.retain(|s| s.queue.strong_count() > 0);
        for sub in subs.iter() {
            if !sub.filter.matches(&event) {
                continue;
            }
            if let Some(queue) = sub.queue.upgrade() {
                queue.push(event.clone()).await;
            }
        }
    }

    /// Recent frames for a pull-based consumer (default cap 30).
    pub async fn recent(&self, device_id: &str, channel: u8) -> Vec<FrameBusEvent> {
        let streams = self.streams.lock().await;
        streams
            .get(&(device_id.to_string(), channel))
            .map(|s| s.recent.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_matching_events() {
        let bus = FrameBus::new(8);
        let sub = bus
            .subscribe(SubscriptionFilter {
                device_id: Some("dev1".into()),
                channel: None,
            })
            .await;

        bus.publish("dev1", 1, 0, b"a".to_vec(), None).await;
        bus.publish("dev2", 1, 0, b"b".to_vec(), None).await;

        let event = sub.recv().await;
        assert_eq!(event.device_id, "dev1");
        assert_eq!(event.payload, b"a");
    }

    #[tokio::test]
    async fn sequence_numbers_increase_per_stream() {
        let bus = FrameBus::new(8);
        bus.publish("dev1", 1, 0, b"a".to_vec(), None).await;
        bus.publish("dev1", 1, 0, b"b".to_vec(), None).await;
        let recent = bus.recent("dev1", 1).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].sequence, 1);
        assert_eq!(recent[1].sequence, 2);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_rather_than_blocking() {
        let bus = FrameBus::new(2);
        let sub = bus.subscribe(SubscriptionFilter::all()).await;

        for i in 0..5u8 {
            bus.publish("dev1", 1, 0, vec![i], None).await;
        }

        let first = sub.recv().await;
        // With capacity 2 and 5 publishes, only the last two survive.
        assert_eq!(first.payload, vec![3]);
        let second = sub.recv().await;
        assert_eq!(second.payload, vec![4]);
    }

    #[tokio::test]
    async fn recent_ring_is_capped_at_default() {
        let bus = FrameBus::new(64);
        for i in 0..40u16 {
            bus.publish("dev1", 1, 0, i.to_be_bytes().to_vec(), None)
                .await;
        }
        let recent = bus.recent("dev1", 1).await;
        assert_eq!(recent.len(), DEFAULT_RECENT_FRAMES);
    }
}

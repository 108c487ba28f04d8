use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::frame::Frame;

/// What a subscriber queue does when a frame arrives while it is full.
///
/// Both policies discard the oldest queued frame; they differ only in how
/// loudly the loss is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Live viewers: missing frames is acceptable.
    Silent,
    /// Recording: every overflow is logged as a warning.
    Warn,
}

struct SubscriberQueue {
    name: String,
    queue: ArrayQueue<Frame>,
    notify: Notify,
    closed: AtomicBool,
    policy: OverflowPolicy,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

struct BusInner {
    subscribers: DashMap<u64, Arc<SubscriberQueue>>,
    next_id: AtomicU64,
    last_sequence: Mutex<Option<u64>>,
    closed: AtomicBool,
    published: AtomicU64,
    rejected: AtomicU64,
}

/// Per-subscriber delivery counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStats {
    pub name: String,
    pub delivered: u64,
    pub dropped: u64,
    pub queued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub rejected: u64,
    pub subscribers: Vec<SubscriberStats>,
}

/// Fan-out point between the capture loop and frame consumers.
///
/// Each subscriber owns a bounded queue. `publish` never waits: when a queue is
/// full its oldest frame is evicted to make room.
#[derive(Clone)]
pub struct FrameBus {
    inner: Arc<BusInner>,
    default_depth: usize,
}

impl FrameBus {
    pub fn new(default_depth: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                last_sequence: Mutex::new(None),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
            default_depth: default_depth.max(1),
        }
    }

    /// Attach a silent subscriber with the bus default depth
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        self.subscribe_with(name, self.default_depth, OverflowPolicy::Silent)
    }

    /// Attach a subscriber with an explicit queue depth and overflow policy
    pub fn subscribe_with(
        &self,
        name: impl Into<String>,
        depth: usize,
        policy: OverflowPolicy,
    ) -> Subscription {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            name: name.clone(),
            queue: ArrayQueue::new(depth.max(1)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            policy,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        self.inner.subscribers.insert(id, queue.clone());
        // Checked after registering so a concurrent close() is never missed
        if self.inner.closed.load(Ordering::Acquire) {
            queue.closed.store(true, Ordering::Release);
            queue.notify.notify_one();
        }
        debug!("Subscriber '{}' attached (id={}, depth={})", name, id, depth);

        Subscription {
            id,
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver a frame to every attached subscriber.
    ///
    /// Returns false when the frame was rejected (bus closed, or sequence not
    /// greater than the last published one).
    pub fn publish(&self, frame: Frame) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            trace!("Bus closed, dropping frame {}", frame.sequence());
            return false;
        }

        {
            let mut last = self.inner.last_sequence.lock();
            if let Some(previous) = *last {
                if frame.sequence() <= previous {
                    self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Rejecting out-of-order frame {} (last published {})",
                        frame.sequence(),
                        previous
                    );
                    return false;
                }
            }
            *last = Some(frame.sequence());
        }

        for entry in self.inner.subscribers.iter() {
            let subscriber = entry.value();
            if let Some(evicted) = subscriber.queue.force_push(frame.clone()) {
                let dropped = subscriber.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                match subscriber.policy {
                    OverflowPolicy::Warn => warn!(
                        "Subscriber '{}' queue full, dropped frame {} ({} dropped so far)",
                        subscriber.name,
                        evicted.sequence(),
                        dropped
                    ),
                    OverflowPolicy::Silent => trace!(
                        "Subscriber '{}' dropped frame {}",
                        subscriber.name,
                        evicted.sequence()
                    ),
                }
            }
            subscriber.notify.notify_one();
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Stop accepting frames. Subscribers drain what is queued, then see end of stream.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.inner.subscribers.iter() {
            entry.value().closed.store(true, Ordering::Release);
            entry.value().notify.notify_one();
        }
        debug!(
            "Bus closed after {} frames",
            self.inner.published.load(Ordering::Relaxed)
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn stats(&self) -> BusStats {
        let mut subscribers: Vec<SubscriberStats> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        subscribers.sort_by(|a, b| a.name.cmp(&b.name));

        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            subscribers,
        }
    }
}

impl SubscriberQueue {
    fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            name: self.name.clone(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queued: self.queue.len(),
        }
    }
}

/// Receiving end of one bus subscriber. Dropping it detaches from the bus.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Wait for the next frame. Returns `None` once the bus is closed and the
    /// queue has been drained.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.try_recv() {
                return Some(frame);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return self.try_recv();
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take the next queued frame without waiting
    pub fn try_recv(&self) -> Option<Frame> {
        let frame = self.queue.queue.pop()?;
        self.queue.delivered.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn name(&self) -> &str {
        &self.queue.name
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SubscriberStats {
        self.queue.stats()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.remove(&self.id);
            debug!("Subscriber '{}' detached (id={})", self.queue.name, self.id);
        }
    }
}

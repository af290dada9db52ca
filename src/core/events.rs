//! Typed fan-out of engine notifications.
//!
//! Subscribers register explicitly and own a bounded queue. Publishing never
//! blocks: a full queue drops the event for that subscriber (counted), and a
//! dropped [`Subscription`] unregisters itself on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::clock::CognitiveMode;
use crate::stream::StreamId;

/// Queue bound for subscribers that do not ask for one.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// What the engine reports to downstream consumers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type"))]
pub enum EngineEvent {
    StepChanged {
        old: u8,
        new: u8,
        cycle: u64,
    },
    CycleCompleted {
        cycle: u64,
    },
    /// The step table switched between expressive and reflective steps.
    ModeChanged {
        old: CognitiveMode,
        new: CognitiveMode,
        step: u8,
    },
    StreamUpdated {
        stream_id: StreamId,
        step: u8,
        activation_level: f64,
        state_snapshot: Arc<[f64]>,
    },
    TriadicSync {
        triad_index: u8,
        step: u8,
        quality: f64,
        partial: bool,
        participants: Vec<StreamId>,
    },
    RelevanceRealized {
        step: u8,
        relevance: f64,
    },
}

pub struct EventBus<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
    capacity: usize,
    dropped: AtomicU64,
    published: AtomicU64,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl<T> EventBus<T> {
    /// `capacity` bounds each queue handed out by [`EventBus::subscribe_default`].
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self, capacity: usize) -> Subscription<T> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.lock().push(tx);
        Subscription { rx }
    }

    pub fn subscribe_default(&self) -> Subscription<T> {
        self.subscribe(self.capacity)
    }

    pub fn publish(&self, event: T) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliveries skipped because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// `None` on timeout or once the bus is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything queued right now, in publish order.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_events_in_order() {
        let bus = EventBus::new();
        let a = bus.subscribe(8);
        let b = bus.subscribe(8);
        for cycle in 0..3 {
            bus.publish(EngineEvent::CycleCompleted { cycle });
        }
        let expected: Vec<EngineEvent> = (0..3).map(|cycle| EngineEvent::CycleCompleted { cycle }).collect();
        assert_eq!(a.drain(), expected);
        assert_eq!(b.drain(), expected);
        assert_eq!(bus.published(), 3);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let bus = EventBus::new();
        let slow = bus.subscribe(2);
        for i in 0..5u8 {
            bus.publish(i);
        }
        assert_eq!(slow.drain(), vec![0, 1]);
        assert_eq!(bus.dropped(), 3);
    }

    #[test]
    fn default_subscription_uses_bus_capacity() {
        let bus = EventBus::with_capacity(3);
        let sub = bus.subscribe_default();
        for i in 0..10u32 {
            bus.publish(i);
        }
        assert_eq!(bus.capacity(), 3);
        assert_eq!(sub.drain(), vec![0, 1, 2]);
        assert_eq!(bus.dropped(), 7);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe(4);
        let gone = bus.subscribe(4);
        drop(gone);
        bus.publish(7u32);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.try_recv(), Some(7));
        assert!(keep.recv_timeout(Duration::from_millis(5)).is_none());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent::TriadicSync {
            triad_index: 1,
            step: 5,
            quality: 0.75,
            partial: false,
            participants: vec![0, 1, 2],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"TriadicSync""#));
        let back: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}

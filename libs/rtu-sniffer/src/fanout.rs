//! Per-consumer event fan-out
//!
//! Every consumer owns a bounded queue. Publishing never waits: when a
//! consumer's queue is full the event is dropped for that consumer only,
//! so a slow exporter cannot stall the capture pipeline. Each consumer
//! still sees the events it receives in publish order.
//!
//! One extra slot per queue is held back for the final event handed to
//! [`EventBus::finish`], which therefore always reaches a live consumer.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, warn};

/// Queue slots kept free for the final event
const RESERVED_SLOTS: usize = 1;

struct Subscriber<T> {
    name: String,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Subscriber<T> {
    fn lagged(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Consumer '{}' is lagging, event dropped ({} total)",
            self.name, total
        );
    }
}

/// Fan-out of cloned events to independent consumers
pub struct EventBus<T> {
    subscribers: Vec<Subscriber<T>>,
    capacity: usize,
}

impl<T: Clone> EventBus<T> {
    /// `capacity` is the queue depth of each consumer
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&mut self, name: impl Into<String>) -> Subscription<T> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(self.capacity + RESERVED_SLOTS);
        let dropped = Arc::new(AtomicU64::new(0));
        debug!("Consumer subscribed: {}", name);
        self.subscribers.push(Subscriber {
            name: name.clone(),
            tx,
            dropped: Arc::clone(&dropped),
        });
        Subscription { name, rx, dropped }
    }

    /// Deliver `event` to every consumer without waiting
    ///
    /// Returns the number of consumers that accepted it.
    pub fn publish(&mut self, event: &T) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|subscriber| {
            if subscriber.tx.is_closed() {
                debug!("Consumer '{}' went away, unsubscribing", subscriber.name);
                return false;
            }
            // Only this bus sends, so free slots cannot shrink before try_send
            if subscriber.tx.capacity() <= RESERVED_SLOTS {
                subscriber.lagged();
                return true;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                },
                Err(TrySendError::Full(_)) => {
                    subscriber.lagged();
                    true
                },
                Err(TrySendError::Closed(_)) => {
                    debug!("Consumer '{}' went away, unsubscribing", subscriber.name);
                    false
                },
            }
        });
        delivered
    }

    /// Deliver `last` into the reserved slot of every consumer, then close
    ///
    /// Returns the number of consumers that accepted it.
    pub fn finish(&mut self, last: &T) -> usize {
        let delivered = self
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.tx.try_send(last.clone()).is_ok())
            .count();
        self.close();
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Events dropped so far for a consumer
    pub fn dropped(&self, name: &str) -> Option<u64> {
        self.subscribers
            .iter()
            .find(|subscriber| subscriber.name == name)
            .map(|subscriber| subscriber.dropped.load(Ordering::Relaxed))
    }

    /// Drop all senders; every consumer's stream ends after its backlog
    pub fn close(&mut self) {
        self.subscribers.clear();
    }
}

/// Receiving end of one consumer
#[derive(Debug)]
pub struct Subscription<T> {
    name: String,
    rx: mpsc::Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the bus is closed and drained
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next event if one is queued
    pub fn try_recv(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Events this consumer missed because its queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

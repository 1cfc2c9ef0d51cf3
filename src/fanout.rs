//! # Fan-out Module
//!
//! Broadcasts every applied telemetry update to live subscribers.
//!
//! Backed by a bounded `tokio::sync::broadcast` channel. A subscriber that
//! falls more than `buffer` events behind skips the oldest events instead of
//! slowing ingestion or the other subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// One applied update, shared between all subscribers
#[derive(Debug, Clone)]
pub struct LiveUpdate {
    /// Position in publish order, starting at 0
    pub sequence: u64,
    /// The update exactly as received
    pub update: Arc<Value>,
}

/// Publishing side of the fan-out
#[derive(Debug, Clone)]
pub struct Fanout {
    sender: broadcast::Sender<LiveUpdate>,
    sequence: Arc<AtomicU64>,
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl Fanout {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Send `update` to every current subscriber.
    ///
    /// Returns the number of subscribers the event was queued for. Having no
    /// subscribers is not an error.
    pub fn publish(&self, update: Value) -> usize {
        let event = LiveUpdate {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            update: Arc::new(update),
        };
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        debug!("New live subscriber ({} total)", self.sender.receiver_count() + 1);
        Subscription {
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving side of the fan-out for one subscriber
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<LiveUpdate>,
    missed: u64,
}

impl Subscription {
    /// Next event in publish order, or `None` once the fan-out is gone.
    ///
    /// Events dropped because this subscriber lagged are skipped and counted
    /// in [`Subscription::missed`].
    pub async fn recv(&mut self) -> Option<LiveUpdate> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    self.missed += skipped;
                    warn!("Slow subscriber skipped {} updates", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Total events skipped so far.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

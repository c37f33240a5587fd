use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct PooledOffer {
    payload: Value,
    expires_at: Instant,
}

/// Result of taking an offer out of a pool.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Pop {
    Fresh(Value),
    /// The oldest offer had expired; the pool was cleared.
    Expired { dropped: usize },
    Empty,
}

impl Pop {
    /// Whether the owner should be asked for a new offer.
    pub(crate) fn wants_replenish(&self) -> bool {
        !matches!(self, Pop::Empty)
    }
}

/// Bounded FIFO of connection offers contributed by one client.
#[derive(Debug)]
pub(crate) struct OfferPool {
    queue: VecDeque<PooledOffer>,
    capacity: usize,
    ttl: Duration,
}

impl OfferPool {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            ttl,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Queue an offer; returns `false` when the pool is full and the offer
    /// was dropped.
    pub(crate) fn push(&mut self, payload: Value, now: Instant) -> bool {
        if self.queue.len() >= self.capacity {
            return false;
        }
        self.queue.push_back(PooledOffer {
            payload,
            expires_at: now + self.ttl,
        });
        true
    }

    /// Take the oldest offer if it is still fresh at `now`.
    ///
    /// Offers arrive in bursts, so once the oldest has expired the rest are
    /// treated as stale too and the whole pool is discarded.
    pub(crate) fn pop_fresh(&mut self, now: Instant) -> Pop {
        match self.queue.pop_front() {
            None => Pop::Empty,
            Some(offer) if now <= offer.expires_at => Pop::Fresh(offer.payload),
            Some(_) => {
                let dropped = 1 + self.queue.len();
                self.queue.clear();
                Pop::Expired { dropped }
            }
        }
    }
}

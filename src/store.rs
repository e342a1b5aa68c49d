//! Bounded, time-decaying counter store backing the rate limiter.
//!
//! # Eviction
//!
//! The store holds at most `max_keys` buckets. Two independent rules retire a
//! bucket:
//!
//! - **Capacity**: inserting a new key while full evicts the least recently
//!   touched key.
//! - **Time**: a bucket whose `reset_at` has passed is treated as absent. Expiry
//!   is lazy; it is checked when the key is touched or peeked, never swept.
//!
//! # Concurrency
//!
//! All mutations happen under a single `parking_lot::Mutex`, so concurrent
//! touches of the same key never lose an increment.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::clock::{Clock, SystemClock};

/// Per-client request counter for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Requests observed in the current window, including the latest one.
    pub count: u64,
    /// When the current window closes.
    pub reset_at: DateTime<Utc>,
}

impl Bucket {
    fn open(now: DateTime<Utc>, window: chrono::Duration) -> Self {
        Self {
            count: 0,
            reset_at: now
                .checked_add_signed(window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// A bucket is live strictly before its reset instant.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.reset_at
    }
}

/// Fixed-capacity LRU of [`Bucket`]s with lazy TTL expiry.
pub struct CounterStore {
    entries: Mutex<LruCache<String, Bucket>>,
    capacity: NonZeroUsize,
    window: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl CounterStore {
    /// Create a store using the system clock.
    pub fn new(capacity: NonZeroUsize, window: chrono::Duration) -> Self {
        Self::with_clock(capacity, window, Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(
        capacity: NonZeroUsize,
        window: chrono::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // `LruCache::new` preallocates every slot; capacity is enforced in `touch`.
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            capacity,
            window,
            clock,
        }
    }

    /// Record one observation of `key` and return the post-increment bucket.
    ///
    /// A missing or expired bucket is replaced by a fresh window before
    /// incrementing, so the first touch of a window always yields `count == 1`.
    pub fn touch(&self, key: &str) -> Bucket {
        let key = key.to_owned();
        let mut entries = self.entries.lock();
        let now = self.clock.now();

        if let Some(bucket) = entries.get_mut(&key) {
            if !bucket.is_live(now) {
                trace!(client = %key, "Bucket expired, opening a new window");
                let fresh = Bucket::open(now, self.window);
                // Never move the window backward, even if the clock did.
                bucket.reset_at = fresh.reset_at.max(bucket.reset_at);
                bucket.count = 0;
            }
            bucket.count = bucket.count.saturating_add(1);
            return *bucket;
        }

        if entries.len() >= self.capacity.get()
            && let Some((evicted, _)) = entries.pop_lru()
        {
            trace!(client = %evicted, "Evicted least recently used bucket");
        }

        let mut bucket = Bucket::open(now, self.window);
        bucket.count = 1;
        entries.push(key, bucket);
        bucket
    }

    /// Look at a live bucket without counting a request or refreshing recency.
    pub fn peek(&self, key: &str) -> Option<Bucket> {
        let key = key.to_owned();
        let entries = self.entries.lock();
        let now = self.clock.now();
        entries
            .peek(&key)
            .copied()
            .filter(|bucket| bucket.is_live(now))
    }

    /// Number of buckets currently held, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds no buckets.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Maximum number of buckets.
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Length of one counting window.
    pub fn window(&self) -> chrono::Duration {
        self.window
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

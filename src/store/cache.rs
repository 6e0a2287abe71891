//! Bounded query-result caches.
//!
//! Eviction is insertion-ordered: once over capacity the oldest inserted
//! key goes first. Re-inserting a key moves it to the back.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use crate::models::{Candle, Millis, Source, StoredEvent};

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub rows: Vec<V>,
    /// Inclusive range the rows were computed for.
    pub covered: (Millis, Millis),
    /// Store data epoch observed before the rows were read.
    pub epoch: u64,
}

impl<V> CacheEntry<V> {
    pub fn covers(&self, start_ms: Millis, end_ms: Millis) -> bool {
        self.covered.0 <= start_ms && end_ms <= self.covered.1
    }
}

#[derive(Debug)]
pub struct QueryCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> QueryCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    /// Insert and evict; returns the number of evicted entries.
    pub fn insert(&mut self, key: K, entry: CacheEntry<V>) -> usize {
        if self.entries.insert(key.clone(), entry).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);

        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandleCacheKey {
    pub symbol: String,
    pub resolution_ms: Millis,
    pub source: Option<Source>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventCacheKey {
    pub symbol: String,
    pub start_ms: Millis,
    pub end_ms: Millis,
}

/// Everything guarded by the store's cache lock.
pub struct QueryCaches {
    pub candles: QueryCache<CandleCacheKey, Candle>,
    pub events: QueryCache<EventCacheKey, StoredEvent>,
}

impl QueryCaches {
    pub fn new(max_candle_entries: usize, max_event_entries: usize) -> Self {
        Self {
            candles: QueryCache::new(max_candle_entries),
            events: QueryCache::new(max_event_entries),
        }
    }

    pub fn clear(&mut self) {
        self.candles.clear();
        self.events.clear();
    }
}

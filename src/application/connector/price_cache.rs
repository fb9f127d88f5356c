use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    price: Decimal,
    inserted: Instant,
    last_used: u64,
}

/// Per-symbol last-price cache with TTL expiry and LRU eviction. Keeps the
/// hot trading path off the REST API.
pub struct PriceCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    map: HashMap<String, Entry>,
    clock: u64,
}

impl PriceCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                clock: 0,
            }),
        }
    }

    pub fn insert(&self, symbol: &str, price: Decimal) {
        let mut inner = self.inner.lock().expect("price cache lock poisoned");
        inner.clock += 1;
        let clock = inner.clock;

        if inner.map.len() >= self.capacity && !inner.map.contains_key(symbol) {
            if let Some(evict) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&evict);
            }
        }

        inner.map.insert(
            symbol.to_string(),
            Entry {
                price,
                inserted: Instant::now(),
                last_used: clock,
            },
        );
    }

    /// Fresh price or nothing; expired entries are dropped on access.
    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        let mut inner = self.inner.lock().expect("price cache lock poisoned");
        inner.clock += 1;
        let clock = inner.clock;
        match inner.map.get_mut(symbol) {
            Some(entry) if entry.inserted.elapsed() <= self.ttl => {
                entry.last_used = clock;
                Some(entry.price)
            }
            Some(_) => {
                inner.map.remove(symbol);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("price cache lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

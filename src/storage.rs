//! Local key/value storage with per-entry expiration.
//!
//! The engine keeps three of these: values we originated (never expire),
//! values others asked us to store (republished and expired), and cached
//! copies placed by lookups (expired, shorter TTL).

use std::num::NonZeroUsize;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::id::Identifier;

/// Default capacity when none is configured.
const DEFAULT_CAPACITY: usize = 100_000;

/// A stored value and its republish bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: String,
    /// Last time the value was stored or republished.
    pub republished_at: DateTime<Utc>,
    /// Lifetime measured from `republished_at`.
    pub expiration_secs: u64,
}

impl StoredValue {
    /// Whether the entry has outlived its expiration at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.republished_at >= seconds(self.expiration_secs)
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// Bounded key/value store; the least recently used entry is dropped when
/// capacity is reached.
#[derive(Debug)]
pub struct ValueStore {
    cache: LruCache<Identifier, StoredValue>,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ValueStore {
    /// Create a store holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Insert or overwrite `key`, stamping it as republished now.
    pub fn set(&mut self, key: Identifier, value: impl Into<String>, expiration_secs: u64) {
        self.set_at(key, value, expiration_secs, Utc::now());
    }

    /// Insert or overwrite `key` with an explicit timestamp.
    pub fn set_at(
        &mut self,
        key: Identifier,
        value: impl Into<String>,
        expiration_secs: u64,
        now: DateTime<Utc>,
    ) {
        self.cache.put(
            key,
            StoredValue {
                value: value.into(),
                republished_at: now,
                expiration_secs,
            },
        );
    }

    /// Look up a value, promoting it to most recently used.
    pub fn get(&mut self, key: &Identifier) -> Option<String> {
        self.cache.get(key).map(|entry| entry.value.clone())
    }

    /// Full entry without touching recency.
    pub fn entry(&self, key: &Identifier) -> Option<&StoredValue> {
        self.cache.peek(key)
    }

    pub fn contains(&self, key: &Identifier) -> bool {
        self.cache.contains(key)
    }

    /// Reset the republish timestamp of `key`.
    pub fn touch(&mut self, key: &Identifier) {
        if let Some(entry) = self.cache.peek_mut(key) {
            entry.republished_at = Utc::now();
        }
    }

    pub fn remove(&mut self, key: &Identifier) -> Option<StoredValue> {
        self.cache.pop(key)
    }

    pub fn keys(&self) -> Vec<Identifier> {
        self.cache.iter().map(|(k, _)| *k).collect()
    }

    /// Entries not republished since `before`.
    pub fn untouched_since(&self, before: DateTime<Utc>) -> Vec<(Identifier, StoredValue)> {
        self.cache
            .iter()
            .filter(|(_, v)| v.republished_at < before)
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Drop every entry expired at `now`, returning the removed keys.
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<Identifier> {
        let expired: Vec<Identifier> = self
            .cache
            .iter()
            .filter(|(_, v)| v.is_expired(now))
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.cache.pop(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }
}

impl Clone for ValueStore {
    fn clone(&self) -> Self {
        let mut copy = ValueStore::new(self.capacity());
        for (key, value) in self.cache.iter().rev() {
            copy.cache.put(*key, value.clone());
        }
        copy
    }
}

/// Serialized form: capacity plus entries from least to most recently used.
#[derive(Serialize, Deserialize)]
struct StoreImage {
    capacity: usize,
    entries: Vec<(Identifier, StoredValue)>,
}

impl Serialize for ValueStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries = self
            .cache
            .iter()
            .rev()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        StoreImage {
            capacity: self.capacity(),
            entries,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ValueStore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let image = StoreImage::deserialize(deserializer)?;
        let mut store = ValueStore::new(image.capacity);
        for (key, value) in image.entries {
            store.cache.put(key, value);
        }
        Ok(store)
    }
}

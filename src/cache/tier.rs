use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub tier: Tier,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    #[serde(skip)]
    tick: u64,
}

impl CacheEntry {
    pub(crate) fn new(key: String, value: Value, tier: Tier) -> Self {
        Self {
            key,
            value,
            tier,
            last_access: Utc::now(),
            access_count: 1,
            tick: 0,
        }
    }
}

/// One cache level: entries plus an access-order index for LRU.
#[derive(Debug)]
pub(crate) struct TierStore {
    tier: Tier,
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    // tick -> key, oldest first
    recency: BTreeMap<u64, String>,
}

impl TierStore {
    pub(crate) fn new(tier: Tier, capacity: usize) -> Self {
        Self {
            tier,
            capacity,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub(crate) fn over_capacity(&self) -> bool {
        self.entries.len() > self.capacity
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Record an access and return the entry
    pub(crate) fn touch(&mut self, key: &str, tick: u64) -> Option<&CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        entry.last_access = Utc::now();
        entry.access_count += 1;
        self.recency.insert(tick, entry.key.clone());
        Some(entry)
    }

    /// Replace the value of an existing entry, counting it as an access
    pub(crate) fn update(&mut self, key: &str, value: Value, tick: u64) -> bool {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value;
        } else {
            return false;
        }
        self.touch(key, tick).is_some()
    }

    /// Insert without eviction; the caller makes room first
    pub(crate) fn insert(&mut self, mut entry: CacheEntry, tick: u64) {
        entry.tier = self.tier;
        entry.tick = tick;
        if let Some(previous) = self.entries.remove(&entry.key) {
            self.recency.remove(&previous.tick);
        }
        self.recency.insert(tick, entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    pub(crate) fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key)
    }

    /// Lowest access count, then oldest access
    pub(crate) fn pop_least_valuable(&mut self) -> Option<CacheEntry> {
        let key = self
            .entries
            .values()
            .min_by_key(|entry| (entry.access_count, entry.tick))
            .map(|entry| entry.key.clone())?;
        self.remove(&key)
    }
}

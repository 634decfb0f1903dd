use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::cache::tier::{CacheEntry, Tier, TierStore};
use crate::core::config::CacheConfig;
use crate::core::errors::{EngineError, Result};
use crate::storage::ConnectionPoolManager;

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub primary_capacity: usize,
    pub secondary_capacity: usize,
    pub primary_len: usize,
    pub secondary_len: usize,
    pub primary_hits: u64,
    pub secondary_hits: u64,
    pub misses: u64,
    pub pool_reads: u64,
    pub pool_writes: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub evictions: u64,
    pub resizes: u64,
    /// Secondary hit rate over the last completed measurement window
    pub last_window_hit_rate: Option<f64>,
}

impl CacheMetrics {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.primary_hits + self.secondary_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct CacheState {
    primary: TierStore,
    secondary: TierStore,
    tick: u64,
    /// Bumped by every invalidation; pool reads started before a bump are not cached
    invalidations: u64,
    window_lookups: u64,
    window_hits: u64,
    metrics: CacheMetrics,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Insert into Primary, demoting its LRU entry when full
    fn insert_primary(&mut self, entry: CacheEntry) {
        if !self.primary.contains(&entry.key) {
            while self.primary.is_full() {
                match self.primary.pop_lru() {
                    Some(demoted) => self.demote(demoted),
                    None => break,
                }
            }
        }
        let tick = self.next_tick();
        self.primary.insert(entry, tick);
    }

    fn demote(&mut self, entry: CacheEntry) {
        while self.secondary.is_full() {
            match self.secondary.pop_least_valuable() {
                Some(evicted) => {
                    self.metrics.evictions += 1;
                    trace!(key = %evicted.key, "Evicted from secondary");
                }
                None => break,
            }
        }
        self.metrics.demotions += 1;
        if self.secondary.capacity() == 0 {
            self.metrics.evictions += 1;
            return;
        }
        let tick = self.next_tick();
        self.secondary.insert(entry, tick);
    }

    fn record_secondary_lookup(&mut self, hit: bool, config: &CacheConfig) {
        self.window_lookups += 1;
        if hit {
            self.window_hits += 1;
        }
        if self.window_lookups < config.measurement_window {
            return;
        }

        let rate = self.window_hits as f64 / self.window_lookups as f64;
        self.metrics.last_window_hit_rate = Some(rate);
        self.window_lookups = 0;
        self.window_hits = 0;

        if rate >= config.secondary_hit_rate_threshold {
            return;
        }
        let step = config
            .resize_step
            .min(
                self.secondary
                    .capacity()
                    .saturating_sub(config.min_secondary_capacity),
            )
            .min(
                config
                    .max_primary_capacity
                    .saturating_sub(self.primary.capacity()),
            );
        if step == 0 {
            return;
        }

        self.secondary
            .set_capacity(self.secondary.capacity() - step);
        self.primary.set_capacity(self.primary.capacity() + step);
        while self.secondary.over_capacity() {
            if self.secondary.pop_least_valuable().is_some() {
                self.metrics.evictions += 1;
            } else {
                break;
            }
        }
        self.metrics.resizes += 1;
        info!(
            hit_rate = rate,
            primary = self.primary.capacity(),
            secondary = self.secondary.capacity(),
            "Resized cache tiers"
        );
    }
}

/// Two-tier cache in front of the connection pool.
///
/// Writes go to the pool before the cache, so an entry never exists only in memory.
pub struct CacheCoordinator {
    state: Mutex<CacheState>,
    pool: ConnectionPoolManager,
    config: CacheConfig,
}

impl CacheCoordinator {
    pub fn new(config: CacheConfig, pool: ConnectionPoolManager) -> Self {
        let metrics = CacheMetrics {
            primary_capacity: config.primary_capacity,
            secondary_capacity: config.secondary_capacity,
            ..Default::default()
        };
        Self {
            state: Mutex::new(CacheState {
                primary: TierStore::new(Tier::Primary, config.primary_capacity),
                secondary: TierStore::new(Tier::Secondary, config.secondary_capacity),
                tick: 0,
                invalidations: 0,
                window_lookups: 0,
                window_hits: 0,
                metrics,
            }),
            pool,
            config,
        }
    }

    pub fn pool(&self) -> &ConnectionPoolManager {
        &self.pool
    }

    /// Look up `key` in Primary, then Secondary, then the pool
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let seen = {
            let mut state = self.state.lock();
            let tick = state.next_tick();
            if let Some(entry) = state.primary.touch(key, tick) {
                let value = entry.value.clone();
                state.metrics.primary_hits += 1;
                trace!(key = %key, "Primary hit");
                return Ok(Some(value));
            }

            if let Some(mut entry) = state.secondary.remove(key) {
                entry.access_count += 1;
                entry.last_access = chrono::Utc::now();
                let value = entry.value.clone();
                state.metrics.secondary_hits += 1;
                state.metrics.promotions += 1;
                state.insert_primary(entry);
                state.record_secondary_lookup(true, &self.config);
                debug!(key = %key, "Secondary hit, promoted");
                return Ok(Some(value));
            }

            state.metrics.misses += 1;
            state.record_secondary_lookup(false, &self.config);
            state.invalidations
        };

        let bytes = self.pool.read(key).await?;
        self.state.lock().metrics.pool_reads += 1;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::serialization(format!("cache entry {}", key), e))?;

        self.fill(key, &value, seen);
        Ok(Some(value))
    }

    /// Cache a value read from the pool unless the key changed since the read began
    fn fill(&self, key: &str, value: &Value, seen: u64) -> bool {
        let mut state = self.state.lock();
        if state.invalidations != seen {
            trace!(key = %key, "Skipping fill after concurrent invalidation");
            return false;
        }
        // A concurrent put may have landed a newer value meanwhile
        if state.primary.contains(key) || state.secondary.contains(key) {
            return false;
        }
        state.insert_primary(CacheEntry::new(key.to_string(), value.clone(), Tier::Primary));
        true
    }

    /// Persist `value` through the pool, then cache it in Primary
    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;
        self.pool.write(key, &bytes).await?;

        let mut state = self.state.lock();
        state.metrics.pool_writes += 1;
        let tick = state.next_tick();
        if state.primary.update(key, value.clone(), tick) {
            return Ok(());
        }
        let entry = state
            .secondary
            .remove(key)
            .map(|mut entry| {
                entry.value = value.clone();
                entry
            })
            .unwrap_or_else(|| CacheEntry::new(key.to_string(), value, Tier::Primary));
        state.insert_primary(entry);
        debug!(key = %key, "Cached write");
        Ok(())
    }

    /// Drop `key` from both tiers and the store
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        {
            let mut state = self.state.lock();
            state.invalidations += 1;
            state.primary.remove(key);
            state.secondary.remove(key);
        }
        self.pool.remove(key).await
    }

    pub fn contains(&self, key: &str) -> Option<Tier> {
        let state = self.state.lock();
        if state.primary.contains(key) {
            Some(Tier::Primary)
        } else if state.secondary.contains(key) {
            Some(Tier::Secondary)
        } else {
            None
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = self.state.lock();
        CacheMetrics {
            primary_capacity: state.primary.capacity(),
            secondary_capacity: state.secondary.capacity(),
            primary_len: state.primary.len(),
            secondary_len: state.secondary.len(),
            ..state.metrics.clone()
        }
    }
}

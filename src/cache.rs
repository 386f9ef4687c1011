// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runtime asset cache
//!
//! Type-erased cache keyed on `(AssetId, runtime type)`. Entries own their
//! asset and hand out reference-counted [`AssetHandle`]s; an entry may be
//! evicted only when nothing references it and it is older than the age
//! gate. Handles stay safe across `force_remove` because the entry itself
//! is shared, so the asset outlives its cache slot for as long as any
//! handle does.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::id::AssetId;

/// Which entries eviction prefers once the cache is over its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Least recently used first.
    #[default]
    Lru,
    /// Least frequently used first.
    Lfu,
    /// Largest first.
    Size,
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_memory_bytes: usize,
    /// Insertion pressure past this level triggers eviction. Zero means
    /// 90% of `max_memory_bytes`.
    pub eviction_threshold_bytes: usize,
    pub policy: EvictionPolicy,
    /// When set, entries with live handles are never evicted.
    pub evict_only_unreferenced: bool,
    /// Entries younger than this are never evicted.
    pub min_age_before_eviction: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_memory_bytes: 512 * 1024 * 1024,
            eviction_threshold_bytes: 0,
            policy: EvictionPolicy::Lru,
            evict_only_unreferenced: true,
            min_age_before_eviction: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    fn effective_threshold(&self) -> usize {
        if self.eviction_threshold_bytes != 0 {
            self.eviction_threshold_bytes
        } else {
            (self.max_memory_bytes as u64 * 9 / 10) as usize
        }
    }
}

/// One cached asset. Shared between the cache map and every handle.
pub struct CacheEntry {
    id: AssetId,
    type_id: std::any::TypeId,
    asset: Box<dyn Any + Send + Sync>,
    ref_count: AtomicU32,
    /// Millis since the cache's epoch; doubles as the LRU ordering key.
    last_access: AtomicU64,
    access_count: AtomicU64,
    size_bytes: usize,
}

impl CacheEntry {
    pub fn asset_id(&self) -> AssetId {
        self.id
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    id: AssetId,
    type_id: std::any::TypeId,
}

/// Reference-counted handle to a cached asset.
///
/// While at least one handle exists the asset stays resident; dropping the
/// last handle does not free anything by itself, eviction remains the
/// cache's decision.
pub struct AssetHandle<T: 'static> {
    entry: Option<Arc<CacheEntry>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> AssetHandle<T> {
    fn from_entry(entry: Arc<CacheEntry>) -> Self {
        entry.ref_count.fetch_add(1, Ordering::AcqRel);
        AssetHandle {
            entry: Some(entry),
            _marker: PhantomData,
        }
    }

    /// An empty handle referencing nothing.
    pub fn empty() -> Self {
        AssetHandle {
            entry: None,
            _marker: PhantomData,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.entry.is_some()
    }

    /// Borrow the asset. `None` for an empty handle.
    pub fn get(&self) -> Option<&T> {
        self.entry.as_ref()?.asset.downcast_ref::<T>()
    }

    pub fn asset_id(&self) -> Option<AssetId> {
        self.entry.as_ref().map(|e| e.id)
    }

    /// Number of live handles to this entry.
    pub fn use_count(&self) -> u32 {
        self.entry
            .as_ref()
            .map(|e| e.ref_count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn is_unique(&self) -> bool {
        self.use_count() == 1
    }
}

impl<T: 'static> Clone for AssetHandle<T> {
    fn clone(&self) -> Self {
        if let Some(entry) = &self.entry {
            entry.ref_count.fetch_add(1, Ordering::AcqRel);
        }
        AssetHandle {
            entry: self.entry.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> Drop for AssetHandle<T> {
    fn drop(&mut self) {
        if let Some(entry) = &self.entry {
            entry.ref_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<T: 'static> Default for AssetHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// LRU asset cache with reference counting.
pub struct AssetCache {
    config: Mutex<CacheConfig>,
    entries: Mutex<FxHashMap<CacheKey, Arc<CacheEntry>>>,
    memory_usage: AtomicUsize,
    epoch: Instant,
}

impl AssetCache {
    pub fn new(config: CacheConfig) -> Self {
        AssetCache {
            config: Mutex::new(config),
            entries: Mutex::new(FxHashMap::default()),
            memory_usage: AtomicUsize::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Insert an asset, taking ownership. Returns a live handle. Replaces
    /// any existing entry under the same key.
    pub fn insert<T: Any + Send + Sync>(
        &self,
        id: AssetId,
        asset: T,
        size_bytes: usize,
    ) -> AssetHandle<T> {
        let size_bytes = if size_bytes > 0 {
            size_bytes
        } else {
            std::mem::size_of::<T>()
        };

        let threshold = self.config.lock().effective_threshold();
        if self.memory_usage.load(Ordering::Acquire) + size_bytes > threshold {
            self.evict();
        }

        let entry = Arc::new(CacheEntry {
            id,
            type_id: std::any::TypeId::of::<T>(),
            asset: Box::new(asset),
            ref_count: AtomicU32::new(0),
            last_access: AtomicU64::new(self.now_millis()),
            access_count: AtomicU64::new(1),
            size_bytes,
        });

        let key = CacheKey {
            id,
            type_id: entry.type_id,
        };

        let mut entries = self.entries.lock();
        if let Some(old) = entries.insert(key, Arc::clone(&entry)) {
            self.memory_usage.fetch_sub(old.size_bytes, Ordering::AcqRel);
        }
        self.memory_usage.fetch_add(size_bytes, Ordering::AcqRel);

        AssetHandle::from_entry(entry)
    }

    /// Fetch a cached asset, refreshing its position in the LRU order.
    /// Returns an empty handle on miss.
    pub fn get<T: Any + Send + Sync>(&self, id: AssetId) -> AssetHandle<T> {
        let key = CacheKey {
            id,
            type_id: std::any::TypeId::of::<T>(),
        };
        let entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) => {
                entry.last_access.store(self.now_millis(), Ordering::Release);
                entry.access_count.fetch_add(1, Ordering::AcqRel);
                AssetHandle::from_entry(Arc::clone(entry))
            }
            None => AssetHandle::empty(),
        }
    }

    pub fn contains<T: Any + Send + Sync>(&self, id: AssetId) -> bool {
        let key = CacheKey {
            id,
            type_id: std::any::TypeId::of::<T>(),
        };
        self.entries.lock().contains_key(&key)
    }

    /// Remove an entry. Fails (returns false) while any handle references
    /// it.
    pub fn remove<T: Any + Send + Sync>(&self, id: AssetId) -> bool {
        let key = CacheKey {
            id,
            type_id: std::any::TypeId::of::<T>(),
        };
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(&key) else {
            return false;
        };
        if entry.ref_count.load(Ordering::Acquire) > 0 {
            return false;
        }
        let entry = entries.remove(&key).unwrap();
        self.memory_usage.fetch_sub(entry.size_bytes, Ordering::AcqRel);
        true
    }

    /// Remove an entry even while referenced. Existing handles keep their
    /// asset alive; the cache just forgets the slot.
    pub fn force_remove<T: Any + Send + Sync>(&self, id: AssetId) {
        let key = CacheKey {
            id,
            type_id: std::any::TypeId::of::<T>(),
        };
        if let Some(entry) = self.entries.lock().remove(&key) {
            self.memory_usage.fetch_sub(entry.size_bytes, Ordering::AcqRel);
        }
    }

    /// Drop every entry with no live handles. Returns how many went.
    pub fn clear_unreferenced(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.ref_count.load(Ordering::Acquire) == 0 {
                self.memory_usage.fetch_sub(entry.size_bytes, Ordering::AcqRel);
                false
            } else {
                true
            }
        });
        before - entries.len()
    }

    /// Drop everything, referenced or not. Handles stay safe; the assets
    /// they point at simply leave the cache's books.
    pub fn clear_all(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.memory_usage.store(0, Ordering::Release);
    }

    /// Run eviction if usage is at or past the threshold. Walks victims in
    /// policy order, skipping referenced entries without disturbing their
    /// recency, and stops once usage drops to 70% of the maximum. Under
    /// the LRU policy a too-young entry ends the walk early since every
    /// later entry is younger still.
    pub fn evict(&self) -> usize {
        let config = self.config.lock().clone();
        if self.memory_usage.load(Ordering::Acquire) < config.effective_threshold() {
            return 0;
        }

        let target = (config.max_memory_bytes as u64 * 7 / 10) as usize;
        let now = self.now_millis();
        let min_age_millis = config.min_age_before_eviction.as_millis() as u64;

        let mut entries = self.entries.lock();

        let mut victims: Vec<(CacheKey, Arc<CacheEntry>)> = entries
            .iter()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect();
        match config.policy {
            EvictionPolicy::Lru => {
                victims.sort_by_key(|(_, e)| e.last_access.load(Ordering::Acquire));
            }
            EvictionPolicy::Lfu => {
                victims.sort_by_key(|(_, e)| e.access_count.load(Ordering::Acquire));
            }
            EvictionPolicy::Size => {
                victims.sort_by_key(|(_, e)| std::cmp::Reverse(e.size_bytes));
            }
        }

        let mut evicted = 0;
        for (key, entry) in victims {
            if self.memory_usage.load(Ordering::Acquire) <= target {
                break;
            }
            if config.evict_only_unreferenced && entry.ref_count.load(Ordering::Acquire) > 0 {
                continue;
            }
            let age = now.saturating_sub(entry.last_access.load(Ordering::Acquire));
            if age < min_age_millis {
                if config.policy == EvictionPolicy::Lru {
                    // Sorted by recency: everything after this is younger.
                    break;
                }
                continue;
            }

            entries.remove(&key);
            self.memory_usage.fetch_sub(entry.size_bytes, Ordering::AcqRel);
            evicted += 1;
        }

        if evicted > 0 {
            debug!(evicted, usage = self.memory_usage.load(Ordering::Relaxed), "cache eviction");
        }
        evicted
    }

    pub fn cached_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Acquire)
    }

    pub fn referenced_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.ref_count.load(Ordering::Acquire) > 0)
            .count()
    }

    pub fn config(&self) -> CacheConfig {
        self.config.lock().clone()
    }

    /// Swap the configuration and re-run eviction under the new limits.
    pub fn set_config(&self, config: CacheConfig) {
        *self.config.lock() = config;
        self.evict();
    }
}

impl Default for AssetCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

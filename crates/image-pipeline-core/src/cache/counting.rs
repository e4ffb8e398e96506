//! Reference-counted memory cache
//!
//! Every tracked entry is either *in use* (at least one client reference is
//! live) or *exclusively owned* by the cache. Only exclusively owned entries
//! sit in the eviction queue and can be evicted or reused. An entry that is
//! removed from tracking while clients still hold it becomes an *orphan*;
//! its value is released once the last client reference is closed.
//!
//! All bookkeeping happens under one lock. Observer callbacks and value
//! releases always run after that lock is dropped.

use super::lru_map::CountingLruMap;
use super::params::{EvictionPolicy, MemoryCacheParams};
use crate::error::PipelineError;
use crate::reference::{CloseableRef, ResourceReleaser};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, error};

/// Reports the byte size of a cached value
pub trait ValueDescriptor<V>: Send + Sync {
    fn size_in_bytes(&self, value: &V) -> usize;
}

impl<V, F> ValueDescriptor<V> for F
where
    F: Fn(&V) -> usize + Send + Sync,
{
    fn size_in_bytes(&self, value: &V) -> usize {
        self(value)
    }
}

/// Notified when an entry enters or leaves the eviction queue
pub trait EntryStateObserver<K>: Send + Sync {
    fn on_exclusivity_changed(&self, key: &K, is_exclusive: bool);
}

/// Counters describing cache effectiveness
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCacheStats {
    /// Tracked entries
    pub count: usize,

    /// Bytes of tracked entries
    pub size_bytes: usize,

    /// Entries with at least one live client reference
    pub in_use_count: usize,

    pub in_use_size_bytes: usize,

    /// Entries in the eviction queue
    pub exclusive_count: usize,

    pub exclusive_size_bytes: usize,

    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
}

struct Entry<K, V> {
    key: K,
    value: CloseableRef<V>,
    size: usize,
    client_count: u32,
    is_orphan: bool,
    access_count: u64,
    insert_stamp: u64,
    observer: Option<Arc<dyn EntryStateObserver<K>>>,
}

struct State<K, V> {
    /// Tracked and orphaned entries, by entry id
    entries: HashMap<u64, Entry<K, V>>,
    cached: CountingLruMap<K, u64>,
    exclusive: CountingLruMap<K, u64>,
    next_id: u64,
    next_stamp: u64,
    hits: u64,
    misses: u64,
    puts: u64,
    evictions: u64,
}

impl<K: Clone + Eq + Hash, V> State<K, V> {
    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn in_use_count(&self) -> usize {
        self.cached.count() - self.exclusive.count()
    }

    fn in_use_size(&self) -> usize {
        self.cached.size_in_bytes() - self.exclusive.size_in_bytes()
    }

    /// Mark an untracked entry orphaned and return its value if no client
    /// still holds it
    fn orphan(&mut self, id: u64) -> Option<Removed<K, V>> {
        let entry = self.entries.get_mut(&id)?;
        entry.is_orphan = true;
        if entry.client_count > 0 {
            return None;
        }
        let entry = self.entries.remove(&id)?;
        Some(Removed {
            key: entry.key,
            _value: entry.value,
            observer: entry.observer,
        })
    }

    fn observer(&self, id: u64) -> Option<(K, Arc<dyn EntryStateObserver<K>>)> {
        let entry = self.entries.get(&id)?;
        entry
            .observer
            .as_ref()
            .map(|observer| (entry.key.clone(), Arc::clone(observer)))
    }
}

/// Entry taken out of the cache; its value is released on drop
struct Removed<K, V> {
    key: K,
    _value: CloseableRef<V>,
    observer: Option<Arc<dyn EntryStateObserver<K>>>,
}

struct Inner<K, V> {
    state: Mutex<State<K, V>>,
    params: Mutex<MemoryCacheParams>,
    descriptor: Box<dyn ValueDescriptor<V>>,
    name: String,
}

/// Memory cache that tracks shared and exclusive ownership of its values
///
/// Cloning the cache is cheap and yields a handle to the same storage.
pub struct CountingMemoryCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for CountingMemoryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Releaser attached to every client reference
struct ClientReleaser<K, V> {
    cache: CountingMemoryCache<K, V>,
    entry_id: u64,
}

impl<K, V> ResourceReleaser<V> for ClientReleaser<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
    V: Send + Sync + 'static,
{
    fn release(&self, _value: Arc<V>) {
        self.cache.release_client_reference(self.entry_id);
    }
}

impl<K, V> CountingMemoryCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
    V: Send + Sync + 'static,
{
    /// Create a cache with the given limits and size function
    pub fn new(
        name: impl Into<String>,
        params: MemoryCacheParams,
        descriptor: impl ValueDescriptor<V> + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    cached: CountingLruMap::new(),
                    exclusive: CountingLruMap::new(),
                    next_id: 0,
                    next_stamp: 0,
                    hits: 0,
                    misses: 0,
                    puts: 0,
                    evictions: 0,
                }),
                params: Mutex::new(params),
                descriptor: Box::new(descriptor),
                name: name.into(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> MemoryCacheParams {
        self.inner.params.lock().clone()
    }

    /// Replace the limits and evict down to them
    pub fn set_params(&self, params: MemoryCacheParams) {
        *self.inner.params.lock() = params;
        self.maybe_evict_entries();
    }

    /// Cache `value` under `key` and return a client reference to it.
    ///
    /// The caller keeps its own reference. An existing entry for the key is
    /// replaced; if clients still hold the old value it stays alive as an
    /// orphan. Returns `None` when the value does not fit the limits.
    pub fn cache(
        &self,
        key: K,
        value: &CloseableRef<V>,
        observer: Option<Arc<dyn EntryStateObserver<K>>>,
    ) -> Option<CloseableRef<V>> {
        let size = match value.get() {
            Ok(v) => self.inner.descriptor.size_in_bytes(v),
            Err(_) => return None,
        };
        let params = self.params();

        let mut notify_removed = None;
        let mut to_release = None;
        let client = {
            let mut state = self.inner.state.lock();
            if let Some(old_id) = state.exclusive.remove(&key) {
                notify_removed = state.observer(old_id);
            }
            if let Some(old_id) = state.cached.remove(&key) {
                to_release = state.orphan(old_id);
            }

            let fits = size <= params.max_cache_entry_size
                && state.in_use_count() < params.max_cache_entries
                && state.in_use_size() + size <= params.max_cache_size;

            if fits {
                match value.try_clone() {
                    Ok(own) => {
                        let id = state.next_id;
                        state.next_id += 1;
                        let stamp = state.stamp();
                        state.entries.insert(
                            id,
                            Entry {
                                key: key.clone(),
                                value: own,
                                size,
                                client_count: 0,
                                is_orphan: false,
                                access_count: 0,
                                insert_stamp: stamp,
                                observer,
                            },
                        );
                        state.cached.put(key.clone(), id, size, stamp);
                        state.puts += 1;
                        self.new_client_reference(&mut state, id)
                    }
                    Err(_) => None,
                }
            } else {
                debug!(
                    cache = %self.inner.name,
                    ?key,
                    size,
                    "Value does not fit cache limits"
                );
                None
            }
        };

        drop(to_release);
        if let Some((key, observer)) = notify_removed {
            observer.on_exclusivity_changed(&key, false);
        }
        self.maybe_evict_entries();
        client
    }

    /// Get a client reference to the value cached under `key`
    pub fn get(&self, key: &K) -> Option<CloseableRef<V>> {
        let mut notify_removed = None;
        let client = {
            let mut state = self.inner.state.lock();
            if let Some(id) = state.exclusive.remove(key) {
                notify_removed = state.observer(id);
            }
            match state.cached.get(key).copied() {
                Some(id) => {
                    state.hits += 1;
                    self.new_client_reference(&mut state, id)
                }
                None => {
                    state.misses += 1;
                    None
                }
            }
        };

        if let Some((key, observer)) = notify_removed {
            observer.on_exclusivity_changed(&key, false);
        }
        self.maybe_evict_entries();
        client
    }

    /// Refresh the eviction position of an exclusively owned entry without
    /// taking a reference to it
    pub fn probe(&self, key: &K) {
        let policy = self.inner.params.lock().eviction_policy;
        if policy == EvictionPolicy::InsertionOrder {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.exclusive.contains(key) {
            let stamp = state.stamp();
            state.exclusive.restamp(key, stamp);
        }
    }

    /// Take an exclusively owned entry out of the cache.
    ///
    /// Returns the cache's own reference so the caller can recycle the
    /// value. In-use entries are never returned.
    pub fn reuse(&self, key: &K) -> Option<CloseableRef<V>> {
        let removed = {
            let mut state = self.inner.state.lock();
            let id = state.exclusive.remove(key)?;
            match state.cached.remove(key) {
                Some(cached_id) if cached_id == id => {}
                other => {
                    let err = PipelineError::CacheConsistency(format!(
                        "exclusive entry {key:?} tracked as {other:?}, expected {id}"
                    ));
                    error!(cache = %self.inner.name, "{}", err);
                    debug_assert!(false, "{}", err);
                }
            }
            let entry = state.entries.remove(&id)?;
            if entry.client_count != 0 {
                let err = PipelineError::CacheConsistency(format!(
                    "reused entry {key:?} has {} clients",
                    entry.client_count
                ));
                error!(cache = %self.inner.name, "{}", err);
                debug_assert!(false, "{}", err);
            }
            entry
        };

        if let Some(observer) = &removed.observer {
            observer.on_exclusivity_changed(&removed.key, false);
        }
        Some(removed.value)
    }

    /// Whether `key` is tracked
    pub fn contains(&self, key: &K) -> bool {
        self.inner.state.lock().cached.contains(key)
    }

    /// Whether any tracked key matches
    pub fn contains_matching(&self, predicate: impl Fn(&K) -> bool) -> bool {
        !self
            .inner
            .state
            .lock()
            .cached
            .matching_keys(predicate)
            .is_empty()
    }

    /// Untrack every entry whose key matches; returns how many were removed
    pub fn remove_all(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let (removed, notify) = {
            let mut state = self.inner.state.lock();
            let exclusives = state.exclusive.remove_all(&predicate);
            let notify: Vec<_> = exclusives
                .iter()
                .filter_map(|(_, id)| state.observer(*id))
                .collect();
            let untracked = state.cached.remove_all(&predicate);
            let count = untracked.len();
            let released: Vec<_> = untracked
                .into_iter()
                .filter_map(|(_, id)| state.orphan(id))
                .collect();
            ((count, released), notify)
        };

        let (count, released) = removed;
        drop(released);
        for (key, observer) in notify {
            observer.on_exclusivity_changed(&key, false);
        }
        count
    }

    /// Untrack everything; in-use entries become orphans
    pub fn clear(&self) {
        let removed = self.remove_all(|_| true);
        debug!(cache = %self.inner.name, removed, "Cleared memory cache");
    }

    /// Shrink the eviction queue so the cache drops `ratio` of its size
    pub fn trim(&self, ratio: f64) {
        let ratio = ratio.clamp(0.0, 1.0);
        let (target_count, target_size) = {
            let state = self.inner.state.lock();
            let target_cache_size = (state.cached.size_in_bytes() as f64 * (1.0 - ratio)) as usize;
            (
                usize::MAX,
                target_cache_size.saturating_sub(state.in_use_size()),
            )
        };
        self.evict_down_to(target_count, target_size);
    }

    /// Evict exclusively owned entries until the eviction queue fits the
    /// limits left over by in-use entries
    pub fn maybe_evict_entries(&self) {
        let params = self.params();
        let (max_count, max_size) = {
            let state = self.inner.state.lock();
            (
                params
                    .max_eviction_queue_entries
                    .min(params.max_cache_entries.saturating_sub(state.in_use_count())),
                params
                    .max_eviction_queue_size
                    .min(params.max_cache_size.saturating_sub(state.in_use_size())),
            )
        };
        self.evict_down_to(max_count, max_size);
    }

    fn evict_down_to(&self, max_count: usize, max_size: usize) {
        let evicted = {
            let mut state = self.inner.state.lock();
            let mut evicted = Vec::new();
            while state.exclusive.count() > max_count || state.exclusive.size_in_bytes() > max_size
            {
                let Some(key) = state.exclusive.first_key().cloned() else {
                    break;
                };
                let Some(id) = state.exclusive.remove(&key) else {
                    break;
                };
                state.cached.remove(&key);
                state.evictions += 1;
                if let Some(removed) = state.orphan(id) {
                    evicted.push(removed);
                }
            }
            evicted
        };

        if evicted.is_empty() {
            return;
        }
        debug!(
            cache = %self.inner.name,
            count = evicted.len(),
            "Evicted exclusively owned entries"
        );
        for removed in evicted {
            if let Some(observer) = &removed.observer {
                observer.on_exclusivity_changed(&removed.key, false);
            }
        }
    }

    fn new_client_reference(&self, state: &mut State<K, V>, id: u64) -> Option<CloseableRef<V>> {
        let entry = state.entries.get_mut(&id)?;
        let releaser = ClientReleaser {
            cache: self.clone(),
            entry_id: id,
        };
        match entry.value.derive(Box::new(releaser)) {
            Ok(client) => {
                entry.client_count += 1;
                entry.access_count += 1;
                Some(client)
            }
            Err(err) => {
                error!(cache = %self.inner.name, "{}", err);
                None
            }
        }
    }

    fn release_client_reference(&self, id: u64) {
        let policy = self.inner.params.lock().eviction_policy;
        let mut notify_added = None;
        let released = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                error!(cache = %self.inner.name, id, "Released reference to unknown entry");
                return;
            };
            if entry.client_count == 0 {
                let err = PipelineError::CacheConsistency(format!(
                    "client count underflow for {:?}",
                    entry.key
                ));
                error!(cache = %self.inner.name, "{}", err);
                debug_assert!(false, "{}", err);
                return;
            }
            entry.client_count -= 1;

            if entry.client_count > 0 {
                None
            } else if entry.is_orphan {
                state.entries.remove(&id)
            } else {
                let key = entry.key.clone();
                let size = entry.size;
                let insert_stamp = entry.insert_stamp;
                let observer = entry.observer.clone();
                let stamp = match policy {
                    EvictionPolicy::Lru => state.stamp(),
                    EvictionPolicy::InsertionOrder => insert_stamp,
                };
                state.exclusive.put(key.clone(), id, size, stamp);
                notify_added = observer.map(|observer| (key, observer));
                None
            }
        };

        drop(released);
        if let Some((key, observer)) = notify_added {
            observer.on_exclusivity_changed(&key, true);
        }
        self.maybe_evict_entries();
    }

    /// Number of live client references for `key`, if tracked
    pub fn client_count(&self, key: &K) -> Option<u32> {
        let state = self.inner.state.lock();
        let id = state.cached.get(key)?;
        state.entries.get(id).map(|entry| entry.client_count)
    }

    /// Number of times `key` was handed out since it was cached
    pub fn access_count(&self, key: &K) -> Option<u64> {
        let state = self.inner.state.lock();
        let id = state.cached.get(key)?;
        state.entries.get(id).map(|entry| entry.access_count)
    }

    /// Whether `key` is tracked and has no live client references
    pub fn is_exclusive(&self, key: &K) -> bool {
        self.inner.state.lock().exclusive.contains(key)
    }

    pub fn count(&self) -> usize {
        self.inner.state.lock().cached.count()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.inner.state.lock().cached.size_in_bytes()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.state.lock().in_use_count()
    }

    pub fn in_use_size_bytes(&self) -> usize {
        self.inner.state.lock().in_use_size()
    }

    pub fn exclusive_count(&self) -> usize {
        self.inner.state.lock().exclusive.count()
    }

    pub fn exclusive_size_bytes(&self) -> usize {
        self.inner.state.lock().exclusive.size_in_bytes()
    }

    /// Orphaned entries still held by clients
    pub fn orphan_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.entries.values().filter(|entry| entry.is_orphan).count()
    }

    pub fn stats(&self) -> MemoryCacheStats {
        let state = self.inner.state.lock();
        MemoryCacheStats {
            count: state.cached.count(),
            size_bytes: state.cached.size_in_bytes(),
            in_use_count: state.in_use_count(),
            in_use_size_bytes: state.in_use_size(),
            exclusive_count: state.exclusive.count(),
            exclusive_size_bytes: state.exclusive.size_in_bytes(),
            hits: state.hits,
            misses: state.misses,
            puts: state.puts,
            evictions: state.evictions,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Process-wide keyed caches for dictionaries and compiled sessions
//!
//! Insertion is at-most-once per key: concurrent first use of the same key
//! runs the constructor once while the others wait on that key's slot. The
//! map lock itself is only held long enough to find or create the slot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

struct Slot<V> {
    value: Mutex<Option<Arc<V>>>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }
}

/// Concurrent compute-if-absent cache
pub struct KeyedCache<K, V> {
    name: &'static str,
    entries: Mutex<HashMap<K, Arc<Slot<V>>>>,
    constructions: AtomicUsize,
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    /// Create an empty cache; `name` only shows up in logs
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            constructions: AtomicUsize::new(0),
        }
    }

    /// Return the cached value for `key`, constructing it with `init` if absent.
    ///
    /// A failed construction leaves the key absent so a later call can retry.
    pub fn get_or_try_insert_with<E, F>(&self, key: &K, init: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = {
            let mut entries = self.entries.lock();
            entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::default()))
                .clone()
        };

        let mut value = slot.value.lock();
        if let Some(existing) = value.as_ref() {
            return Ok(existing.clone());
        }

        let created = Arc::new(init()?);
        self.constructions.fetch_add(1, Ordering::SeqCst);
        debug!("{} cache: constructed entry for {:?}", self.name, key);
        *value = Some(created.clone());
        Ok(created)
    }

    /// Cached value without constructing
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let slot = self.entries.lock().get(key).cloned()?;
        let value = slot.value.lock();
        value.clone()
    }

    /// Evict one key. In-flight users keep their `Arc` until they finish.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.entries.lock().remove(key);
        match removed {
            Some(slot) => {
                let had_value = slot.value.lock().take().is_some();
                if had_value {
                    debug!("{} cache: invalidated {:?}", self.name, key);
                }
                had_value
            }
            None => false,
        }
    }

    /// Evict everything, returning how many constructed entries were dropped
    pub fn clear(&self) -> usize {
        let drained: Vec<Arc<Slot<V>>> = self.entries.lock().drain().map(|(_, s)| s).collect();
        let evicted = drained
            .iter()
            .filter(|slot| slot.value.lock().take().is_some())
            .count();
        if evicted > 0 {
            debug!("{} cache: cleared {} entries", self.name, evicted);
        }
        evicted
    }

    /// Number of constructed entries
    pub fn len(&self) -> usize {
        let slots: Vec<Arc<Slot<V>>> = self.entries.lock().values().cloned().collect();
        slots.iter().filter(|slot| slot.value.lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total successful constructions since creation
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

/// A cache that can be emptied without naming its key and value types
pub trait ClearableCache: Send + Sync {
    fn cache_name(&self) -> &str;

    /// Evict everything, returning how many constructed entries were dropped
    fn clear_entries(&self) -> usize;
}

impl<K, V> ClearableCache for KeyedCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send,
    V: Send + Sync,
{
    fn cache_name(&self) -> &str {
        self.name
    }

    fn clear_entries(&self) -> usize {
        self.clear()
    }
}

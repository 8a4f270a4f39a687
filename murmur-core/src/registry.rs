//! Concurrency-safe keyed store for in-flight transfers.
//!
//! Entries are `Arc<Mutex<T>>`: the map shard lock is held only for the insert/lookup/remove
//! itself, and work on one id is serialized by its own mutex. Lock order is always
//! entry -> map, never the reverse, so removal matches by pointer and never locks the entry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub type Slot<T> = Arc<Mutex<T>>;

pub struct Registry<T> {
    entries: DashMap<String, Slot<T>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert `value` under `id` unless the id is taken. On conflict the value is handed back.
    pub fn insert_if_absent(&self, id: &str, value: T) -> Result<Slot<T>, T> {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(_) => Err(value),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(Mutex::new(value));
                vacant.insert(slot.clone());
                Ok(slot)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Slot<T>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove `id` only if it still maps to `slot`, so a newer entry under a reused id survives.
    pub fn remove_exact(&self, id: &str, slot: &Slot<T>) -> bool {
        self.entries
            .remove_if(id, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock an entry, recovering the data if a previous holder panicked.
pub fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

// file: src/workflow/store.rs
// version: 1.0.0
// guid: 7c2e9a4b-6d1f-4b38-a5e0-3f8c1d7b9e62

//! Typed key/value store shared by the actions of one workflow

use crate::error::{ProvisionError, Result};
use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// String keys to values of any `Send + Sync` type
///
/// Reads name the expected type and fail cleanly on a missing key or a value
/// of another type.
#[derive(Default)]
pub struct Store {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entries_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.entries_mut().insert(
            key.into(),
            Entry {
                value: Arc::new(value),
                type_name: type_name::<T>(),
            },
        );
    }

    /// Shared handle to the value stored under `key`
    pub fn get_arc<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>> {
        let entry = self
            .entries()
            .get(key)
            .cloned()
            .ok_or_else(|| ProvisionError::config(format!("missing required store key {}", key)))?;
        entry.value.downcast::<T>().map_err(|_| {
            ProvisionError::config(format!(
                "store key {} holds {}, not {}",
                key,
                entry.type_name,
                type_name::<T>()
            ))
        })
    }

    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &str) -> Result<T> {
        self.get_arc::<T>(key).map(|value| T::clone(&value))
    }

    /// Value under `key`, or `default` when missing or of another type
    pub fn get_or<T: Any + Send + Sync + Clone>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries_mut().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Copy every entry of `other` into this store, replacing duplicates
    pub fn merge_from(&self, other: &Store) {
        let incoming = other.entries().clone();
        self.entries_mut().extend(incoming);
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries();
        f.debug_map()
            .entries(entries.iter().map(|(k, e)| (k, e.type_name)))
            .finish()
    }
}

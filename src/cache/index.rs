// file: src/cache/index.rs
// version: 1.0.0
// guid: 4f8b2e6d-1a9c-4d53-8e07-b3c5a1f9d264

//! In-memory projection of a cache's metadata files

use super::CacheMetadata;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// `(tag, value)` pairs an entry must all carry
pub type TagFilter = BTreeMap<String, String>;

/// Items by key plus a tag → value → keys lookup
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheIndex {
    pub items: HashMap<String, CacheMetadata>,
    pub tag_index: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = CacheMetadata>) -> Self {
        let mut index = Self::new();
        for metadata in entries {
            index.insert(metadata);
        }
        index
    }

    /// Add or replace an entry, dropping tags of the replaced one
    pub fn insert(&mut self, metadata: CacheMetadata) {
        self.remove(&metadata.key);
        for (tag, value) in &metadata.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(metadata.key.clone());
        }
        self.items.insert(metadata.key.clone(), metadata);
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheMetadata> {
        let old = self.items.remove(key)?;
        for (tag, value) in &old.tags {
            let Some(values) = self.tag_index.get_mut(tag) else { continue };
            if let Some(keys) = values.get_mut(value) {
                keys.remove(key);
                if keys.is_empty() {
                    values.remove(value);
                }
            }
            if values.is_empty() {
                self.tag_index.remove(tag);
            }
        }
        Some(old)
    }

    pub fn get(&self, key: &str) -> Option<&CacheMetadata> {
        self.items.get(key)
    }

    /// Entries matching every pair in `filter`, sorted by key
    ///
    /// Unknown tags or values give an empty result.
    pub fn list(&self, filter: &TagFilter) -> Vec<CacheMetadata> {
        let mut keys: Option<HashSet<&String>> = None;
        for (tag, value) in filter {
            let Some(matching) = self.tag_index.get(tag).and_then(|values| values.get(value)) else {
                return Vec::new();
            };
            keys = Some(match keys {
                None => matching.iter().collect(),
                Some(current) => current.into_iter().filter(|k| matching.contains(*k)).collect(),
            });
        }

        let mut items: Vec<CacheMetadata> = match keys {
            None => self.items.values().cloned().collect(),
            Some(keys) => keys
                .into_iter()
                .filter_map(|k| self.items.get(k).cloned())
                .collect(),
        };
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use kbase_core::Metadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub internal_id: String,
    pub content: String,
    pub metadata: Metadata,
}

/// Entry content and metadata keyed by graph slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocStore {
    pub generation: u64,
    pub model: String,
    pub dimension: usize,
    entries: BTreeMap<u32, IndexEntry>,
    #[serde(skip)]
    by_internal_id: HashMap<String, u32>,
}

impl DocStore {
    pub fn new(model: &str, dimension: usize) -> Self {
        Self {
            generation: 0,
            model: model.to_string(),
            dimension,
            entries: BTreeMap::new(),
            by_internal_id: HashMap::new(),
        }
    }

    /// Rebuilds the internal-id lookup after deserialization.
    pub fn reindex(&mut self) {
        self.by_internal_id = self
            .entries
            .iter()
            .map(|(slot, entry)| (entry.internal_id.clone(), *slot))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, slot: u32, entry: IndexEntry) {
        self.by_internal_id.insert(entry.internal_id.clone(), slot);
        self.entries.insert(slot, entry);
    }

    pub fn remove(&mut self, slot: u32) -> Option<IndexEntry> {
        let entry = self.entries.remove(&slot)?;
        self.by_internal_id.remove(&entry.internal_id);
        Some(entry)
    }

    pub fn get(&self, slot: u32) -> Option<&IndexEntry> {
        self.entries.get(&slot)
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.entries.contains_key(&slot)
    }

    pub fn slot_of(&self, internal_id: &str) -> Option<u32> {
        self.by_internal_id.get(internal_id).copied()
    }

    pub fn slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    /// Linear scan for entries whose metadata `key` equals `value`.
    pub fn slots_matching(&self, key: &str, value: &str) -> BTreeSet<u32> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.metadata.get(key).map(String::as_str) == Some(value))
            .map(|(slot, _)| *slot)
            .collect()
    }

    /// Intersection of the per-key candidate sets.
    pub fn slots_matching_all(&self, filters: &Metadata) -> BTreeSet<u32> {
        let mut sets = filters
            .iter()
            .map(|(key, value)| self.slots_matching(key, value));
        let Some(first) = sets.next() else {
            return BTreeSet::new();
        };
        sets.fold(first, |acc, set| acc.intersection(&set).copied().collect())
    }
}

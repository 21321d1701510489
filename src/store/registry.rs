//! Committed entity state shared by all tasks

use crate::types::EntityId;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Stored entity: attribute values in declaration order plus the
/// foreign-key collections other entities maintain on it
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Record {
    pub(crate) entity_type: &'static str,
    pub(crate) values: Vec<Value>,
    pub(crate) collections: BTreeMap<&'static str, Vec<EntityId>>,
}

impl Record {
    pub(crate) fn new(entity_type: &'static str, values: Vec<Value>) -> Self {
        Self {
            entity_type,
            values,
            collections: BTreeMap::new(),
        }
    }
}

/// Collection membership change recorded by a transaction and replayed on commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LinkOp {
    Add {
        parent: EntityId,
        collection: &'static str,
        child: EntityId,
    },
    Remove {
        parent: EntityId,
        collection: &'static str,
        child: EntityId,
    },
}

/// Id index plus per-type collections
#[derive(Debug, Default)]
pub(crate) struct Registry {
    records: HashMap<EntityId, Record>,
    by_type: HashMap<&'static str, BTreeSet<EntityId>>,
}

impl Registry {
    pub(crate) fn get(&self, id: EntityId) -> Option<&Record> {
        self.records.get(&id)
    }

    pub(crate) fn contains(&self, id: EntityId) -> bool {
        self.records.contains_key(&id)
    }

    pub(crate) fn insert(&mut self, id: EntityId, record: Record) {
        self.by_type
            .entry(record.entity_type)
            .or_default()
            .insert(id);
        self.records.insert(id, record);
    }

    pub(crate) fn remove(&mut self, id: EntityId) -> Option<Record> {
        let record = self.records.remove(&id)?;
        if let Some(ids) = self.by_type.get_mut(record.entity_type) {
            ids.remove(&id);
        }
        Some(record)
    }

    /// Store one attribute; returns false when the entity is gone
    pub(crate) fn set_value(&mut self, id: EntityId, idx: usize, value: Value) -> bool {
        match self.records.get_mut(&id) {
            Some(record) if idx < record.values.len() => {
                record.values[idx] = value;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn apply_link(&mut self, op: &LinkOp) -> bool {
        match *op {
            LinkOp::Add {
                parent,
                collection,
                child,
            } => {
                let Some(record) = self.records.get_mut(&parent) else {
                    return false;
                };
                let members = record.collections.entry(collection).or_default();
                if !members.contains(&child) {
                    members.push(child);
                }
                true
            }
            LinkOp::Remove {
                parent,
                collection,
                child,
            } => {
                let Some(record) = self.records.get_mut(&parent) else {
                    return false;
                };
                if let Some(members) = record.collections.get_mut(collection) {
                    members.retain(|c| *c != child);
                }
                true
            }
        }
    }

    pub(crate) fn ids_of_type(&self, entity_type: &str) -> BTreeSet<EntityId> {
        self.by_type.get(entity_type).cloned().unwrap_or_default()
    }

    pub(crate) fn max_id(&self) -> Option<EntityId> {
        self.records.keys().max().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Memoized getter results
///
/// `generation` is bumped on every invalidation; a value computed against an
/// older generation is not stored, so a getter racing a commit never caches
/// a stale result.
#[derive(Debug, Default)]
pub(crate) struct GetterCache {
    generation: u64,
    entries: HashMap<(EntityId, usize), Value>,
}

impl GetterCache {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn get(&self, id: EntityId, idx: usize) -> Option<Value> {
        self.entries.get(&(id, idx)).cloned()
    }

    pub(crate) fn store(&mut self, generation: u64, id: EntityId, idx: usize, value: Value) {
        if generation == self.generation {
            self.entries.insert((id, idx), value);
        }
    }

    pub(crate) fn invalidate<'a>(&mut self, keys: impl IntoIterator<Item = &'a (EntityId, usize)>) {
        self.generation += 1;
        for key in keys {
            self.entries.remove(key);
        }
    }

    pub(crate) fn invalidate_entity(&mut self, id: EntityId) {
        self.generation += 1;
        self.entries.retain(|(entry_id, _), _| *entry_id != id);
    }
}

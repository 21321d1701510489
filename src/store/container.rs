//! Observable container attributes
//!
//! Each wrapper reads the current array / object value, applies the
//! mutation to a copy and writes it back through [`TransactionContext::set`],
//! so in-place edits dirty the owning attribute exactly like reassignment.

use super::transaction::TransactionContext;
use crate::error::{Error, Result};
use crate::types::EntityId;
use serde_json::{Map, Value};

fn read_array(ctx: &TransactionContext, id: EntityId, attribute: &str) -> Result<Vec<Value>> {
    match ctx.get(id, attribute)? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(Error::InvalidValue {
            attribute: attribute.to_string(),
            reason: format!("expected a list, found {other}"),
        }),
    }
}

/// List attribute bound to a context
pub struct ObservableList<'a> {
    ctx: &'a mut TransactionContext,
    id: EntityId,
    attribute: &'static str,
}

impl<'a> ObservableList<'a> {
    /// Wrap `attribute` of `id`
    pub fn new(ctx: &'a mut TransactionContext, id: EntityId, attribute: &'static str) -> Self {
        Self { ctx, id, attribute }
    }

    /// Current items
    pub fn items(&self) -> Result<Vec<Value>> {
        read_array(&*self.ctx, self.id, self.attribute)
    }

    /// Number of items
    pub fn len(&self) -> Result<usize> {
        Ok(self.items()?.len())
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn update(&mut self, f: impl FnOnce(&mut Vec<Value>)) -> Result<bool> {
        let mut items = self.items()?;
        f(&mut items);
        self.ctx.set(self.id, self.attribute, Value::Array(items))
    }

    /// Append an item
    pub fn push(&mut self, item: impl Into<Value>) -> Result<bool> {
        let item = item.into();
        self.update(|items| items.push(item))
    }

    /// Insert at `index` (clamped to the end)
    pub fn insert(&mut self, index: usize, item: impl Into<Value>) -> Result<bool> {
        let item = item.into();
        self.update(|items| {
            let index = index.min(items.len());
            items.insert(index, item);
        })
    }

    /// Replace the item at `index`; out-of-range indices are ignored
    pub fn set(&mut self, index: usize, item: impl Into<Value>) -> Result<bool> {
        let item = item.into();
        self.update(|items| {
            if let Some(slot) = items.get_mut(index) {
                *slot = item;
            }
        })
    }

    /// Remove the item at `index`
    pub fn remove(&mut self, index: usize) -> Result<Option<Value>> {
        let mut items = self.items()?;
        if index >= items.len() {
            return Ok(None);
        }
        let removed = items.remove(index);
        self.ctx.set(self.id, self.attribute, Value::Array(items))?;
        Ok(Some(removed))
    }

    /// Keep only the items matching `f`
    pub fn retain(&mut self, f: impl FnMut(&Value) -> bool) -> Result<bool> {
        self.update(|items| items.retain(f))
    }

    /// Remove every item
    pub fn clear(&mut self) -> Result<bool> {
        self.update(Vec::clear)
    }
}

/// Set attribute (stored as an array without duplicates)
pub struct ObservableSet<'a> {
    ctx: &'a mut TransactionContext,
    id: EntityId,
    attribute: &'static str,
}

impl<'a> ObservableSet<'a> {
    /// Wrap `attribute` of `id`
    pub fn new(ctx: &'a mut TransactionContext, id: EntityId, attribute: &'static str) -> Self {
        Self { ctx, id, attribute }
    }

    /// Current members
    pub fn members(&self) -> Result<Vec<Value>> {
        read_array(&*self.ctx, self.id, self.attribute)
    }

    /// Membership test
    pub fn contains(&self, item: &Value) -> Result<bool> {
        Ok(self.members()?.contains(item))
    }

    /// Add a member; returns false if it was already present
    pub fn insert(&mut self, item: impl Into<Value>) -> Result<bool> {
        let item = item.into();
        let mut members = self.members()?;
        if members.contains(&item) {
            return Ok(false);
        }
        members.push(item);
        self.ctx.set(self.id, self.attribute, Value::Array(members))
    }

    /// Remove a member; returns false if it was absent
    pub fn remove(&mut self, item: &Value) -> Result<bool> {
        let mut members = self.members()?;
        let before = members.len();
        members.retain(|m| m != item);
        if members.len() == before {
            return Ok(false);
        }
        self.ctx.set(self.id, self.attribute, Value::Array(members))
    }
}

/// Map attribute (stored as a JSON object)
pub struct ObservableMap<'a> {
    ctx: &'a mut TransactionContext,
    id: EntityId,
    attribute: &'static str,
}

impl<'a> ObservableMap<'a> {
    /// Wrap `attribute` of `id`
    pub fn new(ctx: &'a mut TransactionContext, id: EntityId, attribute: &'static str) -> Self {
        Self { ctx, id, attribute }
    }

    /// Current entries
    pub fn entries(&self) -> Result<Map<String, Value>> {
        match self.ctx.get(self.id, self.attribute)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(Error::InvalidValue {
                attribute: self.attribute.to_string(),
                reason: format!("expected a map, found {other}"),
            }),
        }
    }

    /// Value under `key`
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries()?.get(key).cloned())
    }

    /// Assign `key`; returns the previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Option<Value>> {
        let mut map = self.entries()?;
        let previous = map.insert(key.into(), value.into());
        self.ctx.set(self.id, self.attribute, Value::Object(map))?;
        Ok(previous)
    }

    /// Remove `key`; returns the removed value
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        let mut map = self.entries()?;
        let removed = map.remove(key);
        if removed.is_some() {
            self.ctx.set(self.id, self.attribute, Value::Object(map))?;
        }
        Ok(removed)
    }
}

//! Entity operations on top of the frame stack

use super::registry::{LinkOp, Record};
use super::schema::{CascadeFn, Channel, EntityType, OnTargetDelete, ResolvedAffects};
use super::transaction::{EntityView, TransactionContext};
use crate::error::{Error, Result, StaleEntityError, TransactionError};
use crate::types::EntityId;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

impl TransactionContext {
    fn type_handle(&self, id: EntityId) -> Result<Arc<EntityType>> {
        let name = self.entity_type_of(id).ok_or(StaleEntityError { id })?;
        Ok(Arc::clone(self.store.schema.entity_type(name)?))
    }

    fn require_transaction(&self, entity_type: &str, attribute: &str) -> Result<()> {
        if self.frames.is_empty() {
            return Err(TransactionError::NoTransaction {
                entity_type: entity_type.to_string(),
                attribute: attribute.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Create an entity with a fresh id
    ///
    /// Every attribute starts dirty so the initial state is exported; the
    /// given values then go through the regular set path (setters, foreign
    /// keys, dependency marking).
    pub fn create(&mut self, entity_type: &str, values: &[(&str, Value)]) -> Result<EntityId> {
        let ty = Arc::clone(self.store.schema.entity_type(entity_type)?);
        self.require_transaction(ty.name(), "<create>")?;
        let id = self.store.allocate_id();
        self.insert_new(id, &ty, values)
    }

    /// Create an entity under a known id (restoring persisted state)
    pub fn create_with_id(
        &mut self,
        entity_type: &str,
        id: EntityId,
        values: &[(&str, Value)],
    ) -> Result<EntityId> {
        let ty = Arc::clone(self.store.schema.entity_type(entity_type)?);
        self.require_transaction(ty.name(), "<create>")?;
        if self.exists(id) {
            return Err(TransactionError::DuplicateId { id }.into());
        }
        self.store.reserve_id(id);
        self.insert_new(id, &ty, values)
    }

    fn insert_new(
        &mut self,
        id: EntityId,
        ty: &Arc<EntityType>,
        values: &[(&str, Value)],
    ) -> Result<EntityId> {
        let frame = self.top_mut()?;
        frame.created.insert(id, Record::new(ty.name(), ty.defaults()));
        frame.dirty.insert(
            id,
            (0..ty.attributes().len()).map(|idx| (idx, Value::Null)).collect(),
        );
        for (name, value) in values {
            let idx = attribute_index(ty, name)?;
            self.set_at(id, ty, idx, value.clone())?;
        }
        Ok(id)
    }

    /// Current value of an attribute, computed through its getter if it has one
    pub fn get(&self, id: EntityId, attribute: &str) -> Result<Value> {
        let ty = self.type_handle(id)?;
        let idx = attribute_index(&ty, attribute)?;
        self.get_at(id, &ty, idx)
    }

    /// Current value, deserialized
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, id: EntityId, attribute: &str) -> Result<T> {
        Ok(serde_json::from_value(self.get(id, attribute)?)?)
    }

    pub(crate) fn get_at(&self, id: EntityId, ty: &EntityType, idx: usize) -> Result<Value> {
        let attribute = ty.attribute_at(idx);
        let Some(getter) = &attribute.getter else {
            return self.raw(id, idx);
        };
        if !self.exists(id) {
            return Err(StaleEntityError { id }.into());
        }

        // The shared cache only ever holds values computed from committed state
        let read_cache = attribute.getter_cached && !self.touches(id);
        let write_cache = attribute.getter_cached && self.frames.is_empty();
        let generation = {
            let cache = self.store.cache.lock();
            if read_cache && let Some(value) = cache.get(id, idx) {
                return Ok(value);
            }
            cache.generation()
        };

        let value = getter(&EntityView::new(self, id));
        if write_cache {
            self.store
                .cache
                .lock()
                .store(generation, id, idx, value.clone());
        }
        Ok(value)
    }

    /// Set an attribute; returns false when the value did not change
    pub fn set(&mut self, id: EntityId, attribute: &str, value: impl Into<Value>) -> Result<bool> {
        let ty = self.type_handle(id)?;
        let idx = attribute_index(&ty, attribute)?;
        self.set_at(id, &ty, idx, value.into())
    }

    /// Set on behalf of an external client; `read_only` attributes are refused
    pub fn request_set(&mut self, id: EntityId, attribute: &str, value: impl Into<Value>) -> Result<bool> {
        let ty = self.type_handle(id)?;
        let idx = attribute_index(&ty, attribute)?;
        if ty.attribute_at(idx).is_read_only() {
            return Err(Error::ReadOnly {
                entity_type: ty.name().to_string(),
                attribute: attribute.to_string(),
            });
        }
        self.set_at(id, &ty, idx, value.into())
    }

    pub(crate) fn set_at(&mut self, id: EntityId, ty: &Arc<EntityType>, idx: usize, value: Value) -> Result<bool> {
        let attribute = ty.attribute_at(idx);
        self.require_transaction(ty.name(), attribute.name)?;

        let value = match &attribute.setter {
            Some(setter) => setter(value).map_err(|reason| Error::InvalidValue {
                attribute: format!("{}.{}", ty.name(), attribute.name),
                reason,
            })?,
            None => value,
        };
        let old = self.raw(id, idx)?;
        if old == value {
            return Ok(false);
        }

        let mut emptied: Option<(CascadeFn, EntityId)> = None;
        if let Some(fk) = &attribute.foreign_key {
            if let Some(parent) = EntityId::from_value(&value) {
                match self.entity_type_of(parent) {
                    Some(found) if found == fk.target => {}
                    Some(found) => {
                        return Err(Error::InvalidValue {
                            attribute: format!("{}.{}", ty.name(), attribute.name),
                            reason: format!("entity {parent} is a {found}, expected {}", fk.target),
                        });
                    }
                    None => return Err(StaleEntityError { id: parent }.into()),
                }
                self.link(parent, fk.collection, id)?;
            }
            if let Some(previous) = EntityId::from_value(&old)
                && self.exists(previous)
                && self.unlink(previous, fk.collection, id)? == 0
                && let Some(on_empty) = &fk.on_empty
            {
                emptied = Some((Arc::clone(on_empty), previous));
            }
        }

        let frame = self.top_mut()?;
        frame.values.entry(id).or_default().insert(idx, value.clone());
        frame
            .dirty
            .entry(id)
            .or_default()
            .entry(idx)
            .or_insert_with(|| old.clone());

        self.propagate(id, ty, idx, Some(&old))?;

        if let Some(hook) = attribute.on_change.clone() {
            hook(self, id, &old, &value)?;
        }
        if let Some((on_empty, parent)) = emptied
            && self.exists(parent)
            && !self.deleting.contains(&parent)
        {
            on_empty(self, parent)?;
        }
        Ok(true)
    }

    /// Force re-export of an attribute without changing its stored value
    pub fn mark_dirty(&mut self, id: EntityId, attribute: &str) -> Result<()> {
        let ty = self.type_handle(id)?;
        let idx = attribute_index(&ty, attribute)?;
        self.mark_dirty_at(id, &ty, idx)
    }

    pub(crate) fn mark_dirty_at(&mut self, id: EntityId, ty: &EntityType, idx: usize) -> Result<()> {
        self.require_transaction(ty.name(), ty.attribute_at(idx).name)?;
        if self.is_dirty_in_top(id, idx) {
            return Ok(());
        }
        let pre = self.get_at(id, ty, idx)?;
        self.top_mut()?
            .dirty
            .entry(id)
            .or_default()
            .insert(idx, pre);
        self.propagate(id, ty, idx, None)
    }

    /// Mark everything `idx` declares in `change_affects`
    fn propagate(&mut self, id: EntityId, ty: &EntityType, idx: usize, previous: Option<&Value>) -> Result<()> {
        let Some(targets) = ty.affects.get(idx) else {
            return Ok(());
        };
        for target in targets {
            match *target {
                ResolvedAffects::Local(local) => self.mark_dirty_at(id, ty, local)?,
                ResolvedAffects::Related { via, attribute } => {
                    let mut parents = Vec::with_capacity(2);
                    if let Some(parent) = EntityId::from_value(&self.raw(id, via)?) {
                        parents.push(parent);
                    }
                    // a moved reference leaves a stale aggregate on the old target too
                    if via == idx
                        && let Some(parent) = previous.and_then(|v| EntityId::from_value(v))
                    {
                        parents.push(parent);
                    }
                    for parent in parents {
                        if self.deleting.contains(&parent) || !self.exists(parent) {
                            continue;
                        }
                        let parent_ty = self.type_handle(parent)?;
                        self.mark_dirty_at(parent, &parent_ty, attribute)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete an entity (idempotent)
    ///
    /// Referencing entities are cascaded or nullified per their foreign key;
    /// the entity is then removed from every collection it is listed in, and
    /// `on_empty` callbacks fire for collections that became empty.
    pub fn delete(&mut self, id: EntityId) -> Result<()> {
        let Some(entity_type) = self.entity_type_of(id) else {
            return Ok(());
        };
        if self.deleting.contains(&id) {
            return Ok(());
        }
        let ty = Arc::clone(self.store.schema.entity_type(entity_type)?);
        self.require_transaction(ty.name(), "<delete>")?;

        self.deleting.push(id);
        let result = self.delete_inner(id, &ty);
        self.deleting.retain(|d| *d != id);
        result
    }

    fn delete_inner(&mut self, id: EntityId, ty: &Arc<EntityType>) -> Result<()> {
        for link in &ty.children {
            for child in self.children(id, link.collection)? {
                match link.on_target_delete {
                    OnTargetDelete::Cascade => self.delete(child)?,
                    OnTargetDelete::Nullify => {
                        let child_ty = self.type_handle(child)?;
                        self.set_at(child, &child_ty, link.attribute, Value::Null)?;
                    }
                }
            }
        }

        let mut emptied: Vec<(CascadeFn, EntityId)> = Vec::new();
        for (idx, attribute) in ty.attributes().iter().enumerate() {
            let Some(fk) = &attribute.foreign_key else {
                continue;
            };
            let Some(parent) = EntityId::from_value(&self.raw(id, idx)?) else {
                continue;
            };
            if !self.exists(parent) || self.deleting.contains(&parent) {
                continue;
            }
            self.propagate(id, ty, idx, None)?;
            if self.unlink(parent, fk.collection, id)? == 0
                && let Some(on_empty) = &fk.on_empty
            {
                emptied.push((Arc::clone(on_empty), parent));
            }
        }

        let frame = self.top_mut()?;
        frame.values.remove(&id);
        frame.dirty.remove(&id);
        frame.collections.retain(|(owner, _), _| *owner != id);
        if frame.created.remove(&id).is_none() {
            frame.deleted.insert(id, ty.name());
        }

        for (on_empty, parent) in emptied {
            if self.exists(parent) && !self.deleting.contains(&parent) {
                tracing::trace!(entity_id = parent.0, "collection emptied, running cascade");
                on_empty(self, parent)?;
            }
        }
        Ok(())
    }

    fn collection_mut(&mut self, parent: EntityId, collection: &'static str) -> Result<&mut Vec<EntityId>> {
        let current = self.children(parent, collection)?;
        Ok(self
            .top_mut()?
            .collections
            .entry((parent, collection))
            .or_insert(current))
    }

    fn link(&mut self, parent: EntityId, collection: &'static str, child: EntityId) -> Result<()> {
        let members = self.collection_mut(parent, collection)?;
        if !members.contains(&child) {
            members.push(child);
        }
        self.top_mut()?.links.push(LinkOp::Add {
            parent,
            collection,
            child,
        });
        Ok(())
    }

    /// Remove `child` from the collection; returns how many members remain
    fn unlink(&mut self, parent: EntityId, collection: &'static str, child: EntityId) -> Result<usize> {
        let members = self.collection_mut(parent, collection)?;
        members.retain(|c| *c != child);
        let remaining = members.len();
        self.top_mut()?.links.push(LinkOp::Remove {
            parent,
            collection,
            child,
        });
        Ok(remaining)
    }

    /// Flat name → value map of every attribute visible on `channels`
    pub fn serialize(&self, id: EntityId, channels: &[Channel]) -> Result<BTreeMap<String, Value>> {
        let ty = self.type_handle(id)?;
        let mut out = BTreeMap::new();
        for (idx, attribute) in ty.attributes().iter().enumerate() {
            if attribute.is_visible_on(channels) {
                out.insert(attribute.name.to_string(), self.get_at(id, &ty, idx)?);
            }
        }
        Ok(out)
    }
}

fn attribute_index(ty: &EntityType, attribute: &str) -> Result<usize> {
    ty.index_of(attribute).ok_or_else(|| Error::UnknownAttribute {
        entity_type: ty.name().to_string(),
        attribute: attribute.to_string(),
    })
}

//! Per-task transaction frames
//!
//! Each frame is a copy-on-write overlay over the frames below it and the
//! committed registry. Aborting drops the frame; committing an inner frame
//! merges it into its parent; committing the outermost frame applies it to
//! the registry and fans the change set out to listeners.

use super::registry::{LinkOp, Record, Registry};
use super::{Store, StoreEvent, StoreInner, listener};
use crate::error::{Result, StaleEntityError, TransactionError};
use crate::types::EntityId;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// One level of buffered mutations
#[derive(Debug, Default)]
pub(crate) struct Frame {
    /// Written attribute values
    pub(crate) values: HashMap<EntityId, BTreeMap<usize, Value>>,
    /// Dirty attributes with their value before the outermost frame touched them
    pub(crate) dirty: BTreeMap<EntityId, BTreeMap<usize, Value>>,
    pub(crate) created: BTreeMap<EntityId, Record>,
    pub(crate) deleted: BTreeMap<EntityId, &'static str>,
    /// Working copies of foreign-key collections
    pub(crate) collections: HashMap<(EntityId, &'static str), Vec<EntityId>>,
    pub(crate) links: Vec<LinkOp>,
}

impl Frame {
    fn touches(&self, id: EntityId) -> bool {
        self.values.contains_key(&id)
            || self.dirty.contains_key(&id)
            || self.created.contains_key(&id)
            || self.deleted.contains_key(&id)
    }

    /// Fold a committed inner frame into this one
    fn merge(&mut self, inner: Frame) {
        let Frame {
            values,
            dirty,
            created,
            deleted,
            collections,
            links,
        } = inner;

        self.created.extend(created);
        for (id, overlay) in values {
            self.values.entry(id).or_default().extend(overlay);
        }
        // keep the outermost pre-value
        for (id, attrs) in dirty {
            let entry = self.dirty.entry(id).or_default();
            for (idx, pre) in attrs {
                entry.entry(idx).or_insert(pre);
            }
        }
        self.collections.extend(collections);
        self.links.extend(links);

        for (id, entity_type) in deleted {
            self.values.remove(&id);
            self.dirty.remove(&id);
            self.collections.retain(|(owner, _), _| *owner != id);
            // created out here and deleted in there: never existed
            if self.created.remove(&id).is_none() {
                self.deleted.insert(id, entity_type);
            }
        }
    }
}

/// Old and new value of one committed attribute
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeChange {
    /// Attribute name
    pub attribute: &'static str,
    pub(crate) index: usize,
    /// Value before the outermost transaction began (`null` for new entities)
    pub old: Value,
    /// Committed value
    pub new: Value,
}

/// Changed attributes of one entity
#[derive(Clone, Debug, PartialEq)]
pub struct EntityChanges {
    /// Entity type name
    pub entity_type: &'static str,
    /// One entry per dirty attribute
    pub attributes: Vec<AttributeChange>,
}

/// Result of committing an outermost transaction
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    /// Entities created (every attribute is also listed in `changed`)
    pub created: BTreeSet<EntityId>,
    /// Dirty attributes per surviving entity
    pub changed: BTreeMap<EntityId, EntityChanges>,
    /// Entities deleted, with their type
    pub deleted: BTreeMap<EntityId, &'static str>,
}

impl ChangeSet {
    /// Whether the commit changed nothing
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Change record of one attribute
    pub fn change(&self, id: EntityId, attribute: &str) -> Option<&AttributeChange> {
        self.changed
            .get(&id)?
            .attributes
            .iter()
            .find(|c| c.attribute == attribute)
    }
}

/// Transaction state owned by one task
///
/// Dropping a context with open frames aborts them.
pub struct TransactionContext {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) frames: Vec<Frame>,
    /// Entities whose delete is in progress (suppresses cascades onto them)
    pub(crate) deleting: Vec<EntityId>,
}

impl TransactionContext {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        Self {
            store,
            frames: Vec::new(),
            deleting: Vec::new(),
        }
    }

    /// Handle to the store this context operates on
    pub fn store(&self) -> Store {
        Store::from_inner(Arc::clone(&self.store))
    }

    /// Open a (possibly nested) transaction
    pub fn begin(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Number of open frames
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether a transaction is open
    pub fn in_transaction(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Close the innermost frame
    ///
    /// Returns the applied change set for the outermost frame, `None` when
    /// the frame was merged into its parent.
    pub fn commit(&mut self) -> Result<Option<ChangeSet>> {
        let frame = self
            .frames
            .pop()
            .ok_or(TransactionError::NoOpenFrame {
                operation: "commit",
            })?;
        match self.frames.last_mut() {
            Some(outer) => {
                outer.merge(frame);
                Ok(None)
            }
            None => Ok(Some(apply(&self.store, frame)?)),
        }
    }

    /// Discard the innermost frame and everything buffered in it
    pub fn abort(&mut self) -> Result<()> {
        self.frames
            .pop()
            .ok_or(TransactionError::NoOpenFrame { operation: "abort" })?;
        Ok(())
    }

    /// Run `f` in its own frame: commit on `Ok`, abort on `Err`
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let depth = self.frames.len();
        self.begin();
        let result = f(self);
        // frames the closure left open belong to it
        self.frames.truncate(depth + 1);
        match result {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                self.abort()?;
                Err(e)
            }
        }
    }

    pub(crate) fn top_mut(&mut self) -> Result<&mut Frame> {
        Ok(self
            .frames
            .last_mut()
            .ok_or(TransactionError::NoOpenFrame {
                operation: "mutate",
            })?)
    }

    /// Whether any open frame buffered something for `id`
    pub(crate) fn touches(&self, id: EntityId) -> bool {
        self.frames.iter().any(|f| f.touches(id))
    }

    pub(crate) fn is_dirty_in_top(&self, id: EntityId, idx: usize) -> bool {
        self.frames
            .last()
            .and_then(|f| f.dirty.get(&id))
            .is_some_and(|attrs| attrs.contains_key(&idx))
    }

    /// Type name of an entity visible to this task
    pub fn entity_type_of(&self, id: EntityId) -> Option<&'static str> {
        for frame in self.frames.iter().rev() {
            if frame.deleted.contains_key(&id) {
                return None;
            }
            if let Some(record) = frame.created.get(&id) {
                return Some(record.entity_type);
            }
        }
        self.store.registry.lock().get(id).map(|r| r.entity_type)
    }

    /// Whether an entity is visible to this task
    pub fn exists(&self, id: EntityId) -> bool {
        self.entity_type_of(id).is_some()
    }

    pub(crate) fn raw(&self, id: EntityId, idx: usize) -> Result<Value> {
        for frame in self.frames.iter().rev() {
            if frame.deleted.contains_key(&id) {
                return Err(StaleEntityError { id }.into());
            }
            if let Some(value) = frame.values.get(&id).and_then(|m| m.get(&idx)) {
                return Ok(value.clone());
            }
            if let Some(record) = frame.created.get(&id) {
                return Ok(record.values.get(idx).cloned().unwrap_or(Value::Null));
            }
        }
        let registry = self.store.registry.lock();
        let record = registry.get(id).ok_or(StaleEntityError { id })?;
        Ok(record.values.get(idx).cloned().unwrap_or(Value::Null))
    }

    /// Members of a foreign-key collection, in insertion order
    pub fn children(&self, id: EntityId, collection: &str) -> Result<Vec<EntityId>> {
        for frame in self.frames.iter().rev() {
            if frame.deleted.contains_key(&id) {
                return Err(StaleEntityError { id }.into());
            }
            if let Some((_, members)) = frame
                .collections
                .iter()
                .find(|((owner, name), _)| *owner == id && *name == collection)
            {
                return Ok(members.clone());
            }
            if let Some(record) = frame.created.get(&id) {
                return Ok(record.collections.get(collection).cloned().unwrap_or_default());
            }
        }
        let registry = self.store.registry.lock();
        let record = registry.get(id).ok_or(StaleEntityError { id })?;
        Ok(record.collections.get(collection).cloned().unwrap_or_default())
    }

    /// Ids of one type visible to this task, ascending
    pub fn ids(&self, entity_type: &str) -> Vec<EntityId> {
        let mut ids = self.store.registry.lock().ids_of_type(entity_type);
        for frame in &self.frames {
            for (id, record) in &frame.created {
                if record.entity_type == entity_type {
                    ids.insert(*id);
                }
            }
            for (id, deleted_type) in &frame.deleted {
                if *deleted_type == entity_type {
                    ids.remove(id);
                }
            }
        }
        ids.into_iter().collect()
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if !self.frames.is_empty() {
            tracing::debug!(
                open_frames = self.frames.len(),
                "transaction context dropped with open frames, aborting"
            );
        }
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("depth", &self.frames.len())
            .finish()
    }
}

/// Read-only view handed to getters
pub struct EntityView<'a> {
    ctx: &'a TransactionContext,
    id: EntityId,
}

impl<'a> EntityView<'a> {
    pub(crate) fn new(ctx: &'a TransactionContext, id: EntityId) -> Self {
        Self { ctx, id }
    }

    /// Entity id
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Attribute value, `null` if unreadable
    pub fn get(&self, attribute: &str) -> Value {
        self.ctx.get(self.id, attribute).unwrap_or(Value::Null)
    }

    /// Numeric attribute, 0 if missing or not a number
    pub fn get_u64(&self, attribute: &str) -> u64 {
        self.get(attribute).as_u64().unwrap_or(0)
    }

    /// Floating point attribute, 0.0 if missing or not a number
    pub fn get_f64(&self, attribute: &str) -> f64 {
        self.get(attribute).as_f64().unwrap_or(0.0)
    }

    /// String attribute
    pub fn get_str(&self, attribute: &str) -> Option<String> {
        self.get(attribute).as_str().map(str::to_string)
    }

    /// Members of a collection on this entity
    pub fn children(&self, collection: &str) -> Vec<EntityId> {
        self.ctx.children(self.id, collection).unwrap_or_default()
    }

    /// View of another entity through the same context
    pub fn related(&self, id: EntityId) -> EntityView<'a> {
        EntityView { ctx: self.ctx, id }
    }

    /// Follow a reference attribute
    pub fn reference(&self, attribute: &str) -> Option<EntityView<'a>> {
        EntityId::from_value(&self.get(attribute))
            .filter(|id| self.ctx.exists(*id))
            .map(|id| self.related(id))
    }
}

/// First foreign key written by the frame whose target is gone from the
/// registry (and was not created alongside it)
fn dangling_reference(
    store: &StoreInner,
    registry: &Registry,
    values: &HashMap<EntityId, BTreeMap<usize, Value>>,
    created: &BTreeMap<EntityId, Record>,
    deleted: &BTreeMap<EntityId, &'static str>,
) -> Option<EntityId> {
    let written = created
        .iter()
        .map(|(id, record)| (*id, record.entity_type))
        .chain(values.keys().filter_map(|id| {
            let entity_type = created
                .get(id)
                .map(|r| r.entity_type)
                .or_else(|| registry.get(*id).map(|r| r.entity_type))?;
            Some((*id, entity_type))
        }));

    for (id, entity_type) in written {
        if deleted.contains_key(&id) {
            continue;
        }
        let Ok(ty) = store.schema.entity_type(entity_type) else {
            continue;
        };
        for (idx, attribute) in ty.attributes().iter().enumerate() {
            if attribute.foreign_key.is_none() {
                continue;
            }
            let value = values
                .get(&id)
                .and_then(|overlay| overlay.get(&idx))
                .or_else(|| created.get(&id).and_then(|r| r.values.get(idx)));
            let Some(target) = value.and_then(EntityId::from_value) else {
                continue;
            };
            if !registry.contains(target) && !created.contains_key(&target) {
                return Some(target);
            }
        }
    }
    None
}

/// Apply an outermost frame to the registry and notify subscribers
///
/// Fails with [`StaleEntityError`] when another task deleted an entity this
/// frame points a foreign key at; the registry is left untouched.
fn apply(store: &Arc<StoreInner>, frame: Frame) -> Result<ChangeSet> {
    let Frame {
        mut values,
        dirty,
        created,
        deleted,
        collections: _,
        links,
    } = frame;

    let created_ids: BTreeSet<EntityId> = created.keys().copied().collect();
    {
        let mut registry = store.registry.lock();
        if let Some(target) = dangling_reference(store, &registry, &values, &created, &deleted) {
            tracing::debug!(entity_id = target.0, "commit refused, referenced entity was deleted");
            return Err(StaleEntityError { id: target }.into());
        }
        for (id, mut record) in created {
            if let Some(overlay) = values.remove(&id) {
                for (idx, value) in overlay {
                    if let Some(slot) = record.values.get_mut(idx) {
                        *slot = value;
                    }
                }
            }
            registry.insert(id, record);
        }
        for (id, overlay) in values {
            for (idx, value) in overlay {
                if !registry.set_value(id, idx, value) {
                    // another task committed a delete first; last commit wins
                    tracing::debug!(entity_id = id.0, "dropping writes to deleted entity");
                    break;
                }
            }
        }
        for op in &links {
            registry.apply_link(op);
        }
        for id in deleted.keys() {
            registry.remove(*id);
        }
    }

    {
        let mut cache = store.cache.lock();
        let keys: Vec<(EntityId, usize)> = dirty
            .iter()
            .flat_map(|(id, attrs)| attrs.keys().map(move |idx| (*id, *idx)))
            .collect();
        cache.invalidate(&keys);
        for id in deleted.keys() {
            cache.invalidate_entity(*id);
        }
    }

    // New values are read back from committed state, outside the registry lock
    let reader = TransactionContext::new(Arc::clone(store));
    let mut changed = BTreeMap::new();
    let mut events = Vec::new();
    for (id, attrs) in dirty {
        if deleted.contains_key(&id) {
            continue;
        }
        let Some(entity_type) = reader.entity_type_of(id) else {
            continue;
        };
        let Ok(ty) = store.schema.entity_type(entity_type) else {
            continue;
        };
        let mut attributes = Vec::with_capacity(attrs.len());
        for (idx, old) in attrs {
            let attribute = ty.attribute_at(idx);
            let new = reader.get_at(id, ty, idx).unwrap_or(Value::Null);
            if attribute.fire_event && !created_ids.contains(&id) {
                events.push(StoreEvent::Changed {
                    id,
                    entity_type,
                    attribute: attribute.name,
                    value: new.clone(),
                });
            }
            attributes.push(AttributeChange {
                attribute: attribute.name,
                index: idx,
                old,
                new,
            });
        }
        changed.insert(
            id,
            EntityChanges {
                entity_type,
                attributes,
            },
        );
    }

    let change_set = ChangeSet {
        created: created_ids,
        changed,
        deleted,
    };

    for id in &change_set.created {
        if let Some(changes) = change_set.changed.get(id) {
            store
                .events
                .send(StoreEvent::Created {
                    id: *id,
                    entity_type: changes.entity_type,
                })
                .ok();
        }
    }
    for event in events {
        store.events.send(event).ok();
    }
    for (id, entity_type) in &change_set.deleted {
        store
            .events
            .send(StoreEvent::Deleted {
                id: *id,
                entity_type,
            })
            .ok();
    }

    listener::fan_out(store, &change_set);
    Ok(change_set)
}

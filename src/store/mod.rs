//! Transactional entity store
//!
//! Entities are records with declared, observable attributes. All mutation
//! goes through a [`TransactionContext`] owned by the mutating task:
//! - [`schema`] - Entity type and attribute declarations
//! - [`registry`] - Committed state (id index, type collections, getter cache)
//! - [`transaction`] - Per-task frame stack, commit / abort
//! - [`entity`] - Create / get / set / delete on top of the frame stack
//! - [`listener`] - Channel-filtered change fan-out
//! - [`container`] - Observable list / set / map wrappers
//!
//! Reads through a context see that task's uncommitted writes; every other
//! task sees only committed values.

pub mod container;
mod entity;
pub mod listener;
mod registry;
pub mod schema;
pub mod transaction;

pub use container::{ObservableList, ObservableMap, ObservableSet};
pub use listener::{
    ChangeListener, ChannelListener, DebouncedListener, DiffAction, EntityDiff, ListenerId,
};
pub use schema::{Affects, Attribute, Channel, EntityType, ForeignKey, OnTargetDelete, Schema};
pub use transaction::{AttributeChange, ChangeSet, EntityChanges, EntityView, TransactionContext};

use crate::error::Result;
use crate::types::EntityId;
use parking_lot::Mutex;
use registry::{GetterCache, Registry};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Buffer size of the store event channel
const STORE_EVENT_BUFFER: usize = 1000;

/// Local event published on commit
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    /// Entity created by a committed transaction
    Created {
        /// Entity id
        id: EntityId,
        /// Entity type name
        entity_type: &'static str,
    },
    /// Entity deleted by a committed transaction
    Deleted {
        /// Entity id
        id: EntityId,
        /// Entity type name
        entity_type: &'static str,
    },
    /// A `fire_event` attribute changed
    Changed {
        /// Entity id
        id: EntityId,
        /// Entity type name
        entity_type: &'static str,
        /// Attribute name
        attribute: &'static str,
        /// Committed value
        value: Value,
    },
}

pub(crate) struct StoreInner {
    pub(crate) schema: Schema,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) cache: Mutex<GetterCache>,
    next_id: AtomicU64,
    pub(crate) listeners: Mutex<Vec<(ListenerId, Arc<dyn ChangeListener>)>>,
    next_listener: AtomicU64,
    pub(crate) events: tokio::sync::broadcast::Sender<StoreEvent>,
}

impl StoreInner {
    pub(crate) fn allocate_id(&self) -> EntityId {
        EntityId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Ensure ids handed out later are above `id`
    pub(crate) fn reserve_id(&self, id: EntityId) {
        self.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
    }
}

/// Handle to one entity store instance (cheap to clone)
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Create an empty store for `schema`
    pub fn new(schema: Schema) -> Self {
        let (events, _rx) = tokio::sync::broadcast::channel(STORE_EVENT_BUFFER);
        Self {
            inner: Arc::new(StoreInner {
                schema,
                registry: Mutex::new(Registry::default()),
                cache: Mutex::new(GetterCache::default()),
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                events,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    /// New transaction context for the calling task
    ///
    /// Contexts are never shared between tasks; each one carries its own
    /// frame stack.
    pub fn context(&self) -> TransactionContext {
        TransactionContext::new(Arc::clone(&self.inner))
    }

    /// Registered entity types
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Last committed value of an attribute
    pub fn get(&self, id: EntityId, attribute: &str) -> Result<Value> {
        self.context().get(id, attribute)
    }

    /// Last committed value, deserialized
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, id: EntityId, attribute: &str) -> Result<T> {
        self.context().get_as(id, attribute)
    }

    /// Whether a committed entity with this id exists
    pub fn exists(&self, id: EntityId) -> bool {
        self.inner.registry.lock().contains(id)
    }

    /// Type name of a committed entity
    pub fn entity_type_of(&self, id: EntityId) -> Option<&'static str> {
        self.inner.registry.lock().get(id).map(|r| r.entity_type)
    }

    /// Committed ids of one type, ascending
    pub fn ids(&self, entity_type: &str) -> Vec<EntityId> {
        self.inner
            .registry
            .lock()
            .ids_of_type(entity_type)
            .into_iter()
            .collect()
    }

    /// Committed members of a foreign-key collection
    pub fn children(&self, id: EntityId, collection: &str) -> Result<Vec<EntityId>> {
        self.context().children(id, collection)
    }

    /// Committed attribute values visible on `channels`
    pub fn serialize(&self, id: EntityId, channels: &[Channel]) -> Result<BTreeMap<String, Value>> {
        self.context().serialize(id, channels)
    }

    /// Number of committed entities
    pub fn len(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Whether the store holds no committed entities
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id the next created entity receives
    pub fn next_id(&self) -> EntityId {
        EntityId(self.inner.next_id.load(Ordering::SeqCst))
    }

    /// Continue id allocation above `id` (used after restoring persisted rows)
    pub fn reserve_ids_through(&self, id: EntityId) {
        self.inner.reserve_id(id);
    }

    /// Register a listener; it receives diffs from every later commit
    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(
            listener_id = id.0,
            channels = ?listener.channels(),
            "change listener subscribed"
        );
        self.inner.listeners.lock().push((id, listener));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Subscribe to created / deleted / `fire_event` notifications
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("entities", &self.len())
            .field("next_id", &self.next_id())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests;

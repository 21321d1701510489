//! Entity type declarations
//!
//! Every attribute is registered explicitly with its hooks (getter, setter,
//! change hook) as closures. [`Schema::new`] validates the declarations once
//! and resolves names into indices, so the transaction engine never looks up
//! behavior by name at runtime.

use super::transaction::{EntityView, TransactionContext};
use crate::error::{Result, SchemaError};
use crate::types::EntityId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Computed attribute: derives the value from the entity (and its relations)
pub type Getter = Arc<dyn Fn(&EntityView<'_>) -> Value + Send + Sync>;

/// Setter hook: validates or transforms an incoming value
pub type Setter = Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

/// Change hook: runs inside the mutating transaction after the value is stored
pub type OnChange =
    Arc<dyn Fn(&mut TransactionContext, EntityId, &Value, &Value) -> Result<()> + Send + Sync>;

/// Cascade callback: runs when a foreign-key collection on `parent` becomes empty
pub type CascadeFn = Arc<dyn Fn(&mut TransactionContext, EntityId) -> Result<()> + Send + Sync>;

/// Named visibility class for attributes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(pub &'static str);

impl Channel {
    /// Exported to remote UIs
    pub const REMOTE_SYNC: Channel = Channel("remote-sync");
    /// Written to the database
    pub const PERSISTENCE: Channel = Channel("persistence");
    /// Visible to in-process subscribers only
    pub const INTERNAL: Channel = Channel("internal");

    /// Channel name
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Attribute marked dirty whenever the declaring attribute changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Affects {
    /// Another attribute on the same entity
    Local(&'static str),
    /// An attribute on the entity referenced by the foreign key `via`
    Related {
        /// Foreign-key attribute on the declaring entity
        via: &'static str,
        /// Attribute on the referenced entity
        attribute: &'static str,
    },
}

/// What happens to referencing entities when the target is deleted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnTargetDelete {
    /// Delete the referencing entity too
    #[default]
    Cascade,
    /// Clear the reference
    Nullify,
}

/// Foreign-key relationship from an attribute to a collection on the target
#[derive(Clone)]
pub struct ForeignKey {
    /// Target entity type
    pub target: &'static str,
    /// Collection on the target that lists referencing entities
    pub collection: &'static str,
    /// Invoked once when the collection becomes empty
    pub on_empty: Option<CascadeFn>,
    /// Behavior when the target is deleted
    pub on_target_delete: OnTargetDelete,
}

impl ForeignKey {
    /// Reference `target`, listed in its `collection`
    pub fn new(target: &'static str, collection: &'static str) -> Self {
        Self {
            target,
            collection,
            on_empty: None,
            on_target_delete: OnTargetDelete::Cascade,
        }
    }

    /// Run `f` when the target's collection becomes empty
    pub fn on_empty<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut TransactionContext, EntityId) -> Result<()> + Send + Sync + 'static,
    {
        self.on_empty = Some(Arc::new(f));
        self
    }

    /// Set the behavior when the target is deleted
    pub fn on_target_delete(mut self, action: OnTargetDelete) -> Self {
        self.on_target_delete = action;
        self
    }
}

impl std::fmt::Debug for ForeignKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignKey")
            .field("target", &self.target)
            .field("collection", &self.collection)
            .field("on_empty", &self.on_empty.is_some())
            .field("on_target_delete", &self.on_target_delete)
            .finish()
    }
}

/// Declared attribute ("column") of an entity type
#[derive(Clone)]
pub struct Attribute {
    pub(crate) name: &'static str,
    pub(crate) default: Value,
    pub(crate) channels: Vec<Channel>,
    pub(crate) read_only: bool,
    pub(crate) fire_event: bool,
    pub(crate) getter: Option<Getter>,
    pub(crate) getter_cached: bool,
    pub(crate) setter: Option<Setter>,
    pub(crate) on_change: Option<OnChange>,
    pub(crate) affects: Vec<Affects>,
    pub(crate) foreign_key: Option<ForeignKey>,
}

impl Attribute {
    /// Plain attribute with a `null` default, visible on no channel
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            default: Value::Null,
            channels: Vec::new(),
            read_only: false,
            fire_event: false,
            getter: None,
            getter_cached: false,
            setter: None,
            on_change: None,
            affects: Vec::new(),
            foreign_key: None,
        }
    }

    /// Initial value for new entities
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }

    /// Channels the attribute is exported on
    pub fn channels(mut self, channels: &[Channel]) -> Self {
        self.channels = channels.to_vec();
        self
    }

    /// Reject external set requests
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Publish a store event when the committed value changes
    pub fn fire_event(mut self) -> Self {
        self.fire_event = true;
        self
    }

    /// Derive the value on every read
    pub fn getter<F>(mut self, f: F) -> Self
    where
        F: Fn(&EntityView<'_>) -> Value + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(f));
        self
    }

    /// Memoize the getter result until the attribute is marked dirty
    pub fn cached(mut self) -> Self {
        self.getter_cached = true;
        self
    }

    /// Validate or transform values before they are stored
    pub fn setter<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(f));
        self
    }

    /// Run `f(ctx, id, old, new)` after every effective change
    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut TransactionContext, EntityId, &Value, &Value) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.on_change = Some(Arc::new(f));
        self
    }

    /// Mark `target` dirty whenever this attribute changes
    pub fn affects(mut self, target: Affects) -> Self {
        self.affects.push(target);
        self
    }

    /// Make this attribute a reference maintained in the target's collection
    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_key = Some(fk);
        self
    }

    /// Attribute name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the attribute is exported on any of `channels`
    pub fn is_visible_on(&self, channels: &[Channel]) -> bool {
        self.channels.iter().any(|c| channels.contains(c))
    }

    /// Whether external set requests are rejected
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the value comes from a getter
    pub fn is_computed(&self) -> bool {
        self.getter.is_some()
    }
}

impl std::fmt::Debug for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("channels", &self.channels)
            .field("read_only", &self.read_only)
            .field("fire_event", &self.fire_event)
            .field("computed", &self.getter.is_some())
            .field("getter_cached", &self.getter_cached)
            .field("affects", &self.affects)
            .field("foreign_key", &self.foreign_key)
            .finish()
    }
}

/// `Affects` with names resolved to attribute indices
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResolvedAffects {
    Local(usize),
    Related { via: usize, attribute: usize },
}

/// Collection on a type that is maintained by another type's foreign key
#[derive(Clone, Debug)]
pub(crate) struct ChildLink {
    pub(crate) collection: &'static str,
    pub(crate) child_type: &'static str,
    pub(crate) attribute: usize,
    pub(crate) on_target_delete: OnTargetDelete,
}

/// Declared entity type
#[derive(Debug)]
pub struct EntityType {
    name: &'static str,
    attributes: Vec<Attribute>,
    index: HashMap<&'static str, usize>,
    duplicate: Option<&'static str>,
    pub(crate) affects: Vec<Vec<ResolvedAffects>>,
    pub(crate) children: Vec<ChildLink>,
}

impl EntityType {
    /// Start declaring a type
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            index: HashMap::new(),
            duplicate: None,
            affects: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Add an attribute (declaration order is the storage order)
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        if self.index.contains_key(attribute.name) {
            self.duplicate.get_or_insert(attribute.name);
        } else {
            self.index.insert(attribute.name, self.attributes.len());
        }
        self.attributes.push(attribute);
        self
    }

    /// Type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Declared attributes in storage order
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Storage index of an attribute
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Attribute at a storage index
    pub fn attribute_at(&self, idx: usize) -> &Attribute {
        &self.attributes[idx]
    }

    /// Whether any attribute is visible on `channels`
    pub fn is_visible_on(&self, channels: &[Channel]) -> bool {
        self.attributes.iter().any(|a| a.is_visible_on(channels))
    }

    pub(crate) fn defaults(&self) -> Vec<Value> {
        self.attributes.iter().map(|a| a.default.clone()).collect()
    }

    pub(crate) fn collection_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.children.iter().map(|c| c.collection)
    }
}

/// Validated set of entity types
#[derive(Debug)]
pub struct Schema {
    types: HashMap<&'static str, Arc<EntityType>>,
}

impl Schema {
    /// Validate declarations and resolve cross-type wiring
    pub fn new(types: Vec<EntityType>) -> std::result::Result<Self, SchemaError> {
        let mut by_name: HashMap<&'static str, EntityType> = HashMap::new();
        for ty in types {
            if let Some(attribute) = ty.duplicate {
                return Err(SchemaError::DuplicateAttribute {
                    entity_type: ty.name.to_string(),
                    attribute: attribute.to_string(),
                });
            }
            if by_name.contains_key(ty.name) {
                return Err(SchemaError::DuplicateType(ty.name.to_string()));
            }
            by_name.insert(ty.name, ty);
        }

        // Foreign keys: every target must exist; collect reverse links
        let mut links: Vec<(&'static str, ChildLink)> = Vec::new();
        for ty in by_name.values() {
            for (idx, attr) in ty.attributes.iter().enumerate() {
                let Some(fk) = &attr.foreign_key else {
                    continue;
                };
                if !by_name.contains_key(fk.target) {
                    return Err(SchemaError::UnknownTarget {
                        entity_type: ty.name.to_string(),
                        attribute: attr.name.to_string(),
                        target: fk.target.to_string(),
                    });
                }
                links.push((
                    fk.target,
                    ChildLink {
                        collection: fk.collection,
                        child_type: ty.name,
                        attribute: idx,
                        on_target_delete: fk.on_target_delete,
                    },
                ));
            }
        }

        // change_affects: resolve names against this type or the FK target
        let mut resolved: HashMap<&'static str, Vec<Vec<ResolvedAffects>>> = HashMap::new();
        for ty in by_name.values() {
            let mut per_attr = Vec::with_capacity(ty.attributes.len());
            for attr in &ty.attributes {
                let mut out = Vec::with_capacity(attr.affects.len());
                for affects in &attr.affects {
                    let unknown = |affected: &str| SchemaError::UnknownAffected {
                        entity_type: ty.name.to_string(),
                        attribute: attr.name.to_string(),
                        affected: affected.to_string(),
                    };
                    match affects {
                        Affects::Local(name) => {
                            let idx = ty.index_of(name).ok_or_else(|| unknown(name))?;
                            out.push(ResolvedAffects::Local(idx));
                        }
                        Affects::Related { via, attribute } => {
                            let via_idx = ty.index_of(via).ok_or_else(|| unknown(via))?;
                            let target = ty.attributes[via_idx]
                                .foreign_key
                                .as_ref()
                                .and_then(|fk| by_name.get(fk.target))
                                .ok_or_else(|| unknown(via))?;
                            let attr_idx = target
                                .index_of(attribute)
                                .ok_or_else(|| unknown(&format!("{}.{}", target.name, attribute)))?;
                            out.push(ResolvedAffects::Related {
                                via: via_idx,
                                attribute: attr_idx,
                            });
                        }
                    }
                }
                per_attr.push(out);
            }
            resolved.insert(ty.name, per_attr);
        }

        for (target, link) in links {
            if let Some(ty) = by_name.get_mut(target) {
                ty.children.push(link);
            }
        }
        for (name, affects) in resolved {
            if let Some(ty) = by_name.get_mut(name) {
                ty.affects = affects;
            }
        }

        Ok(Self {
            types: by_name
                .into_iter()
                .map(|(name, ty)| (name, Arc::new(ty)))
                .collect(),
        })
    }

    /// Look up a type by name
    pub fn entity_type(&self, name: &str) -> std::result::Result<&Arc<EntityType>, SchemaError> {
        self.types
            .get(name)
            .ok_or_else(|| SchemaError::UnknownType(name.to_string()))
    }

    /// Registered type names
    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.types.keys().copied()
    }
}

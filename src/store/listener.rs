//! Change fan-out to channel subscribers
//!
//! On every outermost commit each listener receives the subset of changed
//! attributes visible on its channels, one [`EntityDiff`] per entity.

use super::StoreInner;
use super::schema::Channel;
use super::transaction::ChangeSet;
use crate::types::EntityId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Registration handle returned by [`crate::store::Store::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// What happened to the entity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    /// Created; carries every visible attribute
    New,
    /// Changed; carries the changed visible attributes
    Update,
    /// Deleted; carries no attributes
    Delete,
}

/// Compact per-entity diff delivered to listeners
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityDiff {
    /// Entity type name
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Entity id
    pub id: EntityId,
    /// new / update / delete
    pub action: DiffAction,
    /// Attribute name → committed value
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

/// Subscriber to committed changes
pub trait ChangeListener: Send + Sync {
    /// Channels this listener sees
    fn channels(&self) -> &[Channel];

    /// Called synchronously at the end of every commit that produced
    /// something visible on [`Self::channels`]
    fn deliver(&self, diffs: Vec<EntityDiff>);
}

/// Build per-listener diffs for a change set and deliver them
pub(crate) fn fan_out(store: &StoreInner, change_set: &ChangeSet) {
    if change_set.is_empty() {
        return;
    }
    let listeners: Vec<Arc<dyn ChangeListener>> = store
        .listeners
        .lock()
        .iter()
        .map(|(_, listener)| Arc::clone(listener))
        .collect();

    for listener in listeners {
        let diffs = diffs_for(store, change_set, listener.channels());
        if !diffs.is_empty() {
            listener.deliver(diffs);
        }
    }
}

fn diffs_for(store: &StoreInner, change_set: &ChangeSet, channels: &[Channel]) -> Vec<EntityDiff> {
    let mut diffs = Vec::new();
    for (id, changes) in &change_set.changed {
        let Ok(ty) = store.schema.entity_type(changes.entity_type) else {
            continue;
        };
        if !ty.is_visible_on(channels) {
            continue;
        }
        let attributes: BTreeMap<String, Value> = changes
            .attributes
            .iter()
            .filter(|c| ty.attribute_at(c.index).is_visible_on(channels))
            .map(|c| (c.attribute.to_string(), c.new.clone()))
            .collect();
        let action = if change_set.created.contains(id) {
            DiffAction::New
        } else if attributes.is_empty() {
            continue;
        } else {
            DiffAction::Update
        };
        diffs.push(EntityDiff {
            entity_type: changes.entity_type.to_string(),
            id: *id,
            action,
            attributes,
        });
    }
    for (id, entity_type) in &change_set.deleted {
        let visible = store
            .schema
            .entity_type(entity_type)
            .is_ok_and(|ty| ty.is_visible_on(channels));
        if visible {
            diffs.push(EntityDiff {
                entity_type: entity_type.to_string(),
                id: *id,
                action: DiffAction::Delete,
                attributes: BTreeMap::new(),
            });
        }
    }
    diffs
}

/// Immediate delivery over an unbounded channel
pub struct ChannelListener {
    channels: Vec<Channel>,
    tx: mpsc::UnboundedSender<Vec<EntityDiff>>,
}

impl ChannelListener {
    /// Listener on `channels` plus the receiving end of its batches
    pub fn new(channels: &[Channel]) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<EntityDiff>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                channels: channels.to_vec(),
                tx,
            }),
            rx,
        )
    }
}

impl ChangeListener for ChannelListener {
    fn channels(&self) -> &[Channel] {
        &self.channels
    }

    fn deliver(&self, diffs: Vec<EntityDiff>) {
        // receiver gone: nobody is listening anymore
        self.tx.send(diffs).ok();
    }
}

/// Pending diffs merged by entity id, in first-seen order
#[derive(Debug, Default)]
struct DiffBuffer {
    entries: Vec<Option<EntityDiff>>,
    index: HashMap<EntityId, usize>,
}

impl DiffBuffer {
    fn push(&mut self, diff: EntityDiff) {
        let Some(&slot) = self.index.get(&diff.id) else {
            self.index.insert(diff.id, self.entries.len());
            self.entries.push(Some(diff));
            return;
        };
        let Some(existing) = self.entries[slot].as_mut() else {
            self.entries[slot] = Some(diff);
            return;
        };
        match (existing.action, diff.action) {
            // created and deleted inside one window: the subscriber never sees it
            (DiffAction::New, DiffAction::Delete) => {
                self.entries[slot] = None;
                self.index.remove(&diff.id);
            }
            (_, DiffAction::Delete) | (_, DiffAction::New) => {
                *existing = diff;
            }
            (DiffAction::Delete, DiffAction::Update) => {}
            (_, DiffAction::Update) => {
                existing.attributes.extend(diff.attributes);
            }
        }
    }

    fn take(&mut self) -> Vec<EntityDiff> {
        self.index.clear();
        std::mem::take(&mut self.entries)
            .into_iter()
            .flatten()
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Buffers diffs and flushes them on a timer
///
/// Action precedence per entity: a later `delete` replaces buffered updates,
/// updates following a buffered `new` stay `new` with the latest values.
pub struct DebouncedListener {
    channels: Vec<Channel>,
    buffer: Mutex<DiffBuffer>,
    tx: mpsc::UnboundedSender<Vec<EntityDiff>>,
}

impl DebouncedListener {
    /// Listener whose batches are only released by [`Self::flush`]
    pub fn new(channels: &[Channel]) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<EntityDiff>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                channels: channels.to_vec(),
                buffer: Mutex::new(DiffBuffer::default()),
                tx,
            }),
            rx,
        )
    }

    /// Listener plus a background task flushing every `interval`
    ///
    /// The task flushes one last time and exits when `cancel_token` fires.
    /// It also exits once the receiver is dropped.
    pub fn spawn(
        channels: &[Channel],
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<Vec<EntityDiff>>,
        tokio::task::JoinHandle<()>,
    ) {
        let (listener, rx) = Self::new(channels);
        let flusher = Arc::clone(&listener);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        flusher.flush();
                    }
                    _ = cancel_token.cancelled() => {
                        flusher.flush();
                        break;
                    }
                    // receiver dropped, nobody left to flush for
                    _ = flusher.tx.closed() => break,
                }
            }
        });
        (listener, rx, handle)
    }

    /// Release everything buffered as one batch
    pub fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            buffer.take()
        };
        if !batch.is_empty() {
            self.tx.send(batch).ok();
        }
    }

    /// Whether diffs are waiting for the next flush
    pub fn has_pending(&self) -> bool {
        !self.buffer.lock().is_empty()
    }
}

impl ChangeListener for DebouncedListener {
    fn channels(&self) -> &[Channel] {
        &self.channels
    }

    fn deliver(&self, diffs: Vec<EntityDiff>) {
        let mut buffer = self.buffer.lock();
        for diff in diffs {
            buffer.push(diff);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diff(id: u64, action: DiffAction, attrs: &[(&str, Value)]) -> EntityDiff {
        EntityDiff {
            entity_type: "file".into(),
            id: EntityId(id),
            action,
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn delete_suppresses_buffered_updates() {
        let (listener, mut rx) = DebouncedListener::new(&[Channel::REMOTE_SYNC]);
        listener.deliver(vec![diff(1, DiffAction::Update, &[("pos", json!(10))])]);
        listener.deliver(vec![diff(1, DiffAction::Update, &[("pos", json!(20))])]);
        listener.deliver(vec![diff(1, DiffAction::Delete, &[])]);
        listener.flush();

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch, vec![diff(1, DiffAction::Delete, &[])]);
    }

    #[test]
    fn updates_after_new_stay_new_with_latest_values() {
        let (listener, mut rx) = DebouncedListener::new(&[Channel::REMOTE_SYNC]);
        listener.deliver(vec![diff(
            4,
            DiffAction::New,
            &[("name", json!("a.bin")), ("size", json!(0))],
        )]);
        listener.deliver(vec![diff(4, DiffAction::Update, &[("size", json!(100))])]);
        listener.deliver(vec![diff(5, DiffAction::Update, &[("pos", json!(1))])]);
        listener.flush();

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].action, DiffAction::New);
        assert_eq!(batch[0].attributes["name"], json!("a.bin"));
        assert_eq!(batch[0].attributes["size"], json!(100));
        assert_eq!(batch[1].id, EntityId(5));
    }

    #[test]
    fn new_then_delete_within_window_is_dropped() {
        let (listener, mut rx) = DebouncedListener::new(&[Channel::REMOTE_SYNC]);
        listener.deliver(vec![diff(2, DiffAction::New, &[("name", json!("x"))])]);
        listener.deliver(vec![diff(2, DiffAction::Delete, &[])]);
        assert!(!listener.has_pending());
        listener.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn diff_serializes_flat() {
        let value = serde_json::to_value(diff(3, DiffAction::Update, &[("state", json!("download"))]))
            .unwrap();
        assert_eq!(
            value,
            json!({"type": "file", "id": 3, "action": "update", "state": "download"})
        );
    }

    #[tokio::test]
    async fn spawned_flusher_delivers_on_cancel() {
        let cancel = CancellationToken::new();
        let (listener, mut rx, handle) =
            DebouncedListener::spawn(&[Channel::PERSISTENCE], Duration::from_secs(3600), cancel.clone());
        // let the first immediate tick pass
        tokio::task::yield_now().await;
        listener.deliver(vec![diff(7, DiffAction::Update, &[("pos", json!(5))])]);
        cancel.cancel();
        handle.await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].id, EntityId(7));
    }

    #[tokio::test]
    async fn spawned_flusher_exits_when_receiver_is_dropped() {
        let (_listener, rx, handle) = DebouncedListener::spawn(
            &[Channel::PERSISTENCE],
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        drop(rx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

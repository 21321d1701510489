use super::*;
use crate::error::{Error, StaleEntityError, TransactionError};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

/// group 1:n item, note n:1 item (nullified on item delete)
pub(crate) fn test_store() -> (Store, Arc<AtomicUsize>) {
    let emptied = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&emptied);

    let group = EntityType::new("group")
        .attribute(
            Attribute::new("name")
                .channels(&[Channel::REMOTE_SYNC, Channel::PERSISTENCE])
                .fire_event(),
        )
        .attribute(
            Attribute::new("total")
                .channels(&[Channel::REMOTE_SYNC])
                .getter(|view| {
                    let total: u64 = view
                        .children("items")
                        .into_iter()
                        .map(|item| view.related(item).get_u64("size"))
                        .sum();
                    json!(total)
                })
                .cached(),
        )
        .attribute(Attribute::new("secret").channels(&[Channel::PERSISTENCE]));

    let item = EntityType::new("item")
        .attribute(
            Attribute::new("group")
                .channels(&[Channel::REMOTE_SYNC, Channel::PERSISTENCE])
                .foreign_key(ForeignKey::new("group", "items").on_empty(move |_ctx, _group| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .affects(Affects::Related {
                    via: "group",
                    attribute: "total",
                }),
        )
        .attribute(
            Attribute::new("size")
                .default_value(0)
                .channels(&[Channel::REMOTE_SYNC, Channel::PERSISTENCE])
                .setter(|value| {
                    if value.as_i64().is_some_and(|n| n < 0) {
                        return Err("size must not be negative".to_string());
                    }
                    Ok(value)
                })
                .affects(Affects::Related {
                    via: "group",
                    attribute: "total",
                })
                .affects(Affects::Local("label")),
        )
        .attribute(
            Attribute::new("label")
                .channels(&[Channel::REMOTE_SYNC])
                .getter(|view| json!(format!("{} bytes", view.get_u64("size")))),
        )
        .attribute(
            Attribute::new("tags")
                .default_value(json!([]))
                .channels(&[Channel::REMOTE_SYNC]),
        )
        .attribute(
            Attribute::new("locked")
                .default_value(false)
                .read_only()
                .channels(&[Channel::REMOTE_SYNC]),
        );

    let note = EntityType::new("note").attribute(
        Attribute::new("item")
            .channels(&[Channel::INTERNAL])
            .foreign_key(ForeignKey::new("item", "notes").on_target_delete(OnTargetDelete::Nullify)),
    );

    let schema = Schema::new(vec![group, item, note]).unwrap();
    (Store::new(schema), emptied)
}

fn seed(store: &Store) -> (EntityId, EntityId, EntityId) {
    let mut ctx = store.context();
    ctx.transaction(|ctx| {
        let group = ctx.create("group", &[("name", json!("g"))])?;
        let a = ctx.create("item", &[("group", group.to_value()), ("size", json!(10))])?;
        let b = ctx.create("item", &[("group", group.to_value()), ("size", json!(20))])?;
        Ok((group, a, b))
    })
    .unwrap()
}

#[test]
fn aborted_transaction_restores_everything() {
    let (store, _) = test_store();
    let (group, a, b) = seed(&store);

    let mut ctx = store.context();
    ctx.begin();
    ctx.set(a, "size", 99).unwrap();
    ctx.set(group, "name", "renamed").unwrap();
    let created = ctx.create("item", &[("group", group.to_value())]).unwrap();
    ctx.delete(b).unwrap();

    // the task sees its own writes
    assert_eq!(ctx.get(a, "size").unwrap(), json!(99));
    assert!(!ctx.exists(b));
    assert_eq!(ctx.children(group, "items").unwrap(), vec![a, created]);
    ctx.abort().unwrap();

    assert_eq!(ctx.get(a, "size").unwrap(), json!(10));
    assert_eq!(ctx.get(group, "name").unwrap(), json!("g"));
    assert!(!ctx.exists(created));
    assert!(!store.ids("item").contains(&created));
    assert!(store.ids("item").contains(&b));
    assert_eq!(store.children(group, "items").unwrap(), vec![a, b]);
}

#[test]
fn nested_commit_yields_one_change_with_outermost_old_value() {
    let (store, _) = test_store();
    let (_, a, _) = seed(&store);

    let mut ctx = store.context();
    ctx.begin();
    ctx.begin();
    ctx.set(a, "size", 1).unwrap();
    ctx.set(a, "size", 2).unwrap();
    assert!(ctx.commit().unwrap().is_none());
    let changes = ctx.commit().unwrap().unwrap();

    let sizes: Vec<_> = changes.changed[&a]
        .attributes
        .iter()
        .filter(|c| c.attribute == "size")
        .collect();
    assert_eq!(sizes.len(), 1);
    assert_eq!(sizes[0].old, json!(10));
    assert_eq!(sizes[0].new, json!(2));
    assert_eq!(store.get(a, "size").unwrap(), json!(2));
}

#[test]
fn aborting_inner_frame_keeps_outer_changes() {
    let (store, _) = test_store();
    let (_, a, b) = seed(&store);

    let mut ctx = store.context();
    ctx.begin();
    ctx.set(a, "size", 11).unwrap();
    ctx.begin();
    ctx.set(a, "size", 12).unwrap();
    ctx.set(b, "size", 21).unwrap();
    ctx.abort().unwrap();
    assert_eq!(ctx.get(a, "size").unwrap(), json!(11));
    let changes = ctx.commit().unwrap().unwrap();

    assert_eq!(store.get(a, "size").unwrap(), json!(11));
    assert_eq!(store.get(b, "size").unwrap(), json!(20));
    assert!(!changes.changed.contains_key(&b));
}

#[test]
fn inner_delete_of_outer_creation_never_existed() {
    let (store, _) = test_store();
    let (group, _, _) = seed(&store);
    let (listener, mut rx) = ChannelListener::new(&[Channel::REMOTE_SYNC]);
    store.subscribe(listener);

    let mut ctx = store.context();
    ctx.begin();
    let temp = ctx.create("item", &[("group", group.to_value())]).unwrap();
    ctx.begin();
    ctx.delete(temp).unwrap();
    ctx.commit().unwrap();
    let changes = ctx.commit().unwrap().unwrap();

    assert!(!changes.created.contains(&temp));
    assert!(!changes.deleted.contains_key(&temp));
    assert!(!store.exists(temp));
    let diffs = rx.try_recv().unwrap();
    assert!(diffs.iter().all(|d| d.id != temp));
}

#[test]
fn change_affects_marks_dependents_dirty() {
    let (store, _) = test_store();
    let (group, a, _) = seed(&store);
    assert_eq!(store.get(group, "total").unwrap(), json!(30));

    let mut ctx = store.context();
    ctx.begin();
    ctx.set(a, "size", 15).unwrap();
    let changes = ctx.commit().unwrap().unwrap();

    // label has no stored value, total lives on the related group
    let label = changes.change(a, "label").unwrap();
    assert_eq!(label.new, json!("15 bytes"));
    let total = changes.change(group, "total").unwrap();
    assert_eq!(total.new, json!(35));
    // cached getter was invalidated by the commit
    assert_eq!(store.get(group, "total").unwrap(), json!(35));
}

#[test]
fn mark_dirty_reexports_unchanged_value() {
    let (store, _) = test_store();
    let (group, _, _) = seed(&store);

    let mut ctx = store.context();
    ctx.begin();
    ctx.mark_dirty(group, "name").unwrap();
    let changes = ctx.commit().unwrap().unwrap();
    let name = changes.change(group, "name").unwrap();
    assert_eq!(name.old, json!("g"));
    assert_eq!(name.new, json!("g"));
}

#[test]
fn cascade_fires_only_for_last_child() {
    let (store, emptied) = test_store();
    let (group, a, b) = seed(&store);

    let mut ctx = store.context();
    ctx.transaction(|ctx| ctx.delete(a)).unwrap();
    assert_eq!(emptied.load(Ordering::SeqCst), 0);
    assert_eq!(store.children(group, "items").unwrap(), vec![b]);

    ctx.transaction(|ctx| ctx.delete(b)).unwrap();
    assert_eq!(emptied.load(Ordering::SeqCst), 1);

    // idempotent: deleting again runs nothing
    ctx.transaction(|ctx| ctx.delete(b)).unwrap();
    assert_eq!(emptied.load(Ordering::SeqCst), 1);
    assert!(store.exists(group));
}

#[test]
fn deleting_parent_cascades_children_without_firing_on_empty() {
    let (store, emptied) = test_store();
    let (group, a, b) = seed(&store);

    let mut ctx = store.context();
    ctx.begin();
    ctx.delete(group).unwrap();
    let changes = ctx.commit().unwrap().unwrap();
    assert!(changes.deleted.contains_key(&group));
    assert!(changes.deleted.contains_key(&a));
    assert!(changes.deleted.contains_key(&b));
    assert_eq!(emptied.load(Ordering::SeqCst), 0);
    assert!(store.ids("item").is_empty());
}

#[test]
fn nullify_clears_reference_on_target_delete() {
    let (store, _) = test_store();
    let (_, a, _) = seed(&store);

    let mut ctx = store.context();
    let note = ctx
        .transaction(|ctx| ctx.create("note", &[("item", a.to_value())]))
        .unwrap();
    assert_eq!(store.children(a, "notes").unwrap(), vec![note]);

    ctx.transaction(|ctx| ctx.delete(a)).unwrap();
    assert!(store.exists(note));
    assert_eq!(store.get(note, "item").unwrap(), Value::Null);
}

#[test]
fn mutation_without_transaction_is_rejected() {
    let (store, _) = test_store();
    let (_, a, _) = seed(&store);

    let mut ctx = store.context();
    let err = ctx.set(a, "size", 5).unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(TransactionError::NoTransaction { ref attribute, .. }) if attribute == "size"
    ));
    assert_eq!(err.to_string(), "item.size changed without transaction");
    assert!(ctx.create("group", &[]).is_err());
    assert!(ctx.delete(a).is_err());
    assert!(matches!(
        ctx.commit(),
        Err(Error::Transaction(TransactionError::NoOpenFrame { .. }))
    ));
}

#[test]
fn setting_deleted_entity_is_stale() {
    let (store, _) = test_store();
    let (_, a, _) = seed(&store);

    let mut ctx = store.context();
    ctx.begin();
    ctx.delete(a).unwrap();
    let err = ctx.set(a, "size", 1).unwrap_err();
    assert!(matches!(err, Error::StaleEntity(StaleEntityError { id }) if id == a));
}

#[test]
fn uncommitted_writes_are_invisible_to_other_tasks() {
    let (store, _) = test_store();
    let (_, a, _) = seed(&store);

    let mut writer = store.context();
    let reader = store.context();
    writer.begin();
    writer.set(a, "size", 77).unwrap();
    assert_eq!(reader.get(a, "size").unwrap(), json!(10));
    writer.commit().unwrap();
    assert_eq!(reader.get(a, "size").unwrap(), json!(77));
}

#[test]
fn commit_referencing_concurrently_deleted_entity_is_refused() {
    let (store, _) = test_store();
    let (group, a, _) = seed(&store);

    let mut writer = store.context();
    writer.begin();
    let orphan = writer
        .create("item", &[("group", group.to_value()), ("size", json!(5))])
        .unwrap();
    writer.set(a, "size", 11).unwrap();

    let mut deleter = store.context();
    deleter.transaction(|ctx| ctx.delete(group)).unwrap();
    assert!(!store.exists(group));

    let err = writer.commit().unwrap_err();
    assert!(matches!(err, Error::StaleEntity(StaleEntityError { id }) if id == group));
    assert!(!writer.in_transaction());
    assert!(!store.exists(orphan));
    assert!(store.ids("item").is_empty());
}

#[test]
fn commit_moving_reference_to_entity_created_alongside_succeeds() {
    let (store, _) = test_store();
    let (group, a, _) = seed(&store);

    let mut writer = store.context();
    writer.begin();
    let fresh = writer.create("group", &[("name", json!("fresh"))]).unwrap();
    writer.set(a, "group", fresh.to_value()).unwrap();

    let mut other = store.context();
    other.transaction(|ctx| ctx.set(group, "name", "still here")).unwrap();

    writer.commit().unwrap();
    assert_eq!(store.children(fresh, "items").unwrap(), vec![a]);
    assert_eq!(store.get(a, "group").unwrap(), fresh.to_value());
}

#[test]
fn dropping_context_aborts_open_frames() {
    let (store, _) = test_store();
    let (_, a, _) = seed(&store);
    {
        let mut ctx = store.context();
        ctx.begin();
        ctx.set(a, "size", 500).unwrap();
    }
    assert_eq!(store.get(a, "size").unwrap(), json!(10));
}

#[test]
fn setter_validates_and_read_only_refuses_external_writes() {
    let (store, _) = test_store();
    let (_, a, _) = seed(&store);

    let mut ctx = store.context();
    ctx.begin();
    assert!(matches!(
        ctx.set(a, "size", -1),
        Err(Error::InvalidValue { .. })
    ));
    assert!(matches!(
        ctx.request_set(a, "locked", true),
        Err(Error::ReadOnly { .. })
    ));
    assert!(ctx.set(a, "locked", true).unwrap());
    assert!(!ctx.set(a, "locked", true).unwrap());
    assert!(matches!(
        ctx.set(a, "nope", 1),
        Err(Error::UnknownAttribute { .. })
    ));
    ctx.commit().unwrap();
    assert_eq!(store.get(a, "locked").unwrap(), json!(true));
}

#[test]
fn listeners_only_see_their_channels() {
    let (store, _) = test_store();
    let (sync, mut sync_rx) = ChannelListener::new(&[Channel::REMOTE_SYNC]);
    let (persist, mut persist_rx) = ChannelListener::new(&[Channel::PERSISTENCE]);
    store.subscribe(sync);
    store.subscribe(persist);

    let (group, _, _) = seed(&store);
    sync_rx.try_recv().unwrap();
    persist_rx.try_recv().unwrap();

    let mut ctx = store.context();
    ctx.transaction(|ctx| ctx.set(group, "secret", "s3cr3t")).unwrap();

    // persistence-only attribute never reaches the remote-sync listener
    assert!(sync_rx.try_recv().is_err());
    let diffs = persist_rx.try_recv().unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].action, DiffAction::Update);
    assert_eq!(diffs[0].attributes.get("secret"), Some(&json!("s3cr3t")));
}

#[test]
fn new_entities_carry_all_visible_attributes() {
    let (store, _) = test_store();
    let (sync, mut rx) = ChannelListener::new(&[Channel::REMOTE_SYNC]);
    store.subscribe(sync);

    let (group, a, _) = seed(&store);
    let diffs = rx.try_recv().unwrap();
    let item = diffs.iter().find(|d| d.id == a).unwrap();
    assert_eq!(item.action, DiffAction::New);
    assert_eq!(item.attributes["size"], json!(10));
    assert_eq!(item.attributes["label"], json!("10 bytes"));
    assert_eq!(item.attributes["group"], group.to_value());
    let group_diff = diffs.iter().find(|d| d.id == group).unwrap();
    assert!(!group_diff.attributes.contains_key("secret"));
}

#[test]
fn containers_dirty_their_attribute() {
    let (store, _) = test_store();
    let (_, a, _) = seed(&store);

    let mut ctx = store.context();
    ctx.begin();
    {
        let mut tags = ObservableList::new(&mut ctx, a, "tags");
        tags.push("mirror").unwrap();
        tags.push("fast").unwrap();
        assert_eq!(tags.remove(0).unwrap(), Some(json!("mirror")));
    }
    {
        let mut set = ObservableSet::new(&mut ctx, a, "tags");
        assert!(!set.insert("fast").unwrap());
        assert!(set.insert("slow").unwrap());
    }
    let changes = ctx.commit().unwrap().unwrap();
    assert_eq!(changes.change(a, "tags").unwrap().new, json!(["fast", "slow"]));

    ctx.begin();
    {
        let mut map = ObservableMap::new(&mut ctx, a, "tags");
        assert!(map.insert("k", 1).is_err());
    }
    ctx.abort().unwrap();
}

#[tokio::test]
async fn fire_event_attributes_publish_store_events() {
    let (store, _) = test_store();
    let mut events = store.events();
    let (group, _, _) = seed(&store);

    let mut ctx = store.context();
    ctx.transaction(|ctx| ctx.set(group, "name", "renamed")).unwrap();

    let mut saw_created = false;
    let mut saw_changed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            StoreEvent::Created { id, .. } if id == group => saw_created = true,
            StoreEvent::Changed {
                id,
                attribute,
                value,
                ..
            } if id == group => {
                assert_eq!(attribute, "name");
                assert_eq!(value, json!("renamed"));
                saw_changed = true;
            }
            _ => {}
        }
    }
    assert!(saw_created);
    assert!(saw_changed);
}

#[test]
fn create_with_id_advances_allocation() {
    let (store, _) = test_store();
    let mut ctx = store.context();
    ctx.begin();
    ctx.create_with_id("group", EntityId(41), &[]).unwrap();
    assert!(matches!(
        ctx.create_with_id("group", EntityId(41), &[]),
        Err(Error::Transaction(TransactionError::DuplicateId { .. }))
    ));
    let next = ctx.create("group", &[]).unwrap();
    ctx.commit().unwrap();
    assert_eq!(next, EntityId(42));
    assert_eq!(store.next_id(), EntityId(43));
}

#[test]
fn moving_a_reference_updates_both_collections() {
    let (store, _) = test_store();
    let (group, a, _) = seed(&store);

    let mut ctx = store.context();
    let other = ctx
        .transaction(|ctx| ctx.create("group", &[("name", json!("other"))]))
        .unwrap();
    ctx.transaction(|ctx| ctx.set(a, "group", other.to_value()))
        .unwrap();

    assert!(!store.children(group, "items").unwrap().contains(&a));
    assert_eq!(store.children(other, "items").unwrap(), vec![a]);
    assert_eq!(store.get(group, "total").unwrap(), json!(20));
    assert_eq!(store.get(other, "total").unwrap(), json!(10));
}

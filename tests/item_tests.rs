mod common;

use common::{harness, harness_with, record, until};
use itemsync::{
    ActionState, FixedState, Item, Origin, StoreConfig, SyncError, SyncState, Target,
};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn fresh_item_is_written_to_both_targets() {
    let h = harness();
    let item = Item::fresh(&h.ctx, record(json!({"title": "buy milk"})));

    assert!(!item.synced());
    assert!(!item.stored());

    item.once_synced().await.unwrap();
    item.once_stored().await.unwrap();

    assert!(item.synced());
    assert!(item.stored());
    assert_eq!(item.key(Target::Transporter), Some(json!(1)));
    assert_eq!(item.key(Target::LocalCache), Some(json!(1)));

    let remote = h.transporter.get(&json!(1)).unwrap();
    assert_eq!(remote["title"], json!("buy milk"));
    assert!(remote.get("localId").is_none());

    let cached = h.local.get(&json!(1)).unwrap();
    assert_eq!(cached["id"], json!(1));
    assert_eq!(cached["transporterState"], json!("EXISTENT"));
}

#[tokio::test]
async fn transporter_record_is_synced_but_not_stored() {
    let h = harness();
    let item = Item::from_origin(
        &h.ctx,
        Origin::Transporter,
        record(json!({"id": 7, "title": "remote"})),
    );

    assert!(item.synced());
    assert!(!item.stored());

    item.once_stored().await.unwrap();
    assert!(item.stored());
    assert!(h.transporter.calls().is_empty());

    let cached = h.local.records();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0]["id"], json!(7));
    assert_eq!(cached[0]["transporterState"], json!("EXISTENT"));
}

#[tokio::test]
async fn cached_record_resumes_interrupted_delete() {
    let h = harness();
    h.transporter.insert(record(json!({"id": 9, "title": "doomed"})));
    h.local.insert(record(json!({
        "localId": 3, "id": 9, "title": "doomed", "transporterState": "BEING_DELETED"
    })));

    let item = Item::from_origin(
        &h.ctx,
        Origin::LocalCache,
        record(json!({
            "localId": 3, "id": 9, "title": "doomed", "transporterState": "BEING_DELETED"
        })),
    );

    assert!(item.removed());
    assert!(!item.synced());
    let remote = item.target_state(Target::Transporter);
    assert_eq!(remote.current, Some(FixedState::Existent));
    assert_eq!(remote.next, Some(ActionState::BeingDeleted));
    assert!(item.field("transporterState").is_none());

    item.once_synced().await.unwrap();
    item.once_stored().await.unwrap();

    assert_eq!(h.transporter.calls_for("delete")[0].payload, record(json!({"id": 9})));
    assert!(h.transporter.is_empty());
    assert!(h.local.is_empty());
    assert!(item.target_state(Target::Transporter).is_deleted());
    assert!(item.target_state(Target::LocalCache).is_deleted());
}

#[tokio::test]
async fn deleted_marker_purges_the_local_cache() {
    let h = harness();
    h.transporter.set_available(false);
    h.local.insert(record(json!({"localId": 5, "id": 9, "transporterState": "DELETED"})));

    let item = Item::from_origin(
        &h.ctx,
        Origin::LocalCache,
        record(json!({"localId": 5, "id": 9, "transporterState": "DELETED"})),
    );
    assert!(item.removed());
    assert_eq!(
        item.target_state(Target::LocalCache).next,
        Some(ActionState::BeingDeleted)
    );

    item.once_stored().await.unwrap();

    assert!(h.local.is_empty());
    assert_eq!(h.local.calls_for("delete")[0].payload, record(json!({"localId": 5})));
    assert!(h.transporter.calls().is_empty());
    assert!(item.target_state(Target::Transporter).is_deleted());
    assert!(item.target_state(Target::LocalCache).is_deleted());
}

#[tokio::test]
async fn missing_marker_is_inferred_from_transporter_key() {
    let h = harness();
    let keyed = Item::from_origin(&h.ctx, Origin::LocalCache, record(json!({"localId": 1, "id": 4})));
    let keyless = Item::from_origin(&h.ctx, Origin::LocalCache, record(json!({"localId": 2})));

    assert_eq!(keyed.transporter_marker(), SyncState::Existent);
    assert_eq!(keyless.transporter_marker(), SyncState::BeingCreated);
}

#[tokio::test]
async fn at_most_one_request_in_flight_per_target() {
    let h = harness();
    h.transporter.insert(record(json!({"id": 1, "title": "a"})));
    h.local.insert(record(json!({"localId": 1, "id": 1, "title": "a"})));
    let item = Item::from_origin(
        &h.ctx,
        Origin::LocalCache,
        record(json!({"localId": 1, "id": 1, "title": "a", "transporterState": "EXISTENT"})),
    );

    h.transporter.pause();
    let _ = item.update(record(json!({"title": "b"})), Origin::Fresh);
    until(|| h.transporter.call_count("update") == 1).await;

    let _ = item.update(record(json!({"title": "c"})), Origin::Fresh);
    let _ = item.update(record(json!({"title": "d"})), Origin::Fresh);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(h.transporter.call_count("update"), 1);
    let remote = item.target_state(Target::Transporter);
    assert_eq!(remote.in_progress, Some(ActionState::BeingUpdated));
    assert_eq!(remote.next, Some(ActionState::BeingUpdated));

    h.transporter.resume();
    item.once_synced().await.unwrap();

    let updates = h.transporter.calls_for("update");
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].payload["title"], json!("d"));
    assert_eq!(h.transporter.get(&json!(1)).unwrap()["title"], json!("d"));
}

#[tokio::test]
async fn not_found_on_local_update_deletes_from_transporter() {
    let h = harness();
    h.transporter.insert(record(json!({"id": 12, "title": "x"})));
    h.local.answer_not_found("update");
    let item = Item::from_origin(
        &h.ctx,
        Origin::LocalCache,
        record(json!({"localId": 4, "id": 12, "title": "x", "transporterState": "EXISTENT"})),
    );

    let _ = item.update(record(json!({"id": 12, "title": "y"})), Origin::Transporter);
    item.once_stored().await.unwrap();
    assert!(item.removed());

    item.once_synced().await.unwrap();
    let deletes = h.transporter.calls_for("delete");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].payload, record(json!({"id": 12})));
    assert!(h.transporter.get(&json!(12)).is_none());
}

#[tokio::test]
async fn unreachable_target_is_retried_once_available() {
    let h = harness();
    h.transporter.set_available(false);
    let item = Item::fresh(&h.ctx, record(json!({"title": "offline"})));

    until(|| h.transporter.call_count("create") == 1).await;
    item.once_stored().await.unwrap();
    assert!(!item.synced());
    assert!(h.transporter.is_empty());

    h.transporter.set_available(true);
    item.once_synced().await.unwrap();

    assert!(item.synced());
    assert_eq!(h.transporter.call_count("create"), 2);
    assert_eq!(h.transporter.len(), 1);
}

#[tokio::test]
async fn update_after_pending_create_is_sent_as_one_create() {
    let h = harness();
    h.transporter.set_available(false);
    let item = Item::fresh(&h.ctx, record(json!({"title": "draft"})));

    until(|| {
        h.transporter.call_count("create") == 1
            && item.target_state(Target::Transporter).in_progress.is_none()
    })
    .await;
    let _ = item.update(record(json!({"title": "final"})), Origin::Fresh);
    assert_eq!(
        item.target_state(Target::Transporter).next,
        Some(ActionState::BeingCreated)
    );

    h.transporter.set_available(true);
    item.once_synced().await.unwrap();

    let creates = h.transporter.calls_for("create");
    assert_eq!(creates.len(), 2);
    assert_eq!(creates[1].payload["title"], json!("final"));
    assert_eq!(h.transporter.call_count("update"), 0);
    assert_eq!(h.transporter.get(&json!(1)).unwrap()["title"], json!("final"));
}

#[tokio::test]
async fn remove_cancels_create_held_by_unreachable_transporter() {
    let h = harness();
    h.transporter.set_available(false);
    let item = Item::fresh(&h.ctx, record(json!({"title": "draft"})));

    until(|| {
        h.transporter.call_count("create") == 1
            && item.target_state(Target::Transporter).in_progress.is_none()
    })
    .await;
    let removal = item.remove(Origin::Fresh);
    assert!(item.target_state(Target::Transporter).is_deleted());

    h.transporter.set_available(true);
    removal.await.unwrap();
    item.once_synced().await.unwrap();

    assert_eq!(h.transporter.call_count("create"), 1);
    assert!(h.transporter.calls_for("delete").is_empty());
    assert!(h.transporter.is_empty());
}

#[tokio::test]
async fn fetch_in_flight_admits_only_delete() {
    let h = harness();
    h.transporter.insert(record(json!({"id": 3, "title": "remote"})));
    h.local.insert(record(json!({"localId": 1, "id": 3, "title": "remote"})));
    let item = Item::from_origin(
        &h.ctx,
        Origin::LocalCache,
        record(json!({"localId": 1, "id": 3, "title": "remote", "transporterState": "EXISTENT"})),
    );

    h.transporter.pause();
    let fetched = item.fetch(Target::Transporter);
    until(|| h.transporter.call_count("fetch") == 1).await;

    let _ = item.update(record(json!({"title": "ignored"})), Origin::Fresh);
    assert_eq!(item.target_state(Target::Transporter).next, None);
    let _ = item.remove(Origin::Fresh);
    let remote = item.target_state(Target::Transporter);
    assert_eq!(remote.in_progress, Some(ActionState::BeingFetched));
    assert_eq!(remote.next, Some(ActionState::BeingDeleted));

    h.transporter.resume();
    fetched.await.unwrap();
    item.once_synced().await.unwrap();

    assert_eq!(h.transporter.call_count("update"), 0);
    assert_eq!(h.transporter.call_count("delete"), 1);
    assert!(h.transporter.is_empty());
}

#[tokio::test]
async fn synced_waiter_resolves_for_its_own_round() {
    let h = harness();
    let item = Item::fresh(&h.ctx, record(json!({"title": "a"})));
    let first = item.once_synced();
    until(|| item.synced()).await;

    // a second round starts before the first waiter is polled
    h.transporter.pause();
    let _ = item.update(record(json!({"title": "b"})), Origin::Fresh);
    until(|| h.transporter.call_count("update") == 1).await;

    tokio::time::timeout(Duration::from_secs(1), first)
        .await
        .expect("first round already finished")
        .unwrap();
    assert!(!item.synced());

    h.transporter.resume();
    item.once_synced().await.unwrap();
    assert!(item.synced());
}

#[tokio::test]
async fn unrecoverable_error_locks_the_item() {
    let h = harness();
    h.transporter.fail_next_call("connection reset");
    let item = Item::fresh(&h.ctx, record(json!({"title": "fragile"})));

    let err = item.once_synced().await.unwrap_err();
    assert!(matches!(err, SyncError::Backend { target: Target::Transporter, .. }));
    assert!(item.locked());
    assert_eq!(item.error(), Some(err.clone()));
    assert!(item.target_state(Target::Transporter).is_locked());
    assert!(item.target_state(Target::LocalCache).is_locked());
    assert!(!item.auto_save());

    assert_eq!(item.update(record(json!({"title": "x"})), Origin::Fresh).await, Err(err.clone()));
    assert_eq!(item.once_ready_for(Target::Transporter).await, Err(err));
}

#[tokio::test]
async fn auto_save_propagates_field_writes() {
    let h = harness();
    h.local.insert(record(json!({"localId": 1, "id": 1, "title": "a"})));
    h.transporter.insert(record(json!({"id": 1, "title": "a"})));
    let item = Item::from_origin(
        &h.ctx,
        Origin::LocalCache,
        record(json!({"localId": 1, "id": 1, "title": "a", "transporterState": "EXISTENT"})),
    );
    assert!(item.auto_save());

    item.set("title", json!("b")).await.unwrap();
    assert_eq!(h.transporter.get(&json!(1)).unwrap()["title"], json!("b"));
    assert_eq!(h.local.get(&json!(1)).unwrap()["title"], json!("b"));

    item.set_auto_save(false);
    item.set("title", json!("c")).await.unwrap();
    item.mark_dirty().await.unwrap();
    assert_eq!(item.field("title"), Some(json!("c")));
    assert_eq!(h.transporter.call_count("update"), 1);

    item.set_auto_save(true);
    item.mark_dirty().await.unwrap();
    assert_eq!(h.transporter.call_count("update"), 2);
    assert_eq!(h.transporter.get(&json!(1)).unwrap()["title"], json!("c"));
}

#[tokio::test]
async fn auto_save_default_comes_from_config() {
    let h = harness_with(
        common::transporter(),
        common::local_cache(),
        StoreConfig::new("manual").auto_save(false),
    );
    let item = Item::fresh(&h.ctx, record(json!({"title": "a"})));
    assert!(!item.auto_save());
}

#[tokio::test]
async fn once_ready_for_waits_for_the_key() {
    let h = harness();
    h.transporter.pause();
    let item = Item::fresh(&h.ctx, record(json!({"title": "a"})));
    let ready = item.once_ready_for(Target::Transporter);
    assert_eq!(item.key(Target::Transporter), None);

    h.transporter.resume();
    ready.await.unwrap();
    assert_eq!(item.key(Target::Transporter), Some(json!(1)));
}

#[tokio::test]
async fn remove_before_first_write_cancels_creation() {
    let h = harness();
    let item = Item::fresh(&h.ctx, record(json!({"title": "never mind"})));
    let ready = item.once_ready_for(Target::Transporter);

    item.remove(Origin::Fresh).await.unwrap();

    assert!(item.removed());
    assert!(item.target_state(Target::Transporter).is_deleted());
    assert!(item.target_state(Target::LocalCache).is_deleted());
    assert!(matches!(ready.await, Err(SyncError::Discarded(_))));
    assert!(h.transporter.calls().is_empty());
    assert!(h.local.calls().is_empty());
}

#[tokio::test]
async fn fetch_merges_remote_values_into_local_cache() {
    let h = harness();
    h.transporter.insert(record(json!({"id": 5, "title": "remote"})));
    h.local.insert(record(json!({"localId": 1, "id": 5, "title": "stale"})));
    let item = Item::from_origin(
        &h.ctx,
        Origin::LocalCache,
        record(json!({"localId": 1, "id": 5, "title": "stale", "transporterState": "EXISTENT"})),
    );

    item.fetch(Target::Transporter).await.unwrap();
    assert_eq!(item.field("title"), Some(json!("remote")));
    assert_eq!(item.key(Target::LocalCache), Some(json!(1)));

    item.once_stored().await.unwrap();
    assert_eq!(h.local.get(&json!(1)).unwrap()["title"], json!("remote"));
}

#[tokio::test]
async fn locked_marker_locks_the_item() {
    let h = harness();
    let item = Item::from_origin(
        &h.ctx,
        Origin::LocalCache,
        record(json!({"localId": 1, "id": 2, "transporterState": "LOCKED"})),
    );

    assert!(item.locked());
    assert!(matches!(item.error(), Some(SyncError::Locked(_))));
    assert!(item.remove(Origin::Fresh).await.is_err());
}

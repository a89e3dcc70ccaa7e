mod common;

use revkv::{Error, Revision};

/// Create then read back at the returned revision (end-to-end
/// scenario 1).
#[tokio::test]
async fn create_then_get_yields_written_value() {
    let (_dir, _path, store) = common::open_store("create_get.db").await;

    let rev = store.create("foo", b"1", 0).await.unwrap();
    assert_eq!(rev, Some(Revision::new(1)), "first write is revision 1");

    let rows = store.list_current("foo", "", 0, false).await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.name, "foo");
    assert_eq!(row.value.as_deref(), Some(&b"1"[..]));
    assert_eq!(row.id, Revision::new(1));
    assert!(row.created);
    assert!(!row.deleted);

    store.shutdown().await;
}

/// Creating a live key reports a miss, not an error.
#[tokio::test]
async fn create_of_live_key_misses() {
    let (_dir, _path, store) = common::open_store("create_live.db").await;

    assert!(store.create("foo", b"1", 0).await.unwrap().is_some());
    assert!(store.create("foo", b"2", 0).await.unwrap().is_none());

    // The losing create left no row behind.
    let rows = store.list_current("foo", "", 0, true).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value.as_deref(), Some(&b"1"[..]));

    store.shutdown().await;
}

/// Update succeeds against the live revision and misses against a
/// stale one (end-to-end scenario 2).
#[tokio::test]
async fn update_is_compare_and_swap() {
    let (_dir, _path, store) = common::open_store("update_cas.db").await;

    let rev1 = store.create("foo", b"1", 0).await.unwrap().unwrap();
    let rev2 = store.update("foo", b"2", rev1, 0).await.unwrap();
    assert_eq!(rev2, Some(Revision::new(2)));

    // Same expected revision again: the first update already superseded
    // it.
    let miss = store.update("foo", b"3", rev1, 0).await.unwrap();
    assert_eq!(miss, None);

    let row = store.get("foo").await.unwrap().unwrap();
    assert_eq!(row.value.as_deref(), Some(&b"2"[..]));
    assert_eq!(row.old_value.as_deref(), Some(&b"1"[..]));
    assert_eq!(row.prev_revision, Revision::new(1));

    store.shutdown().await;
}

/// Update with expected revision zero is a strict CAS against "no row
/// at all" — it never matches an existing key.
#[tokio::test]
async fn update_with_zero_expected_rev_misses_existing_key() {
    let (_dir, _path, store) = common::open_store("update_zero.db").await;

    store.create("foo", b"1", 0).await.unwrap().unwrap();
    assert!(store
        .update("foo", b"2", Revision::ZERO, 0)
        .await
        .unwrap()
        .is_none());
    assert!(store
        .update("missing", b"2", Revision::ZERO, 0)
        .await
        .unwrap()
        .is_none());

    store.shutdown().await;
}

/// Delete is idempotent per expected revision: one success, then
/// misses (end-to-end scenario 3, first half).
#[tokio::test]
async fn delete_is_compare_and_swap() {
    let (_dir, _path, store) = common::open_store("delete_cas.db").await;

    let rev1 = store.create("foo", b"1", 0).await.unwrap().unwrap();
    let rev2 = store.update("foo", b"2", rev1, 0).await.unwrap().unwrap();

    let rev3 = store.delete("foo", rev2).await.unwrap();
    assert_eq!(rev3, Some(Revision::new(3)));
    assert!(store.delete("foo", rev2).await.unwrap().is_none());

    // The tombstone carries the superseded value and no live value.
    let rows = store.list_current("foo", "", 0, true).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].deleted);
    assert_eq!(rows[0].value, None);
    assert_eq!(rows[0].old_value.as_deref(), Some(&b"2"[..]));

    // Not visible without include_deleted.
    assert!(store.get("foo").await.unwrap().is_none());

    store.shutdown().await;
}

/// Re-creating a deleted key starts a new life-cycle (end-to-end
/// scenario 3, second half).
#[tokio::test]
async fn recreate_after_delete_starts_new_lifecycle() {
    let (_dir, _path, store) = common::open_store("recreate.db").await;

    let rev1 = store.create("foo", b"1", 0).await.unwrap().unwrap();
    let rev2 = store.update("foo", b"2", rev1, 0).await.unwrap().unwrap();
    store.delete("foo", rev2).await.unwrap().unwrap();

    let rev4 = store.create("foo", b"x", 0).await.unwrap();
    assert_eq!(rev4, Some(Revision::new(4)));

    let row = store.get("foo").await.unwrap().unwrap();
    assert!(row.created);
    assert_eq!(row.to_key_value().create_revision, Revision::new(4));
    // The resurrected row points back at the tombstone.
    assert_eq!(row.prev_revision, Revision::new(3));

    store.shutdown().await;
}

/// An empty value is stored as an empty blob, distinct from the NULL of
/// a tombstone.
#[tokio::test]
async fn empty_value_is_not_null() {
    let (_dir, _path, store) = common::open_store("empty_value.db").await;

    store.create("empty", b"", 0).await.unwrap().unwrap();
    let row = store.get("empty").await.unwrap().unwrap();
    assert_eq!(row.value, Some(Vec::new()));

    store.shutdown().await;
}

/// Empty keys are rejected before touching the pool.
#[tokio::test]
async fn empty_key_is_invalid() {
    let (_dir, _path, store) = common::open_store("empty_key.db").await;

    let err = store.create("", b"1", 0).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    store.shutdown().await;
}

/// Range reads return the newest row per key, name-ordered, honoring
/// start-key pagination and limits.
#[tokio::test]
async fn list_orders_paginates_and_limits() {
    let (_dir, _path, store) = common::open_store("list.db").await;

    for (key, value) in [("/reg/a", "1"), ("/reg/b", "2"), ("/reg/c", "3")] {
        store.create(key, value.as_bytes(), 0).await.unwrap().unwrap();
    }
    // Newer data for /reg/a, to prove "newest row per key".
    let a = store.get("/reg/a").await.unwrap().unwrap();
    store.update("/reg/a", b"1'", a.id, 0).await.unwrap().unwrap();

    let rows = store.list_current("/reg/", "", 0, false).await.unwrap();
    let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["/reg/a", "/reg/b", "/reg/c"]);
    assert_eq!(rows[0].value.as_deref(), Some(&b"1'"[..]));

    // start_key is exclusive.
    let rows = store.list_current("/reg/", "/reg/a", 0, false).await.unwrap();
    let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["/reg/b", "/reg/c"]);

    // Limit caps the page.
    let rows = store.list_current("/reg/", "", 2, false).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].name, "/reg/a");

    store.shutdown().await;
}

/// Reads at a fixed revision see the log as of that revision.
#[tokio::test]
async fn list_at_revision_is_a_snapshot() {
    let (_dir, _path, store) = common::open_store("mvcc.db").await;

    let rev1 = store.create("/reg/a", b"old", 0).await.unwrap().unwrap();
    store.update("/reg/a", b"new", rev1, 0).await.unwrap().unwrap();
    store.create("/reg/b", b"late", 0).await.unwrap().unwrap();

    // As of revision 1 only /reg/a@1 exists.
    let rows = store
        .list("/reg/", "", 0, Revision::new(1), true)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, Revision::new(1));
    assert_eq!(rows[0].value.as_deref(), Some(&b"old"[..]));

    // At the current revision both keys show their newest rows.
    let rows = store.list_current("/reg/", "", 0, false).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].value.as_deref(), Some(&b"new"[..]));

    store.shutdown().await;
}

/// Tombstones are suppressed unless explicitly requested.
#[tokio::test]
async fn include_deleted_controls_tombstone_visibility() {
    let (_dir, _path, store) = common::open_store("tombstones.db").await;

    let rev = store.create("/reg/a", b"1", 0).await.unwrap().unwrap();
    store.delete("/reg/a", rev).await.unwrap().unwrap();

    assert!(store
        .list_current("/reg/", "", 0, false)
        .await
        .unwrap()
        .is_empty());

    let rows = store.list_current("/reg/", "", 0, true).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].deleted);

    store.shutdown().await;
}

/// Counts report live keys and the revision they were taken at.
#[tokio::test]
async fn counts_track_live_keys() {
    let (_dir, _path, store) = common::open_store("count.db").await;

    store.create("/reg/a", b"1", 0).await.unwrap().unwrap();
    let rev_b = store.create("/reg/b", b"2", 0).await.unwrap().unwrap();

    let (rev, count) = store.count_current("/reg/", "").await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(rev, rev_b, "count reports the revision it ran at");

    // Deleting one key drops the live count.
    store.delete("/reg/b", rev_b).await.unwrap().unwrap();
    let (_, count) = store.count_current("/reg/", "").await.unwrap();
    assert_eq!(count, 1);

    // But counting as of the old revision still sees both.
    let (_, count) = store.count("/reg/", "", rev_b).await.unwrap();
    assert_eq!(count, 2);

    store.shutdown().await;
}

/// The current revision is the id of the newest row, monotonically
/// increasing across all keys.
#[tokio::test]
async fn current_revision_is_monotonic() {
    let (_dir, _path, store) = common::open_store("currev.db").await;

    assert_eq!(store.current_revision().await.unwrap(), Revision::ZERO);

    let mut last = 0;
    for key in ["a", "b", "c"] {
        let rev = store.create(key, b"v", 0).await.unwrap().unwrap();
        assert!(rev.get() > last);
        last = rev.get();
        assert_eq!(store.current_revision().await.unwrap(), rev);
    }

    store.shutdown().await;
}

/// Leases are stored verbatim and round-trip through reads.
#[tokio::test]
async fn lease_is_stored_verbatim() {
    let (_dir, _path, store) = common::open_store("lease.db").await;

    store.create("leased", b"v", 12345).await.unwrap().unwrap();
    let row = store.get("leased").await.unwrap().unwrap();
    assert_eq!(row.lease, 12345);

    store.shutdown().await;
}

/// The size report is positive once the schema exists.
#[tokio::test]
async fn size_reports_bytes() {
    let (_dir, _path, store) = common::open_store("size.db").await;
    assert!(store.size().await.unwrap() > 0);
    store.shutdown().await;
}

/// Tail reads return raw rows in id order, with and without a prefix
/// restriction.
#[tokio::test]
async fn tail_reads_follow_id_order() {
    let (_dir, _path, store) = common::open_store("tail.db").await;

    store.create("/a/1", b"a1", 0).await.unwrap().unwrap();
    store.create("/b/1", b"b1", 0).await.unwrap().unwrap();
    let rev = store.create("/a/2", b"a2", 0).await.unwrap().unwrap();
    store.update("/a/2", b"a2'", rev, 0).await.unwrap().unwrap();

    let engine = store.engine();

    // Every row after revision 1, regardless of key.
    let rows = engine.after(Revision::new(1), 0).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.id.get()).collect();
    assert_eq!(ids, [2, 3, 4]);

    // Restricted to /a/, including both rows of /a/2.
    let rows = engine.after_prefix("/a/", Revision::ZERO, 0).await.unwrap();
    let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["/a/1", "/a/2", "/a/2"]);

    // A limit caps the tail.
    let rows = engine.after(Revision::ZERO, 2).await.unwrap();
    assert_eq!(rows.len(), 2);

    store.shutdown().await;
}

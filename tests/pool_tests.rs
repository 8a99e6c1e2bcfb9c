// tests/pool_tests.rs
mod common;

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serial_test::serial;

use raster_pool::pool::{self, PoolError};
use raster_pool::proxy::ProxyDataset;
use raster_pool::rid;
use raster_pool::source::AccessMode;
use raster_pool::testing::{PoolEvent, SourceSpec};

use common::{pool_paths, setup};

fn spec() -> SourceSpec {
    let mut spec = SourceSpec::with_size((16, 16));
    spec.metadata.insert(None, vec!["AREA=16".to_string()]);
    spec
}

/// Opening two sources then re-referencing the first promotes it to the
/// head of the LRU list.
#[test]
#[serial]
fn lru_promotion_on_hit() {
    let opener = setup(2);
    opener.add_source("A", spec());
    opener.add_source("B", spec());

    drop(pool::ref_dataset("A", AccessMode::Read, &[], false).unwrap());
    drop(pool::ref_dataset("B", AccessMode::Read, &[], false).unwrap());
    assert_eq!(pool_paths(), ["B", "A"]);

    drop(pool::ref_dataset("A", AccessMode::Read, &[], false).unwrap());
    assert_eq!(pool_paths(), ["A", "B"]);

    // The hit reused the open entry rather than reopening.
    assert_eq!(opener.opens_of("A"), 1);
}

/// A full pool with an idle tail evicts exactly that entry, closing it
/// under the responsible identity that opened it.
#[test]
#[serial]
fn eviction_closes_tail_under_owner_rid() {
    let opener = setup(2);
    opener.add_source("A", spec());
    opener.add_source("B", spec());
    opener.add_source("C", spec());

    // Open "A" from another thread so its entry is owned by a foreign
    // identity.
    let owner_rid = thread::spawn(|| {
        drop(pool::ref_dataset("A", AccessMode::Read, &[], false).unwrap());
        rid::current()
    })
    .join()
    .unwrap();

    drop(pool::ref_dataset("B", AccessMode::Read, &[], false).unwrap());
    drop(pool::ref_dataset("C", AccessMode::Read, &[], false).unwrap());

    assert_eq!(pool_paths(), ["C", "B"]);
    assert_eq!(opener.closes_of("A"), 1);
    assert!(opener
        .events()
        .contains(&PoolEvent::Closed { path: "A".to_string(), rid: owner_rid }));
}

/// With every entry pinned, one more reference fails with a diagnostic
/// naming the configured size.
#[test]
#[serial]
fn exhaustion_when_all_entries_pinned() {
    let opener = setup(2);
    opener.add_source("A", spec());
    opener.add_source("B", spec());
    opener.add_source("C", spec());

    let _a = pool::ref_dataset("A", AccessMode::Read, &[], false).unwrap();
    let _b = pool::ref_dataset("B", AccessMode::Read, &[], false).unwrap();

    let err = pool::ref_dataset("C", AccessMode::Read, &[], false).unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { max_size: 2 }));
    assert!(err.to_string().contains("(2)"));

    // Nothing was allocated or evicted for the failed request.
    assert_eq!(pool_paths(), ["B", "A"]);
    assert_eq!(opener.opens_of("C"), 0);
}

/// ref/unref leaves the pool logically unchanged apart from the
/// MRU promotion done at ref time.
#[test]
#[serial]
fn ref_unref_round_trip() {
    let opener = setup(4);
    opener.add_source("A", spec());

    drop(pool::ref_dataset("A", AccessMode::Read, &[], false).unwrap());
    let before = pool::contents();

    drop(pool::ref_dataset("A", AccessMode::Read, &[], false).unwrap());
    let after = pool::contents();

    assert_eq!(before.len(), after.len());
    assert_eq!(before[0].path, after[0].path);
    assert_eq!(before[0].ref_count, 0);
    assert_eq!(after[0].ref_count, 0);
    assert!(after[0].open);
    assert_eq!(opener.opens_of("A"), 1);
}

/// Closing a dataset twice with no intervening ref is the same as
/// closing it once; the shell slot stays in the list.
#[test]
#[serial]
fn close_dataset_is_idempotent() {
    let opener = setup(4);
    opener.add_source("A", spec());

    drop(pool::ref_dataset("A", AccessMode::Read, &[], false).unwrap());
    pool::close_dataset("A", AccessMode::Read);
    assert_eq!(opener.closes_of("A"), 1);

    pool::close_dataset("A", AccessMode::Read);
    assert_eq!(opener.closes_of("A"), 1);

    let contents = pool::contents();
    assert_eq!(contents.len(), 1);
    assert!(!contents[0].open);
    assert!(contents[0].path.is_empty());
}

/// Two shared references from the same thread land on the same entry
/// with a refcount of two.
#[test]
#[serial]
fn shared_refs_same_rid_share_entry() {
    let opener = setup(4);
    opener.add_source("A", spec());

    let first = pool::ref_dataset("A", AccessMode::Read, &[], true).unwrap();
    let second = pool::ref_dataset("A", AccessMode::Read, &[], true).unwrap();

    assert!(Arc::ptr_eq(first.source(), second.source()));
    let contents = pool::contents();
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0].ref_count, 2);
    assert_eq!(opener.opens_of("A"), 1);

    drop(second);
    assert_eq!(pool::contents()[0].ref_count, 1);
    drop(first);
    assert_eq!(pool::contents()[0].ref_count, 0);
}

/// Shared references from threads with distinct identities get
/// distinct entries for the same path.
#[test]
#[serial]
fn shared_refs_distinct_rids_get_distinct_entries() {
    let opener = setup(4);
    opener.add_source("A", spec());

    let _local = pool::ref_dataset("A", AccessMode::Read, &[], true).unwrap();

    let (ready_tx, ready_rx) = flume::bounded(1);
    let (done_tx, done_rx) = flume::bounded::<()>(1);
    let worker = thread::spawn(move || {
        let _foreign = pool::ref_dataset("A", AccessMode::Read, &[], true).unwrap();
        ready_tx.send(()).unwrap();
        done_rx.recv().unwrap();
    });

    ready_rx.recv().unwrap();
    let contents = pool::contents();
    assert_eq!(contents.len(), 2);
    assert!(contents.iter().all(|entry| entry.path == "A"));
    assert_eq!(opener.opens_of("A"), 2);

    done_tx.send(()).unwrap();
    worker.join().unwrap();
}

/// An exclusive reference never joins a live entry; it opens a second
/// one for the same path.
#[test]
#[serial]
fn exclusive_ref_does_not_reuse_live_entry() {
    let opener = setup(4);
    opener.add_source("A", spec());

    let _first = pool::ref_dataset("A", AccessMode::Read, &[], false).unwrap();
    let _second = pool::ref_dataset("A", AccessMode::Read, &[], false).unwrap();

    let contents = pool::contents();
    assert_eq!(contents.len(), 2);
    assert!(contents.iter().all(|entry| entry.path == "A" && entry.ref_count == 1));
    assert_eq!(opener.opens_of("A"), 2);
}

/// A failed open surfaces `OpenFailed` and leaves an unpinned shell
/// entry carrying the path.
#[test]
#[serial]
fn failed_open_leaves_idle_shell() {
    let opener = setup(4);
    opener.fail_path("broken");

    let err = pool::ref_dataset("broken", AccessMode::Read, &[], false).unwrap_err();
    assert!(matches!(err, PoolError::OpenFailed { .. }));

    let contents = pool::contents();
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0].path, "broken");
    assert_eq!(contents[0].ref_count, 0);
    assert!(!contents[0].open);
}

/// A proxy dataset constructed inside an open (a cascaded proxy) must
/// not change the pool's top-level refcount, and must keep working once
/// the outer open completes.
#[test]
#[serial]
fn cascaded_proxy_does_not_pin_pool() {
    let opener = setup(4);
    opener.add_source("inner", spec());
    opener.add_source("outer", spec());

    let stash: Arc<Mutex<Option<Arc<ProxyDataset>>>> = Arc::new(Mutex::new(None));
    let hook_stash = stash.clone();
    opener.set_open_hook("outer", move |source| {
        let inner = ProxyDataset::create("inner", 16, 16, AccessMode::Read, true, None, None);
        *hook_stash.lock() = Some(inner.clone());
        // The cascaded proxy stays alive as long as the outer source is
        // open, so its final drop happens inside a pool-performed close.
        source.retain(inner);
    });

    let outer = ProxyDataset::create("outer", 16, 16, AccessMode::Read, false, None, None);
    let before = pool::stats().unwrap();
    assert_eq!(before.ref_count, 1);

    assert!(outer.metadata(None).is_some());

    let after = pool::stats().unwrap();
    assert_eq!(after.ref_count, before.ref_count);

    // The cascaded proxy works normally now that the open is over.
    let inner = stash.lock().take().unwrap();
    assert_eq!(inner.metadata_item("missing", None), None);
    assert!(inner.metadata(None).is_some());
    assert_eq!(pool::stats().unwrap().ref_count, 1);

    drop(inner);
    drop(outer);

    // The last top-level unref destroyed the pool and closed both
    // cached sources.
    assert!(pool::stats().is_none());
    assert_eq!(opener.closes_of("outer"), 1);
    assert_eq!(opener.closes_of("inner"), 1);
}

/// prevent_destroy keeps the pool alive through the last unref;
/// force_destroy then tears it down.
#[test]
#[serial]
fn teardown_hooks_override_refcount() {
    let opener = setup(4);
    opener.add_source("A", spec());

    let proxy = ProxyDataset::create("A", 16, 16, AccessMode::Read, true, None, None);
    assert!(proxy.metadata(None).is_some());

    pool::prevent_destroy();
    drop(proxy);
    assert!(pool::stats().is_some());

    pool::force_destroy();
    assert!(pool::stats().is_none());
    assert_eq!(opener.closes_of("A"), 1);
}

/// nullify_singleton abandons the pool without closing anything.
#[test]
#[serial]
fn nullify_singleton_abandons_entries() {
    let opener = setup(4);
    opener.add_source("A", spec());

    let proxy = ProxyDataset::create("A", 16, 16, AccessMode::Read, true, None, None);
    assert!(proxy.metadata(None).is_some());

    pool::nullify_singleton();
    assert!(pool::stats().is_none());
    assert_eq!(opener.closes_of("A"), 0);

    // The proxy's teardown finds no pool and is a quiet no-op.
    drop(proxy);
    assert!(pool::stats().is_none());
}

/// The configured size is read when the pool is created.
#[test]
#[serial]
fn configured_size_applies_at_creation() {
    let opener = setup(3);
    opener.add_source("A", spec());

    drop(pool::ref_dataset("A", AccessMode::Read, &[], false).unwrap());
    assert_eq!(pool::stats().unwrap().max_size, 3);
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tagcache::{CleanupStats, Store};

fn entry_files(root: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("k:"))
        .map(|entry| entry.into_path())
        .collect()
}

fn backdate(path: &Path) {
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(1_000, 0)).unwrap();
}

#[test]
fn cleanup_spares_live_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let calls = AtomicUsize::new(0);

    let entry = store
        .define("alive")
        .tag("keep")
        .build(|_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1_u32)
        })
        .unwrap();
    entry.invoke().unwrap();

    assert_eq!(store.cleanup().unwrap(), CleanupStats::default());

    entry.invoke().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "sweep did not harm the entry");
}

#[test]
fn cleanup_reclaims_invalidated_keys_exactly_once() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();

    let entry = store.define("a").build(|_ctx| Ok(1_u8)).unwrap();
    entry.invoke().unwrap();
    store.invalidate_key("a").unwrap();

    let first = store.cleanup().unwrap();
    assert_eq!(first.keys_reclaimed, 1);
    assert_eq!(first.tag_links_reclaimed, 0);
    assert!(entry_files(tmp.path()).is_empty());

    // Idempotent: nothing left to reclaim.
    assert_eq!(store.cleanup().unwrap(), CleanupStats::default());
}

#[test]
fn cleanup_reclaims_drifted_tag_links() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();

    let entry = store
        .define("multi")
        .tags(["alpha", "beta"])
        .build(|_ctx| Ok(1_u8))
        .unwrap();
    entry.invoke().unwrap();

    // Removing alpha's index drops the inode's live link count below the
    // count recorded in beta's link name.
    store.invalidate_tag("alpha").unwrap();

    let stats = store.cleanup().unwrap();
    assert_eq!(stats.keys_reclaimed, 0, "the entry itself is not expired");
    assert_eq!(stats.tag_links_reclaimed, 1, "beta's link drifted");

    assert_eq!(store.cleanup().unwrap(), CleanupStats::default());
}

#[test]
fn cleanup_reclaims_expired_tagged_entries_fully() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();

    let entry = store
        .define("stale")
        .expire(100)
        .tag("section")
        .build(|_ctx| Ok(1_u8))
        .unwrap();
    entry.invoke().unwrap();

    // Backdating the entry's mtime expires the tag link too: both names
    // alias the same inode.
    let files = entry_files(tmp.path());
    assert_eq!(files.len(), 1);
    backdate(&files[0]);

    let stats = store.cleanup().unwrap();
    assert_eq!(stats.keys_reclaimed, 1);
    assert_eq!(stats.tag_links_reclaimed, 1);

    assert_eq!(store.cleanup().unwrap(), CleanupStats::default());
}

#[test]
fn regeneration_orphans_are_swept() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let calls = AtomicUsize::new(0);

    let entry = store
        .define("rotating")
        .tag("feed")
        .build(|_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(2_u8)
        })
        .unwrap();
    entry.invoke().unwrap();

    // Force a regeneration: the replaced file's old inode survives only
    // through its now-drifted tag link.
    store.invalidate_key("rotating").unwrap();
    entry.invoke().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = store.cleanup().unwrap();
    assert_eq!(stats.keys_reclaimed, 0, "the live entry file stays");
    assert_eq!(stats.tag_links_reclaimed, 1, "the old generation's link goes");

    // The fresh generation is untouched.
    entry.invoke().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.cleanup().unwrap(), CleanupStats::default());
}

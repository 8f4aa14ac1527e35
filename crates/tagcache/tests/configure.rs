use tagcache::{configure, shared, CacheError};

// Global-store tests share one process, so everything lives in a single
// #[test] to keep the ordering deterministic.
#[test]
fn process_wide_store_configures_exactly_once() {
    assert!(shared().is_none(), "nothing configured yet");

    let tmp = tempfile::tempdir().unwrap();
    let store = configure(tmp.path()).unwrap();

    let entry = store.define("greeting").build(|_ctx| Ok("hi".to_owned())).unwrap();
    assert_eq!(entry.invoke().unwrap(), "hi");

    // Any later caller sees the same store.
    let again = shared().unwrap();
    let reread = again.define("greeting").build(|_ctx| Ok("other".to_owned())).unwrap();
    assert_eq!(reread.invoke().unwrap(), "hi");

    // A second configure is refused, even with the same root.
    let err = configure(tmp.path()).unwrap_err();
    assert!(matches!(err, CacheError::AlreadyConfigured));
    let other_root = tempfile::tempdir().unwrap();
    let err = configure(other_root.path()).unwrap_err();
    assert!(matches!(err, CacheError::AlreadyConfigured));
}

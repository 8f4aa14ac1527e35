use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tagcache::Store;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn racing_readers_regenerate_at_most_once_and_never_block() {
    init_tracing();

    let tmp = tempfile::tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();

    // Seed the entry, then force it stale.
    let seed = store.define("slow").build(|_ctx| Ok(1_u32)).unwrap();
    assert_eq!(seed.invoke().unwrap(), 1);
    store.invalidate_key("slow").unwrap();

    let regenerations = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let results: Vec<u32> = thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = &store;
            let regenerations = Arc::clone(&regenerations);
            let barrier = Arc::clone(&barrier);
            handles.push(scope.spawn(move || {
                let entry = store
                    .define("slow")
                    .build(move |_ctx| {
                        regenerations.fetch_add(1, Ordering::SeqCst);
                        // Keep the lock held long enough for the other
                        // reader to hit the contended branch.
                        thread::sleep(Duration::from_millis(500));
                        Ok(2_u32)
                    })
                    .unwrap();
                barrier.wait();
                entry.invoke().unwrap()
            }));
        }
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(
        regenerations.load(Ordering::SeqCst),
        1,
        "exactly one producer invocation across both readers"
    );
    let mut sorted = results.clone();
    sorted.sort_unstable();
    assert_eq!(
        sorted,
        vec![1, 2],
        "one reader gets the fresh value, the other falls back to stale: {results:?}"
    );

    // Once the winner has published, everyone sees the fresh value without
    // another producer call.
    let after = store.define("slow").build(|_ctx| Ok(3_u32)).unwrap();
    assert_eq!(after.invoke().unwrap(), 2);
    assert_eq!(regenerations.load(Ordering::SeqCst), 1);
}

#[test]
fn cleanup_runs_safely_alongside_readers_and_writers() {
    init_tracing();

    let tmp = tempfile::tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();

    let writers = 4;
    let iters = 20;
    thread::scope(|scope| {
        for worker in 0..writers {
            let store = &store;
            scope.spawn(move || {
                for i in 0..iters {
                    let key = format!("w{worker}-{i}");
                    let entry = store
                        .define(key.clone())
                        .tag("churn")
                        .build(|_ctx| Ok(i as u64))
                        .unwrap();
                    entry.invoke().unwrap();
                    store.invalidate_key(&key).unwrap();
                    entry.invoke().unwrap();
                }
            });
        }
        let store = &store;
        scope.spawn(move || {
            for _ in 0..10 {
                store.cleanup().unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        });
    });

    // Everything left on disk is internally consistent: a final sweep after
    // one mass invalidation reclaims without error, and a repeat sweep finds
    // nothing.
    store.invalidate_tag("churn").unwrap();
    for key in (0..writers).map(|w| format!("w{w}-0")) {
        store.invalidate_key(&key).unwrap();
    }
    store.cleanup().unwrap();
    let stats = store.cleanup().unwrap();
    assert_eq!(stats.keys_reclaimed, 0);
}

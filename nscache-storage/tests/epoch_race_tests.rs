//! Racing epoch initializers and concurrent clears.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;

use nscache_core::{CacheConfig, Epoch, Expiry};
use nscache_storage::{CacheConnector, EpochManager};
use nscache_test_utils::{tenant, LmdbFixture, MemoryFixture};

#[test]
fn racing_registries_converge_on_one_epoch() {
    let fx = MemoryFixture::new();
    let registries: Vec<_> = (0..8).map(|_| Arc::new(fx.peer_registry())).collect();
    let barrier = Arc::new(Barrier::new(registries.len()));

    let handles: Vec<_> = registries
        .iter()
        .map(|registry| {
            let registry = Arc::clone(registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.session_for("alice").unwrap().epoch().unwrap()
            })
        })
        .collect();

    let epochs: HashSet<Epoch> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(epochs.len(), 1, "initializers disagreed: {:?}", epochs);

    let stored = fx
        .registry
        .epochs()
        .current(
            &fx.connector.connect(&fx.config.endpoint()).unwrap(),
            &tenant("alice"),
        )
        .unwrap();
    assert_eq!(stored, epochs.into_iter().next());
}

#[test]
fn racing_initializers_leave_one_epoch_per_tenant() {
    let fx = MemoryFixture::with_config(CacheConfig {
        epoch_min: 1,
        epoch_max: 64,
        ..CacheConfig::default()
    });
    let manager = Arc::new(EpochManager::new(&fx.config).unwrap());
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            let client = fx.connector.connect(&fx.config.endpoint()).unwrap();
            let name = format!("t{}", i % 2);
            thread::spawn(move || {
                barrier.wait();
                let epoch = manager.get_or_init(&client, &tenant(&name)).unwrap();
                (name, epoch)
            })
        })
        .collect();

    let mut per_tenant: HashMap<String, HashSet<Epoch>> = HashMap::new();
    for handle in handles {
        let (name, epoch) = handle.join().unwrap();
        per_tenant.entry(name).or_default().insert(epoch);
    }

    let client = fx.connector.connect(&fx.config.endpoint()).unwrap();
    assert_eq!(per_tenant.len(), 2);
    for (name, epochs) in per_tenant {
        assert_eq!(epochs.len(), 1, "{} got {:?}", name, epochs);
        let stored = manager.current(&client, &tenant(&name)).unwrap();
        assert_eq!(stored, epochs.into_iter().next());
    }
}

#[test]
fn concurrent_clears_each_advance_the_epoch() {
    let fx = MemoryFixture::new();
    let session = fx.registry.session_for("alice").unwrap();
    let start = session.epoch().unwrap();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let session = Arc::clone(&session);
            thread::spawn(move || session.clear_namespace().unwrap())
        })
        .collect();
    let mut results: Vec<u64> = handles
        .into_iter()
        .map(|h| h.join().unwrap().get())
        .collect();
    results.sort_unstable();

    let expected: Vec<u64> = (1..=10).map(|i| start.get() + i).collect();
    assert_eq!(results, expected);

    // No refresh: the session already sits on the stored epoch.
    let stored = fx
        .registry
        .epochs()
        .current(
            &fx.connector.connect(&fx.config.endpoint()).unwrap(),
            &tenant("alice"),
        )
        .unwrap();
    assert_eq!(session.epoch().unwrap().get(), start.get() + 10);
    assert_eq!(session.epoch(), stored);
}

#[test]
fn lmdb_racing_registries_converge() {
    let fx = LmdbFixture::new();
    let registries: Vec<_> = (0..4).map(|_| Arc::new(fx.peer_registry())).collect();
    let barrier = Arc::new(Barrier::new(registries.len()));

    let handles: Vec<_> = registries
        .iter()
        .map(|registry| {
            let registry = Arc::clone(registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let session = registry.session_for("alice").unwrap();
                session.set("k", b"v", 0, Expiry::NEVER).unwrap();
                session.epoch().unwrap()
            })
        })
        .collect();

    let epochs: HashSet<Epoch> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(epochs.len(), 1);

    let session = fx.registry.session_for("alice").unwrap();
    assert_eq!(session.get("k").unwrap(), Some(b"v".to_vec()));
}

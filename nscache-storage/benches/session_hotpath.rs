use criterion::{criterion_group, criterion_main, Criterion};
use nscache_core::{CacheConfig, Epoch, Expiry, NamespaceKeys, TenantId};
use nscache_storage::{InMemoryConnector, SessionRegistry};
use std::hint::black_box;

fn bench_key_encoding(c: &mut Criterion) {
    let keys = NamespaceKeys::new("my_ns_");
    let tenant = TenantId::new("tenant-42").expect("valid tenant");
    let epoch = Epoch::new(7331);

    c.bench_function("key/full_key", |b| {
        b.iter(|| {
            let key = keys
                .full_key(&tenant, epoch, black_box("profile:settings"))
                .expect("valid key");
            black_box(key);
        });
    });
}

fn bench_session_ops(c: &mut Criterion) {
    let config = CacheConfig::default();
    let (connector, _server) = InMemoryConnector::with_server(&config.endpoint());
    let registry = SessionRegistry::new(connector, &config).expect("build registry");
    let session = registry.session_for("alice").expect("open session");
    session
        .set("profile", b"warm value", 0, Expiry::NEVER)
        .expect("seed value");

    c.bench_function("session/get_hit", |b| {
        b.iter(|| {
            black_box(session.get(black_box("profile")).expect("get"));
        });
    });

    c.bench_function("session/set", |b| {
        b.iter(|| {
            session
                .set(black_box("profile"), b"warm value", 0, Expiry::NEVER)
                .expect("set");
        });
    });

    c.bench_function("registry/session_lookup", |b| {
        b.iter(|| {
            black_box(registry.session_for(black_box("alice")).expect("lookup"));
        });
    });
}

criterion_group!(benches, bench_key_encoding, bench_session_ops);
criterion_main!(benches);

use bootenv_backend::MemoryBackend;
use bootenv_core::{DeepCloneRequest, Handle, HandleConfig, PropertyContext};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn pool() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.add_pool("zroot");
    backend.create_dataset("zroot/ROOT", &[]);
    backend.create_dataset("zroot/ROOT/default", &[("mountpoint", "/")]);
    backend.set_root_dataset("zroot/ROOT/default");
    backend
}

/// One root with `width` direct children.
fn wide_tree(width: usize) -> Arc<MemoryBackend> {
    let backend = pool();
    for i in 0..width {
        backend.create_dataset(
            &format!("zroot/ROOT/default/ds{i}"),
            &[("compression", "lz4")],
        );
    }
    backend
}

/// A single chain `depth` levels below the root.
fn deep_tree(depth: usize) -> Arc<MemoryBackend> {
    let backend = pool();
    let mut name = "zroot/ROOT/default".to_owned();
    for i in 0..depth {
        name = format!("{name}/d{i}");
        backend.create_dataset(&name, &[]);
    }
    backend
}

fn open(backend: &Arc<MemoryBackend>) -> Handle {
    Handle::open_with_backend(backend.clone(), &HandleConfig::default()).unwrap()
}

fn bench_wide(c: &mut Criterion) {
    c.bench_function("deep_clone_wide_100", |b| {
        b.iter_with_setup(
            || {
                let backend = wide_tree(100);
                let handle = open(&backend);
                (backend, handle)
            },
            |(_backend, mut handle)| {
                handle.create("be2").unwrap();
            },
        );
    });
}

fn bench_deep(c: &mut Criterion) {
    c.bench_function("deep_clone_deep_20", |b| {
        b.iter_with_setup(
            || {
                let backend = deep_tree(20);
                let handle = open(&backend);
                (backend, handle)
            },
            |(_backend, mut handle)| {
                handle.create("be2").unwrap();
            },
        );
    });
}

fn bench_with_overrides(c: &mut Criterion) {
    let mut ctx = PropertyContext::new();
    for i in 0..100 {
        ctx.set(&format!("zroot/ROOT/be2/ds{i}"), "canmount", "noauto");
    }
    c.bench_function("deep_clone_wide_100_overrides", |b| {
        b.iter_with_setup(
            || {
                let backend = wide_tree(100);
                let handle = open(&backend);
                (backend, handle)
            },
            |(_backend, mut handle)| {
                handle
                    .deep_clone(&DeepCloneRequest::new("default", "be2").properties(&ctx))
                    .unwrap();
            },
        );
    });
}

fn bench_rollback(c: &mut Criterion) {
    c.bench_function("deep_clone_rollback_wide_100", |b| {
        b.iter_with_setup(
            || {
                let backend = wide_tree(100);
                backend.inject_fault(
                    bootenv_backend::BackendOp::Clone,
                    "zroot/ROOT/be2/ds99",
                    bootenv_backend::BackendError::Unavailable("bench".into()),
                );
                let handle = open(&backend);
                (backend, handle)
            },
            |(_backend, mut handle)| {
                assert!(handle.create("be2").is_err());
            },
        );
    });
}

criterion_group!(
    benches,
    bench_wide,
    bench_deep,
    bench_with_overrides,
    bench_rollback,
);
criterion_main!(benches);

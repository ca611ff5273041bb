//! Reference counting benchmarks
//!
//! Measures the hot paths: strong clone/drop, weak promotion, and the
//! lightweight counter for comparison.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use typthon_refbase::{
    LifetimePolicy, LightRefBase, LightRefCounted, LightSp, RefBase, RefCounted, Sp,
};

struct Payload {
    base: RefBase,
    value: u64,
}

unsafe impl RefCounted for Payload {
    fn ref_base(&self) -> &RefBase {
        &self.base
    }
}

struct LightPayload {
    base: LightRefBase,
    value: u64,
}

unsafe impl LightRefCounted for LightPayload {
    fn light_base(&self) -> &LightRefBase {
        &self.base
    }
}

fn payload(policy: LifetimePolicy) -> Sp<Payload> {
    Sp::new(Payload {
        base: RefBase::with_policy(policy),
        value: 7,
    })
}

fn bench_strong(c: &mut Criterion) {
    let mut group = c.benchmark_group("strong");
    let sp = payload(LifetimePolicy::StrongOnly);

    group.bench_function("clone_drop", |b| {
        b.iter(|| {
            let copy = black_box(&sp).clone();
            black_box(copy.value)
        })
    });

    group.bench_function("create_destroy", |b| {
        b.iter(|| black_box(payload(LifetimePolicy::StrongOnly)))
    });

    group.finish();
}

fn bench_promote(c: &mut Criterion) {
    let mut group = c.benchmark_group("promote");

    for policy in [LifetimePolicy::StrongOnly, LifetimePolicy::WeakExtendsLife] {
        let sp = payload(policy);
        let wp = Sp::downgrade(&sp);

        group.bench_with_input(BenchmarkId::new("live", policy), &wp, |b, wp| {
            b.iter(|| black_box(wp.promote()).map(|sp| sp.value))
        });
    }

    // Reviving from a released count consults the owner every time
    let sp = payload(LifetimePolicy::WeakExtendsLife);
    let wp = Sp::downgrade(&sp);
    drop(sp);
    group.bench_function("revive", |b| {
        b.iter(|| black_box(wp.promote()).map(|sp| sp.value))
    });

    group.finish();
}

fn bench_light(c: &mut Criterion) {
    let sp = LightSp::new(LightPayload {
        base: LightRefBase::new(),
        value: 7,
    });

    c.bench_function("light_clone_drop", |b| {
        b.iter(|| {
            let copy = black_box(&sp).clone();
            black_box(copy.value)
        })
    });
}

criterion_group!(benches, bench_strong, bench_promote, bench_light);
criterion_main!(benches);

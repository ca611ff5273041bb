//! Concurrent counting: lost updates, single destruction, promotion races

use rayon::prelude::*;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use typthon_refbase::tracking::{RefKind, RefOp};
use typthon_refbase::{HolderId, LifetimePolicy, RefBase, RefCounted, RefTracer, Sp, Wp};

const THREADS: usize = 8;

struct Shared {
    base: RefBase,
    value: usize,
    drops: Arc<AtomicUsize>,
}

impl Shared {
    fn new(policy: LifetimePolicy, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            base: RefBase::with_policy(policy),
            value: 42,
            drops: Arc::clone(drops),
        }
    }
}

unsafe impl RefCounted for Shared {
    fn ref_base(&self) -> &RefBase {
        &self.base
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

/// Counts the blocks it is installed on as they are freed
struct FreeCounter(Arc<AtomicUsize>);

impl RefTracer for FreeCounter {
    fn record(&self, _kind: RefKind, _op: RefOp, _holder: HolderId, _count: i32) {}
}

impl Drop for FreeCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_no_lost_updates() {
    let drops = counter();
    let root = Sp::new(Shared::new(LifetimePolicy::StrongOnly, &drops));

    let kept: Vec<Vec<Sp<Shared>>> = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let root = &root;
                s.spawn(move |_| {
                    let mut local: Vec<Sp<Shared>> = (0..1000).map(|_| root.clone()).collect();
                    local.truncate(500);
                    local
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();

    assert_eq!(Sp::strong_count(&root), 1 + THREADS as i32 * 500);
    assert_eq!(Sp::weak_count(&root), 1 + THREADS as i32 * 500);

    drop(kept);
    assert_eq!(Sp::strong_count(&root), 1);
    assert_eq!(Sp::weak_count(&root), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
}

#[test]
fn test_weak_no_lost_updates() {
    let drops = counter();
    let root = Sp::new(Shared::new(LifetimePolicy::StrongOnly, &drops));
    let weak = Sp::downgrade(&root);

    crossbeam::scope(|s| {
        for _ in 0..THREADS {
            let weak = &weak;
            s.spawn(move |_| {
                for _ in 0..1000 {
                    let w = weak.clone();
                    let promoted = w.promote();
                    assert!(promoted.is_some());
                }
            });
        }
    })
    .unwrap();

    assert_eq!(Sp::strong_count(&root), 1);
    assert_eq!(Sp::weak_count(&root), 2);
}

#[test]
fn test_destroyed_exactly_once() {
    for _ in 0..200 {
        let drops = counter();
        let root = Sp::new(Shared::new(LifetimePolicy::StrongOnly, &drops));
        let barrier = Barrier::new(THREADS);
        let handles: Vec<Sp<Shared>> = (0..THREADS).map(|_| root.clone()).collect();
        drop(root);

        crossbeam::scope(|s| {
            for handle in handles {
                let barrier = &barrier;
                s.spawn(move |_| {
                    barrier.wait();
                    drop(handle);
                });
            }
        })
        .unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_promotion_races_release() {
    for _ in 0..200 {
        let drops = counter();
        let root = Sp::new(Shared::new(LifetimePolicy::StrongOnly, &drops));
        let weak = Sp::downgrade(&root);
        let barrier = Barrier::new(2);

        let promoted = crossbeam::scope(|s| {
            let barrier_ref = &barrier;
            s.spawn(move |_| {
                barrier_ref.wait();
                drop(root);
            });

            let weak = &weak;
            s.spawn(move |_| {
                barrier_ref.wait();
                weak.promote().map(|sp| sp.value)
            })
            .join()
            .unwrap()
        })
        .unwrap();

        if let Some(value) = promoted {
            assert_eq!(value, 42);
        }
        // Whoever released last destroyed it; promotion never resurrects
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(weak.promote().is_none());
    }
}

#[test]
fn test_concurrent_revival_under_weak_extends_life() {
    let drops = counter();
    let root = Sp::new(Shared::new(LifetimePolicy::WeakExtendsLife, &drops));
    let weak = Sp::downgrade(&root);
    drop(root);

    crossbeam::scope(|s| {
        for _ in 0..THREADS {
            let weak = &weak;
            s.spawn(move |_| {
                for _ in 0..500 {
                    let sp = weak.promote().unwrap();
                    assert_eq!(sp.value, 42);
                }
            });
        }
    })
    .unwrap();

    assert_eq!(weak.strong_count(), 0);
    assert_eq!(weak.weak_count(), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    drop(weak);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_racing_first_acquisitions_publish_one_block() {
    for _ in 0..50 {
        let drops = counter();
        let raw = Box::into_raw(Box::new(Shared::new(LifetimePolicy::Forever, &drops)));
        let address = raw as usize;
        let barrier = Barrier::new(THREADS);

        let results: Vec<(Wp<Shared>, usize)> = crossbeam::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let barrier = &barrier;
                    s.spawn(move |_| {
                        let ptr = NonNull::new(address as *mut Shared).unwrap();
                        barrier.wait();
                        let weak = unsafe { Wp::from_raw(ptr) };
                        let block = weaks_block(&weak);
                        (weak, block)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
        .unwrap();

        let first = results[0].1;
        assert!(results.iter().all(|(_, block)| *block == first));
        let weaks: Vec<Wp<Shared>> = results.into_iter().map(|(weak, _)| weak).collect();
        assert!(weaks.iter().all(|w| weaks_block(w) == first));
        assert_eq!(weaks[0].weak_count(), THREADS as i32);

        drop(weaks);
        drop(unsafe { Box::from_raw(raw) });
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_forever_allocator_drop_races_last_weak() {
    const ROUNDS: usize = 2000;
    let freed = counter();

    for _ in 0..ROUNDS {
        let drops = counter();
        let raw = Box::into_raw(Box::new(Shared::new(LifetimePolicy::Forever, &drops)));
        let weak = unsafe { Wp::from_raw(NonNull::new(raw).unwrap()) };
        weak.refs()
            .install_tracer(Box::new(FreeCounter(Arc::clone(&freed))))
            .unwrap();
        let address = raw as usize;
        let barrier = Barrier::new(2);

        crossbeam::scope(|s| {
            let barrier = &barrier;
            s.spawn(move |_| {
                barrier.wait();
                drop(unsafe { Box::from_raw(address as *mut Shared) });
            });
            s.spawn(move |_| {
                barrier.wait();
                drop(weak);
            });
        })
        .unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    assert_eq!(freed.load(Ordering::SeqCst), ROUNDS);
}

#[test]
fn test_forever_promoters_see_allocator_drop() {
    for _ in 0..200 {
        let drops = counter();
        let raw = Box::into_raw(Box::new(Shared::new(LifetimePolicy::Forever, &drops)));
        let anchor = unsafe { Sp::from_raw(NonNull::new(raw).unwrap()) };
        let weaks: Vec<Wp<Shared>> = (0..THREADS).map(|_| Sp::downgrade(&anchor)).collect();
        let barrier = Barrier::new(THREADS);

        // Every promotion lands while the anchor keeps the count positive
        crossbeam::scope(|s| {
            for weak in &weaks {
                let barrier = &barrier;
                s.spawn(move |_| {
                    barrier.wait();
                    for _ in 0..50 {
                        assert_eq!(weak.promote().map(|sp| sp.value), Some(42));
                    }
                });
            }
        })
        .unwrap();

        drop(anchor);
        drop(unsafe { Box::from_raw(raw) });
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        crossbeam::scope(|s| {
            for weak in weaks {
                s.spawn(move |_| {
                    assert!(weak.is_expired());
                    assert!(weak.promote().is_none());
                });
            }
        })
        .unwrap();
    }
}

fn weaks_block(weak: &Wp<Shared>) -> usize {
    weak.refs() as *const _ as usize
}

#[test]
fn test_parallel_clone_and_drop() {
    let drops = counter();
    let root = Sp::new(Shared::new(LifetimePolicy::StrongOnly, &drops));

    let total: usize = (0..10_000)
        .into_par_iter()
        .map(|_| {
            let local = root.clone();
            let weak = Sp::downgrade(&local);
            weak.promote().map_or(0, |sp| sp.value)
        })
        .sum();

    assert_eq!(total, 42 * 10_000);
    assert_eq!(Sp::strong_count(&root), 1);
    assert_eq!(Sp::weak_count(&root), 1);

    drop(root);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

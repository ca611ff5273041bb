//! Lightweight strong-only reference counting
//!
//! For types that never need weak references, lifetime policies or hooks.
//! The count lives inline in the object; there is no separate block.

use crate::errors::{fatal, LifetimeViolation};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI32, Ordering};
use tracing::trace;

/// Inline strong counter
#[derive(Default)]
pub struct LightRefBase {
    count: AtomicI32,
}

impl LightRefBase {
    pub const fn new() -> Self {
        Self {
            count: AtomicI32::new(0),
        }
    }

    /// DEBUGGING ONLY: current strong count
    #[inline]
    pub fn strong_count(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn inc(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when the caller released the last reference
    #[inline(always)]
    fn dec(&self) -> bool {
        let old = self.count.fetch_sub(1, Ordering::Release);
        if old <= 0 {
            fatal(
                LifetimeViolation::StrongUnderflow { previous: old },
                self as *const Self as *const (),
            );
        }
        if old == 1 {
            // Synchronize with all previous decrements
            fence(Ordering::Acquire);
            return true;
        }
        false
    }
}

impl fmt::Debug for LightRefBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LightRefBase")
            .field("count", &self.strong_count())
            .finish()
    }
}

/// Types counted by an embedded `LightRefBase`
///
/// # Safety
/// `light_base` must always return the same counter, embedded in `self`,
/// and managed objects must be allocated through `Box`.
pub unsafe trait LightRefCounted: Send + Sync + 'static {
    fn light_base(&self) -> &LightRefBase;
}

/// Strong handle for `LightRefCounted` types; drops the box at count zero
pub struct LightSp<T: LightRefCounted> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

impl<T: LightRefCounted> LightSp<T> {
    pub fn new(value: T) -> Self {
        Self::from_box(Box::new(value))
    }

    pub fn from_box(object: Box<T>) -> Self {
        // SAFETY: Box::into_raw never returns null
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(object)) };
        // SAFETY: freshly leaked, nobody else references it
        unsafe { Self::from_raw(ptr) }
    }

    /// Take one more reference on a managed object.
    ///
    /// # Safety
    /// `ptr` must point to a live boxed object whose count has not dropped
    /// to zero.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        ptr.as_ref().light_base().inc();
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }

    pub fn strong_count(this: &Self) -> i32 {
        this.light_base().strong_count()
    }

    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    pub fn assign(&mut self, other: &LightSp<T>) {
        *self = other.clone();
    }
}

impl<T: LightRefCounted> Clone for LightSp<T> {
    #[inline]
    fn clone(&self) -> Self {
        self.light_base().inc();
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: LightRefCounted> Drop for LightSp<T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: we own one reference
        let last = unsafe { self.ptr.as_ref() }.light_base().dec();
        if last {
            destroy(self.ptr);
        }
    }
}

#[cold]
fn destroy<T: LightRefCounted>(ptr: NonNull<T>) {
    trace!(event = "light_destroy", address = ?ptr.as_ptr());
    // SAFETY: the last reference is gone and the object came from a Box
    drop(unsafe { Box::from_raw(ptr.as_ptr()) });
}

impl<T: LightRefCounted> Deref for LightSp<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: LightRefCounted> LightSp<T> {
    #[inline]
    fn addr(this: &Self) -> *const () {
        this.ptr.as_ptr() as *const ()
    }
}

impl<T: LightRefCounted, U: LightRefCounted> PartialEq<LightSp<U>> for LightSp<T> {
    fn eq(&self, other: &LightSp<U>) -> bool {
        LightSp::addr(self) == LightSp::addr(other)
    }
}

impl<T: LightRefCounted> PartialEq<*const T> for LightSp<T> {
    fn eq(&self, other: &*const T) -> bool {
        LightSp::addr(self) == *other as *const ()
    }
}

impl<T: LightRefCounted> Eq for LightSp<T> {}

impl<T: LightRefCounted, U: LightRefCounted> PartialOrd<LightSp<U>> for LightSp<T> {
    fn partial_cmp(&self, other: &LightSp<U>) -> Option<CmpOrdering> {
        Some(LightSp::addr(self).cmp(&LightSp::addr(other)))
    }
}

impl<T: LightRefCounted> PartialOrd<*const T> for LightSp<T> {
    fn partial_cmp(&self, other: &*const T) -> Option<CmpOrdering> {
        Some(LightSp::addr(self).cmp(&(*other as *const ())))
    }
}

impl<T: LightRefCounted> Ord for LightSp<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        LightSp::addr(self).cmp(&LightSp::addr(other))
    }
}

impl<T: LightRefCounted> Hash for LightSp<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        LightSp::addr(self).hash(state)
    }
}

impl<T: LightRefCounted> fmt::Debug for LightSp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LightSp({:p})", self.ptr)
    }
}

impl<T: LightRefCounted> fmt::Pointer for LightSp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr, f)
    }
}

// LightSp is thread-safe with atomic refcounting
unsafe impl<T: LightRefCounted> Send for LightSp<T> {}
unsafe impl<T: LightRefCounted> Sync for LightSp<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    struct Blob {
        base: LightRefBase,
        drops: Arc<AtomicUsize>,
    }

    unsafe impl LightRefCounted for Blob {
        fn light_base(&self) -> &LightRefBase {
            &self.base
        }
    }

    impl Drop for Blob {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn blob(drops: &Arc<AtomicUsize>) -> LightSp<Blob> {
        LightSp::new(Blob {
            base: LightRefBase::new(),
            drops: Arc::clone(drops),
        })
    }

    #[test]
    fn test_light_inc_dec() {
        let drops = Arc::new(AtomicUsize::new(0));
        let a = blob(&drops);
        assert_eq!(LightSp::strong_count(&a), 1);

        let b = a.clone();
        let c = b.clone();
        assert_eq!(LightSp::strong_count(&a), 3);
        assert_eq!(a, c);

        drop(b);
        drop(c);
        assert_eq!(LightSp::strong_count(&a), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_light_from_raw() {
        let drops = Arc::new(AtomicUsize::new(0));
        let a = blob(&drops);

        let ptr = NonNull::new(LightSp::as_ptr(&a) as *mut Blob).unwrap();
        let b = unsafe { LightSp::from_raw(ptr) };
        assert!(LightSp::ptr_eq(&a, &b));
        assert_eq!(LightSp::strong_count(&b), 2);
    }

    #[test]
    fn test_light_self_assign() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut a = blob(&drops);
        let alias = a.clone();

        a.assign(&alias);
        drop(alias);
        assert_eq!(LightSp::strong_count(&a), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_light_order_hash_and_raw_comparison() {
        let drops = Arc::new(AtomicUsize::new(0));
        let a = blob(&drops);
        let b = blob(&drops);

        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(a.clone());
        set.insert(b.clone());
        assert_eq!(set.len(), 2);

        let mut sorted = vec![b.clone(), a.clone()];
        sorted.sort();
        assert!(LightSp::as_ptr(&sorted[0]) < LightSp::as_ptr(&sorted[1]));

        assert!(a == LightSp::as_ptr(&a));
        assert!(a != LightSp::as_ptr(&b));
        assert_eq!(
            a.partial_cmp(&LightSp::as_ptr(&b)),
            Some(LightSp::as_ptr(&a).cmp(&LightSp::as_ptr(&b)))
        );
        assert_eq!(format!("{:p}", a), format!("{:p}", LightSp::as_ptr(&a)));
    }

    #[test]
    fn test_light_concurrent_release() {
        let drops = Arc::new(AtomicUsize::new(0));
        let a = blob(&drops);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let local = a.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        drop(local.clone());
                    }
                })
            })
            .collect();
        drop(a);

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

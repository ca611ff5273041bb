//! Strong handle

use super::Wp;
use crate::refs::{self, RefBlock, RefCounted};
use crate::tracking::{HolderId, ReferenceReport};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

/// Owning reference to a managed object
///
/// Design: keeps the block pointer next to the object pointer so release
/// never has to go back through the object.
/// - `Clone` takes one more strong reference
/// - `Drop` releases it, possibly destroying the object
/// - `Sp::downgrade` hands out a weak handle on the same block
pub struct Sp<T: RefCounted> {
    ptr: NonNull<T>,
    refs: NonNull<RefBlock>,
    holder: HolderId,
    _marker: PhantomData<T>,
}

impl<T: RefCounted> Sp<T> {
    /// Move `value` to the heap and take the first strong reference
    pub fn new(value: T) -> Self {
        Self::from_box(Box::new(value))
    }

    /// Publish a boxed object.
    ///
    /// This is the privileged entry point: it takes the strong reference
    /// unconditionally, reviving a recycled object as a fresh one.
    pub fn from_box(object: Box<T>) -> Self {
        // SAFETY: Box::into_raw never returns null
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(object)) };
        let holder = HolderId::next();
        // SAFETY: we own the box; nobody else can reference the object yet
        let refs = unsafe { refs::force_acquire_strong(ptr, holder) };
        Self::from_parts(ptr, refs, holder)
    }

    /// Take a new strong reference on an object that is already managed.
    ///
    /// # Safety
    /// `ptr` must point to a live object that was boxed and, under
    /// `StrongOnly`, has not had its strong count released to zero.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        let holder = HolderId::next();
        let refs = ptr.as_ref().ref_base().create_refs(ptr);
        refs.as_ref().inc_strong(holder);
        Self::from_parts(ptr, refs, holder)
    }

    /// Wrap a strong reference that was already counted for `holder`
    #[inline]
    pub(crate) fn from_parts(ptr: NonNull<T>, refs: NonNull<RefBlock>, holder: HolderId) -> Self {
        Self {
            ptr,
            refs,
            holder,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }

    pub fn downgrade(this: &Self) -> Wp<T> {
        Wp::from_strong(this)
    }

    #[inline]
    pub fn refs(this: &Self) -> &RefBlock {
        // SAFETY: our strong reference keeps the block allocated
        unsafe { this.refs.as_ref() }
    }

    #[inline]
    pub(crate) fn refs_ptr(this: &Self) -> NonNull<RefBlock> {
        this.refs
    }

    #[inline]
    pub(crate) fn raw(this: &Self) -> NonNull<T> {
        this.ptr
    }

    #[inline]
    pub fn holder(this: &Self) -> HolderId {
        this.holder
    }

    pub fn strong_count(this: &Self) -> i32 {
        Self::refs(this).strong_count()
    }

    pub fn weak_count(this: &Self) -> i32 {
        Self::refs(this).weak_count()
    }

    pub fn print_refs(this: &Self) -> ReferenceReport {
        Self::refs(this).print_refs()
    }

    pub fn track_me(this: &Self, enable: bool, retain: bool) {
        Self::refs(this).track_me(enable, retain)
    }

    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// Point at `other`'s object. The new reference is taken before the old
    /// one is released, so assigning a handle to itself is harmless.
    pub fn assign(&mut self, other: &Sp<T>) {
        *self = other.clone();
    }

    #[inline]
    pub(crate) fn addr(this: &Self) -> *const () {
        this.ptr.as_ptr() as *const ()
    }
}

impl<T: RefCounted> Clone for Sp<T> {
    #[inline]
    fn clone(&self) -> Self {
        let holder = HolderId::next();
        Self::refs(self).inc_strong(holder);
        Self::from_parts(self.ptr, self.refs, holder)
    }
}

impl<T: RefCounted> Drop for Sp<T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: this handle owns one strong reference for `holder`
        unsafe { RefBlock::dec_strong(self.refs, self.holder) };
    }
}

impl<T: RefCounted> Deref for Sp<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: a strong reference keeps the object alive
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted> AsRef<T> for Sp<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: RefCounted, U: RefCounted> PartialEq<Sp<U>> for Sp<T> {
    #[inline]
    fn eq(&self, other: &Sp<U>) -> bool {
        Sp::addr(self) == Sp::addr(other)
    }
}

impl<T: RefCounted, U: RefCounted> PartialEq<Wp<U>> for Sp<T> {
    #[inline]
    fn eq(&self, other: &Wp<U>) -> bool {
        Sp::addr(self) == Wp::addr(other)
    }
}

impl<T: RefCounted> PartialEq<*const T> for Sp<T> {
    #[inline]
    fn eq(&self, other: &*const T) -> bool {
        Sp::addr(self) == *other as *const ()
    }
}

impl<T: RefCounted> Eq for Sp<T> {}

impl<T: RefCounted, U: RefCounted> PartialOrd<Sp<U>> for Sp<T> {
    fn partial_cmp(&self, other: &Sp<U>) -> Option<Ordering> {
        Some(Sp::addr(self).cmp(&Sp::addr(other)))
    }
}

impl<T: RefCounted, U: RefCounted> PartialOrd<Wp<U>> for Sp<T> {
    fn partial_cmp(&self, other: &Wp<U>) -> Option<Ordering> {
        Some(Sp::addr(self).cmp(&Wp::addr(other)))
    }
}

impl<T: RefCounted> PartialOrd<*const T> for Sp<T> {
    fn partial_cmp(&self, other: &*const T) -> Option<Ordering> {
        Some(Sp::addr(self).cmp(&(*other as *const ())))
    }
}

impl<T: RefCounted> Ord for Sp<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        Sp::addr(self).cmp(&Sp::addr(other))
    }
}

impl<T: RefCounted> Hash for Sp<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Sp::addr(self).hash(state)
    }
}

impl<T: RefCounted> fmt::Debug for Sp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sp({:p})", self.ptr)
    }
}

impl<T: RefCounted> fmt::Pointer for Sp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr, f)
    }
}

// Counting is atomic and RefCounted requires Send + Sync
unsafe impl<T: RefCounted> Send for Sp<T> {}
unsafe impl<T: RefCounted> Sync for Sp<T> {}

//! Weak handle

use super::Sp;
use crate::refs::{RefBlock, RefCounted};
use crate::tracking::{HolderId, ReferenceReport};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Non-owning reference to a managed object
///
/// Keeps the block alive, never the object (unless its policy says so).
/// The only way back to the object is `promote`.
pub struct Wp<T: RefCounted> {
    ptr: NonNull<T>,
    refs: NonNull<RefBlock>,
    holder: HolderId,
    _marker: PhantomData<T>,
}

impl<T: RefCounted> Wp<T> {
    /// Take a weak reference on a live object, creating its block if needed.
    ///
    /// # Safety
    /// `ptr` must point to a live boxed object that will not move.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        let holder = HolderId::next();
        let refs = crate::refs::acquire_weak(ptr, holder);
        Self::from_parts(ptr, refs, holder)
    }

    /// Take a weak reference only if one is still outstanding on the object.
    ///
    /// Meant for `Forever` objects, whose block stays around as long as the
    /// allocator keeps the object.
    ///
    /// # Safety
    /// `ptr` must point to a live boxed object.
    pub unsafe fn try_from_raw(ptr: NonNull<T>) -> Option<Self> {
        let refs = ptr.as_ref().ref_base().refs_ptr()?;
        let holder = HolderId::next();
        if refs.as_ref().attempt_inc_weak(holder) {
            Some(Self::from_parts(ptr, refs, holder))
        } else {
            None
        }
    }

    pub fn from_strong(strong: &Sp<T>) -> Self {
        let holder = HolderId::next();
        Sp::refs(strong).inc_weak(holder);
        Self::from_parts(Sp::raw(strong), Sp::refs_ptr(strong), holder)
    }

    #[inline]
    fn from_parts(ptr: NonNull<T>, refs: NonNull<RefBlock>, holder: HolderId) -> Self {
        Self {
            ptr,
            refs,
            holder,
            _marker: PhantomData,
        }
    }

    /// Try to obtain a strong handle; `None` once the referent is gone
    /// or it refused to be revived.
    pub fn promote(&self) -> Option<Sp<T>> {
        let holder = HolderId::next();
        // SAFETY: our weak reference keeps the block allocated
        if unsafe { RefBlock::attempt_inc_strong(self.refs, holder) } {
            Some(Sp::from_parts(self.ptr, self.refs, holder))
        } else {
            None
        }
    }

    #[inline]
    pub fn refs(&self) -> &RefBlock {
        // SAFETY: our weak reference keeps the block allocated
        unsafe { self.refs.as_ref() }
    }

    /// Raw object pointer; may dangle once the object was destroyed
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn holder(&self) -> HolderId {
        self.holder
    }

    pub fn strong_count(&self) -> i32 {
        self.refs().strong_count()
    }

    pub fn weak_count(&self) -> i32 {
        self.refs().weak_count()
    }

    /// Whether the object body was destroyed
    pub fn is_expired(&self) -> bool {
        !self.refs().is_object_alive()
    }

    pub fn print_refs(&self) -> ReferenceReport {
        self.refs().print_refs()
    }

    pub fn assign(&mut self, other: &Wp<T>) {
        *self = other.clone();
    }

    pub fn assign_strong(&mut self, other: &Sp<T>) {
        *self = Self::from_strong(other);
    }

    #[inline]
    pub(crate) fn addr(this: &Self) -> *const () {
        this.ptr.as_ptr() as *const ()
    }

    #[inline]
    fn key(&self) -> (*const (), *const RefBlock) {
        (Self::addr(self), self.refs.as_ptr() as *const RefBlock)
    }
}

impl<T: RefCounted> Clone for Wp<T> {
    fn clone(&self) -> Self {
        let holder = HolderId::next();
        self.refs().inc_weak(holder);
        Self::from_parts(self.ptr, self.refs, holder)
    }
}

impl<T: RefCounted> Drop for Wp<T> {
    fn drop(&mut self) {
        // SAFETY: this handle owns one weak reference for `holder`
        unsafe { RefBlock::dec_weak(self.refs, self.holder) };
    }
}

impl<T: RefCounted, U: RefCounted> PartialEq<Wp<U>> for Wp<T> {
    fn eq(&self, other: &Wp<U>) -> bool {
        self.key() == other.key()
    }
}

impl<T: RefCounted, U: RefCounted> PartialEq<Sp<U>> for Wp<T> {
    fn eq(&self, other: &Sp<U>) -> bool {
        Wp::addr(self) == Sp::addr(other)
    }
}

/// Address only: a stale handle still equals whatever now lives there
impl<T: RefCounted> PartialEq<*const T> for Wp<T> {
    fn eq(&self, other: &*const T) -> bool {
        Wp::addr(self) == *other as *const ()
    }
}

impl<T: RefCounted> Eq for Wp<T> {}

impl<T: RefCounted, U: RefCounted> PartialOrd<Wp<U>> for Wp<T> {
    fn partial_cmp(&self, other: &Wp<U>) -> Option<Ordering> {
        Some(self.key().cmp(&other.key()))
    }
}

impl<T: RefCounted, U: RefCounted> PartialOrd<Sp<U>> for Wp<T> {
    fn partial_cmp(&self, other: &Sp<U>) -> Option<Ordering> {
        Some(Wp::addr(self).cmp(&Sp::addr(other)))
    }
}

impl<T: RefCounted> PartialOrd<*const T> for Wp<T> {
    fn partial_cmp(&self, other: &*const T) -> Option<Ordering> {
        Some(Wp::addr(self).cmp(&(*other as *const ())))
    }
}

impl<T: RefCounted> Ord for Wp<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl<T: RefCounted> Hash for Wp<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}

impl<T: RefCounted> fmt::Debug for Wp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wp({:p})", self.ptr)
    }
}

impl<T: RefCounted> fmt::Pointer for Wp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr, f)
    }
}

unsafe impl<T: RefCounted> Send for Wp<T> {}
unsafe impl<T: RefCounted> Sync for Wp<T> {}

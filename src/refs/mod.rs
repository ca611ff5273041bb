//! Intrusive strong/weak reference counting
//!
//! A managed type embeds a `RefBase` and implements `RefCounted`. The first
//! acquisition lazily creates a `RefBlock` holding the counters; handles
//! (`Sp`, `Wp`) drive the counts through it.
//!
//! Lifetime policies:
//! - `StrongOnly`: destroyed on the last strong release
//! - `WeakExtendsLife`: destroyed on the last weak release
//! - `Forever`: never destroyed by the engine

mod base;
mod block;
mod policy;


pub use base::RefBase;
pub use block::RefBlock;
pub use policy::{AttemptFlags, LifetimePolicy};

pub(crate) use block::ErasedDestroyer;

use crate::errors::{fatal, LifetimeViolation, RefError};
use crate::handle::{Sp, Wp};
use crate::tracking::HolderId;
use std::ptr::NonNull;
use std::sync::Arc;

/// Types whose lifetime is managed by a `RefBase`
///
/// Every hook has a default; override only what the type needs. Hooks run
/// on whichever thread performs the transition and must not block.
///
/// # Safety
/// `ref_base` must always return the same `RefBase`, embedded in `self`.
/// Managed objects must be heap-allocated through `Box` (the engine drops
/// them as `Box<Self>` unless a destroyer is installed) and must not move
/// once a reference was taken.
pub unsafe trait RefCounted: Send + Sync + 'static {
    fn ref_base(&self) -> &RefBase;

    /// First strong acquisition; the strong count is already 1
    fn on_first_ref(&self) {}

    /// Strong count went 1 -> 0
    fn on_last_strong_ref(&self, _holder: HolderId) {}

    /// Asked before reviving a released (or never acquired) strong count of
    /// an object whose policy extends its life. Return `false` to veto.
    fn on_inc_strong_attempted(&self, flags: AttemptFlags, _holder: HolderId) -> bool {
        flags.contains(AttemptFlags::FIRST_INC_STRONG)
    }

    /// Weak count went 1 -> 0 under `WeakExtendsLife` or `Forever`
    fn on_last_weak_ref(&self, _holder: HolderId) {}

    /// Replace default destruction (dropping the box) with `destroyer`.
    ///
    /// Must happen before the object is shared. The destroyer must not
    /// acquire or release references on the object it receives.
    fn install_destroyer<D>(&mut self, destroyer: D) -> Result<(), RefError>
    where
        Self: Sized,
        D: Destroyer<Self>,
    {
        let erased: Arc<ErasedDestroyer> = Arc::new(move |raw: *mut ()| {
            // SAFETY: the block hands over the owner exactly once, with
            // ownership of its box
            let object = unsafe { Box::from_raw(raw.cast::<Self>()) };
            destroyer.destroy(object);
        });
        self.ref_base().install_destroyer(erased)
    }
}

/// Custom finalization for managed objects (e.g. return to a pool)
pub trait Destroyer<T>: Send + Sync + 'static {
    fn destroy(&self, object: Box<T>);
}

impl<T, F> Destroyer<T> for F
where
    F: Fn(Box<T>) + Send + Sync + 'static,
{
    fn destroy(&self, object: Box<T>) {
        self(object)
    }
}

/// Take a strong reference on `object`.
///
/// # Safety
/// `object` must be a live, boxed managed object. Under `StrongOnly` its
/// strong count must not already have been released to zero.
pub unsafe fn acquire_strong<T: RefCounted>(object: NonNull<T>, holder: HolderId) {
    let refs = object.as_ref().ref_base().create_refs(object);
    refs.as_ref().inc_strong(holder);
}

/// Release a strong reference taken with `acquire_strong`.
///
/// # Safety
/// `holder` must own a strong reference on `object`. The object may be
/// destroyed before this returns.
pub unsafe fn release_strong<T: RefCounted>(object: NonNull<T>, holder: HolderId) {
    match object.as_ref().ref_base().refs_ptr() {
        Some(refs) => RefBlock::dec_strong(refs, holder),
        None => fatal(
            LifetimeViolation::StrongUnderflow { previous: 0 },
            object.as_ptr() as *const (),
        ),
    }
}

/// Take a weak reference on `object`, returning its block.
///
/// # Safety
/// `object` must be a live, boxed managed object.
pub unsafe fn acquire_weak<T: RefCounted>(object: NonNull<T>, holder: HolderId) -> NonNull<RefBlock> {
    let refs = object.as_ref().ref_base().create_refs(object);
    refs.as_ref().inc_weak(holder);
    refs
}

/// Release a weak reference returned by `acquire_weak`.
///
/// # Safety
/// `holder` must own a weak reference on `refs`. The block may be freed
/// before this returns.
pub unsafe fn release_weak(refs: NonNull<RefBlock>, holder: HolderId) {
    RefBlock::dec_weak(refs, holder);
}

/// Promote a weak handle; `None` when the referent is no longer live
pub fn try_promote<T: RefCounted>(weak: &Wp<T>) -> Option<Sp<T>> {
    weak.promote()
}

/// Privileged strong acquisition for the publisher of a fresh object
pub(crate) unsafe fn force_acquire_strong<T: RefCounted>(
    object: NonNull<T>,
    holder: HolderId,
) -> NonNull<RefBlock> {
    let refs = object.as_ref().ref_base().create_refs(object);
    refs.as_ref().force_inc_strong(holder);
    refs
}

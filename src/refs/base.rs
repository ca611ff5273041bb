//! RefBase - the part of a managed object that owns its reference block

use super::block::{ErasedDestroyer, RefBlock};
use super::{LifetimePolicy, RefCounted};
use crate::errors::RefError;
use once_cell::sync::OnceCell;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Embedded in every `RefCounted` type.
///
/// The block is created on the first strong or weak acquisition, once the
/// object sits at its final heap address, and published with a single
/// compare-and-swap so racing first acquisitions agree on one block.
pub struct RefBase {
    refs: AtomicPtr<RefBlock>,
    policy: LifetimePolicy,
    destroyer: OnceCell<Arc<ErasedDestroyer>>,
}

impl RefBase {
    pub const fn new() -> Self {
        Self::with_policy(LifetimePolicy::StrongOnly)
    }

    pub const fn with_policy(policy: LifetimePolicy) -> Self {
        Self {
            refs: AtomicPtr::new(ptr::null_mut()),
            policy,
            destroyer: OnceCell::new(),
        }
    }

    #[inline]
    pub fn policy(&self) -> LifetimePolicy {
        self.policy
    }

    /// Change the lifetime policy. Only possible before any reference was
    /// taken; the block copies the policy when it is created.
    pub fn set_lifetime_policy(&mut self, policy: LifetimePolicy) -> Result<(), RefError> {
        if !self.refs.get_mut().is_null() {
            return Err(RefError::PolicyFrozen {
                current: self.policy,
                requested: policy,
            });
        }
        self.policy = policy;
        Ok(())
    }

    /// Whether a reference block exists (the object may be shared)
    #[inline]
    pub fn is_shared(&self) -> bool {
        !self.refs.load(Ordering::Acquire).is_null()
    }

    /// The reference block, if any acquisition happened yet
    pub fn weak_refs(&self) -> Option<&RefBlock> {
        // SAFETY: a published block outlives the object it is attached to
        self.refs_ptr().map(|refs| unsafe { &*refs.as_ptr() })
    }

    #[inline]
    pub(crate) fn refs_ptr(&self) -> Option<NonNull<RefBlock>> {
        NonNull::new(self.refs.load(Ordering::Acquire))
    }

    pub(crate) fn install_destroyer(&self, destroyer: Arc<ErasedDestroyer>) -> Result<(), RefError> {
        if self.is_shared() {
            return Err(RefError::AlreadyShared);
        }
        self.destroyer
            .set(destroyer)
            .map_err(|_| RefError::DestroyerAlreadyInstalled)
    }

    pub fn has_destroyer(&self) -> bool {
        self.destroyer.get().is_some()
    }

    /// Return the block, creating and publishing it on first use.
    ///
    /// # Safety
    /// `owner` must be the object embedding this `RefBase`, at its final
    /// address, with provenance valid for dropping it as a `Box<T>`.
    pub(crate) unsafe fn create_refs<T: RefCounted>(&self, owner: NonNull<T>) -> NonNull<RefBlock> {
        if let Some(refs) = self.refs_ptr() {
            return refs;
        }

        let candidate = Box::into_raw(Box::new(RefBlock::new(
            owner,
            self.policy,
            self.destroyer.get().cloned(),
        )));

        match self.refs.compare_exchange(
            ptr::null_mut(),
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                trace!(
                    event = "refs_create",
                    address = ?owner.as_ptr(),
                    refs = ?candidate,
                    policy = %self.policy
                );
                NonNull::new_unchecked(candidate)
            }
            Err(winner) => {
                // Lost the publish race; the candidate was never visible
                drop(Box::from_raw(candidate));
                NonNull::new_unchecked(winner)
            }
        }
    }

    /// Forget the block; called by the engine right before destruction
    #[inline]
    pub(crate) fn detach(&self) {
        self.refs.store(ptr::null_mut(), Ordering::Release);
    }
}

impl Default for RefBase {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RefBase {
    fn drop(&mut self) {
        // Null when the engine destroyed us or nobody ever referenced us
        if let Some(refs) = NonNull::new(*self.refs.get_mut()) {
            unsafe { RefBlock::release_owner(refs) };
        }
    }
}

impl fmt::Debug for RefBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefBase")
            .field("policy", &self.policy)
            .field("refs", &self.weak_refs())
            .field("destroyer", &self.has_destroyer())
            .finish()
    }
}

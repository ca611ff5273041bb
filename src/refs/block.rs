//! Reference block - the separately allocated counters behind a managed object
//!
//! Design: the block may outlive the object body (a weak handle keeps it
//! alive to answer "is the object still there?"), so the counts live here
//! and the object only keeps a pointer to it.
//!
//! Counting rules:
//! - every strong reference also holds one weak reference
//! - the strong counter starts at `INITIAL_STRONG_VALUE` until the first
//!   strong acquisition, which distinguishes "never acquired" from
//!   "released"
//! - the attached owner holds one weak reference of its own, released
//!   when the object is destroyed or dropped by its allocator
//! - whoever takes the weak count from 1 to 0 frees the block; no other
//!   path frees it

use super::{AttemptFlags, LifetimePolicy, RefCounted};
use crate::errors::{fatal, LifetimeViolation, RefError};
use crate::logging::{log_object_destroyed, log_promotion_denied, log_refs_freed};
use crate::tracking::{
    self, HolderId, RefKind, RefOp, RefTracer, ReferenceReport, ReferenceTracker, TrackingMode,
};
use once_cell::sync::OnceCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicI32, AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Strong counter value before the first strong acquisition
pub(crate) const INITIAL_STRONG_VALUE: i32 = 1 << 28;

/// Weak reference held by the attached owner itself
const OWNER_WEAK: i32 = 1;

/// Type-erased teardown: receives the owner pointer, takes ownership of it
pub(crate) type ErasedDestroyer = dyn Fn(*mut ()) + Send + Sync;

type RecoverFn = unsafe fn(*mut ()) -> *mut dyn RefCounted;

unsafe fn recover_owner<T: RefCounted>(raw: *mut ()) -> *mut dyn RefCounted {
    raw.cast::<T>() as *mut dyn RefCounted
}

#[inline(always)]
fn logical(count: i32) -> i32 {
    if count >= INITIAL_STRONG_VALUE {
        count - INITIAL_STRONG_VALUE
    } else {
        count
    }
}

pub struct RefBlock {
    strong: AtomicI32,
    weak: AtomicI32,
    policy: LifetimePolicy,
    /// Owner back-pointer, null once the object is destroyed
    owner: AtomicPtr<()>,
    recover: RecoverFn,
    destroyer: Option<Arc<ErasedDestroyer>>,
    tracer: OnceCell<Box<dyn RefTracer>>,
}

impl RefBlock {
    pub(crate) fn new<T: RefCounted>(
        owner: NonNull<T>,
        policy: LifetimePolicy,
        destroyer: Option<Arc<ErasedDestroyer>>,
    ) -> Self {
        let block = Self {
            strong: AtomicI32::new(INITIAL_STRONG_VALUE),
            weak: AtomicI32::new(OWNER_WEAK),
            policy,
            owner: AtomicPtr::new(owner.as_ptr().cast()),
            recover: recover_owner::<T>,
            destroyer,
            tracer: OnceCell::new(),
        };

        if let Some(mode) = tracking::auto_track_mode() {
            // Not yet published: nobody else can have set it
            let _ = block.tracer.set(Box::new(ReferenceTracker::new(mode)));
        }

        block
    }

    #[inline]
    fn addr(&self) -> *const () {
        self as *const Self as *const ()
    }

    #[inline]
    pub fn policy(&self) -> LifetimePolicy {
        self.policy
    }

    /// DEBUGGING ONLY: current strong count (0 if never acquired)
    #[inline]
    pub fn strong_count(&self) -> i32 {
        logical(self.strong.load(Ordering::Relaxed))
    }

    /// DEBUGGING ONLY: current weak count, including the weak half of
    /// every strong reference but not the owner's own
    #[inline]
    pub fn weak_count(&self) -> i32 {
        // Owner first: it detaches before giving up its weak reference
        let own = self.owner_weak();
        (self.weak.load(Ordering::Relaxed) - own).max(0)
    }

    #[inline]
    fn owner_weak(&self) -> i32 {
        if self.is_object_alive() {
            OWNER_WEAK
        } else {
            0
        }
    }

    /// Whether a strong reference was ever taken on the object
    #[inline]
    pub fn has_been_acquired(&self) -> bool {
        self.strong.load(Ordering::Relaxed) != INITIAL_STRONG_VALUE
    }

    /// Whether the object body still exists
    #[inline]
    pub fn is_object_alive(&self) -> bool {
        !self.owner.load(Ordering::Acquire).is_null()
    }

    /// Address of the owning object, null once destroyed
    pub fn object_address(&self) -> *const () {
        self.owner.load(Ordering::Acquire)
    }

    /// # Safety
    /// The returned reference must not be held across anything that may
    /// destroy the owner.
    #[inline]
    unsafe fn owner<'a>(&self) -> Option<&'a dyn RefCounted> {
        let raw = self.owner.load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            Some(&*(self.recover)(raw))
        }
    }

    #[inline]
    fn record(&self, kind: RefKind, op: RefOp, holder: HolderId, count: i32) {
        if let Some(tracer) = self.tracer.get() {
            tracer.record(kind, op, holder, count);
        }
    }

    // ------------------------------------------------------------------
    // Weak side
    // ------------------------------------------------------------------

    pub fn inc_weak(&self, holder: HolderId) {
        let prev = self.weak.fetch_add(1, Ordering::Relaxed);
        if prev < 0 {
            fatal(LifetimeViolation::WeakUnderflow { previous: prev }, self.addr());
        }
        self.record(RefKind::Weak, RefOp::Acquire, holder, prev + 1 - self.owner_weak());
    }

    /// Release one weak reference; the last one may destroy the object
    /// (policy permitting) and frees the block.
    ///
    /// # Safety
    /// `this` must point to a live block on which `holder` owns a weak
    /// reference. The block may be freed before this returns.
    pub unsafe fn dec_weak(this: NonNull<Self>, holder: HolderId) {
        let block = this.as_ref();

        // Recorded first: once the count drops another thread may free us
        block.record(RefKind::Weak, RefOp::Release, holder, block.weak_count() - 1);

        Self::drop_weak(this, holder);
    }

    /// Counting half of `dec_weak`, also used for the owner's own reference
    unsafe fn drop_weak(this: NonNull<Self>, holder: HolderId) {
        let block = this.as_ref();

        let prev = block.weak.fetch_sub(1, Ordering::Release);
        if prev <= 0 {
            fatal(LifetimeViolation::WeakUnderflow { previous: prev }, block.addr());
        }

        match prev {
            1 => {
                // Synchronize with every earlier release before freeing
                fence(Ordering::Acquire);
                if block.is_object_alive() {
                    // Someone released the owner's reference for it
                    fatal(LifetimeViolation::WeakUnderflow { previous: 0 }, block.addr());
                }
                Self::free(this);
            }
            2 => {
                fence(Ordering::Acquire);
                Self::last_weak_released(this, holder);
            }
            _ => {}
        }
    }

    /// Two weak references were left: the caller's and, if still attached,
    /// the owner's.
    unsafe fn last_weak_released(this: NonNull<Self>, holder: HolderId) {
        let block = this.as_ref();
        let owner = match block.owner() {
            Some(owner) => owner,
            None => return,
        };

        match block.policy {
            LifetimePolicy::StrongOnly => {
                // Only ever weakly referenced: no strong release will destroy it
                if !block.has_been_acquired() {
                    Self::destroy_owner(this, holder);
                }
            }
            LifetimePolicy::WeakExtendsLife => {
                owner.on_last_weak_ref(holder);
                Self::destroy_owner(this, holder);
            }
            // The allocator's drop of the object releases the last reference
            LifetimePolicy::Forever => owner.on_last_weak_ref(holder),
        }
    }

    /// Take a weak reference only if one is still outstanding.
    ///
    /// Only meaningful for `Forever` objects, whose block cannot be freed
    /// behind the caller's back while the object lives.
    ///
    /// # Safety
    /// The block must still be allocated.
    pub unsafe fn attempt_inc_weak(&self, holder: HolderId) -> bool {
        if self.policy != LifetimePolicy::Forever {
            debug!(
                refs = ?self.addr(),
                policy = %self.policy,
                "attempt_inc_weak on an object without Forever lifetime"
            );
        }

        let floor = self.owner_weak();
        let mut current = self.weak.load(Ordering::Relaxed);
        while current > floor {
            match self.weak.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.record(RefKind::Weak, RefOp::Acquire, holder, current + 1 - floor);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }

        if current < 0 {
            fatal(LifetimeViolation::WeakUnderflow { previous: current }, self.addr());
        }
        false
    }

    // ------------------------------------------------------------------
    // Strong side
    // ------------------------------------------------------------------

    pub(crate) fn inc_strong(&self, holder: HolderId) {
        self.inc_weak(holder);

        let prev = self.strong.fetch_add(1, Ordering::Relaxed);
        if prev < 0 || (prev == 0 && !self.policy.extends_life()) {
            fatal(LifetimeViolation::StrongAfterLastRelease, self.addr());
        }
        self.record(RefKind::Strong, RefOp::Acquire, holder, logical(prev + 1));

        if prev != INITIAL_STRONG_VALUE {
            return;
        }

        self.strong.fetch_sub(INITIAL_STRONG_VALUE, Ordering::Relaxed);
        // SAFETY: we hold a strong reference, the owner cannot be destroyed
        if let Some(owner) = unsafe { self.owner() } {
            owner.on_first_ref();
        }
    }

    /// Unconditional strong increment for the publisher of a new object.
    ///
    /// Unlike `inc_strong`, a released-to-zero count under an extending
    /// policy counts as a fresh first reference.
    pub(crate) fn force_inc_strong(&self, holder: HolderId) {
        self.inc_weak(holder);

        let prev = self.strong.fetch_add(1, Ordering::Relaxed);
        if prev < 0 || (prev == 0 && !self.policy.extends_life()) {
            fatal(LifetimeViolation::StrongAfterLastRelease, self.addr());
        }
        self.record(RefKind::Strong, RefOp::Acquire, holder, logical(prev + 1));

        let first = match prev {
            INITIAL_STRONG_VALUE => {
                self.strong.fetch_sub(INITIAL_STRONG_VALUE, Ordering::Relaxed);
                true
            }
            0 => true,
            _ => false,
        };

        if first {
            // SAFETY: we hold a strong reference
            if let Some(owner) = unsafe { self.owner() } {
                owner.on_first_ref();
            }
        }
    }

    /// Release one strong reference (and its weak half).
    ///
    /// # Safety
    /// `holder` must own a strong reference on this block. The object and
    /// the block may both be freed before this returns.
    pub(crate) unsafe fn dec_strong(this: NonNull<Self>, holder: HolderId) {
        let block = this.as_ref();

        block.record(RefKind::Strong, RefOp::Release, holder, block.strong_count() - 1);

        let prev = block.strong.fetch_sub(1, Ordering::Release);
        if prev <= 0 || prev == INITIAL_STRONG_VALUE {
            fatal(LifetimeViolation::StrongUnderflow { previous: prev }, block.addr());
        }

        if prev == 1 {
            fence(Ordering::Acquire);

            let destroy = match block.owner() {
                Some(owner) => {
                    owner.on_last_strong_ref(holder);
                    block.policy == LifetimePolicy::StrongOnly
                }
                None => false,
            };
            if destroy {
                Self::destroy_owner(this, holder);
            }
        }

        Self::dec_weak(this, holder);
    }

    /// Try to turn a weak reference into a strong one.
    ///
    /// Never increments a STRONG_ONLY count that already reached zero. A
    /// never-acquired or released count under an extending policy is only
    /// revived if the owner agrees through `on_inc_strong_attempted`.
    ///
    /// # Safety
    /// `holder`'s caller must own a weak reference on this block.
    pub(crate) unsafe fn attempt_inc_strong(this: NonNull<Self>, holder: HolderId) -> bool {
        let block = this.as_ref();
        block.inc_weak(holder);

        let mut current = block.strong.load(Ordering::Relaxed);
        // Count value the owner (or the policy) already approved reviving from
        let mut approved: Option<i32> = None;
        let mut owner_consulted = false;

        loop {
            if current > 0 && current != INITIAL_STRONG_VALUE {
                match block.strong.compare_exchange_weak(
                    current,
                    current + 1,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => {
                        current = actual;
                        continue;
                    }
                }
            }

            if approved != Some(current) {
                let allowed = if current == INITIAL_STRONG_VALUE {
                    block.is_object_alive()
                        && (!block.policy.extends_life() || {
                            owner_consulted = true;
                            block.owner_allows(holder)
                        })
                } else {
                    block.policy.extends_life() && {
                        owner_consulted = true;
                        block.owner_allows(holder)
                    }
                };

                if !allowed {
                    log_promotion_denied(block.addr(), block.policy, current == INITIAL_STRONG_VALUE);
                    Self::dec_weak(this, holder);
                    return false;
                }
                approved = Some(current);
            }

            let target = if current == INITIAL_STRONG_VALUE { 1 } else { current + 1 };
            match block.strong.compare_exchange(current, target, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => {
                    block.record(RefKind::Strong, RefOp::Acquire, holder, target);
                    if current == INITIAL_STRONG_VALUE {
                        if let Some(owner) = block.owner() {
                            owner.on_first_ref();
                        }
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }

        if owner_consulted {
            // The owner granted a revival that a concurrent promoter already
            // performed; let it drop whatever it reserved for us.
            if let Some(owner) = block.owner() {
                owner.on_last_strong_ref(holder);
            }
        }

        block.record(RefKind::Strong, RefOp::Acquire, holder, logical(current + 1));
        true
    }

    unsafe fn owner_allows(&self, holder: HolderId) -> bool {
        match self.owner() {
            Some(owner) => owner.on_inc_strong_attempted(AttemptFlags::FIRST_INC_STRONG, holder),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Detach the owner from this block, run its finalizer and give up
    /// the owner's weak reference. The block may be freed on return.
    unsafe fn destroy_owner(this: NonNull<Self>, holder: HolderId) {
        let block = this.as_ref();
        let raw = block.owner.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            fatal(LifetimeViolation::DoubleDestroy, block.addr());
        }

        let object = (block.recover)(raw);
        (*object).ref_base().detach();

        log_object_destroyed(raw, block.addr(), block.policy, block.destroyer.is_some());

        match &block.destroyer {
            Some(destroyer) => destroyer.as_ref()(raw),
            None => drop(Box::from_raw(object)),
        }

        Self::drop_weak(this, holder);
    }

    /// The owner is being dropped outside the engine (allocator teardown of
    /// a `Forever` object, or an object nobody ever held on to).
    pub(crate) unsafe fn release_owner(this: NonNull<Self>) {
        let block = this.as_ref();
        let strong = block.strong_count();
        let weak = block.weak_count();

        if strong > 0 {
            warn!(
                refs = ?block.addr(),
                strong,
                weak,
                "Object dropped while strong references are outstanding"
            );
        } else if weak > 0 {
            debug!(
                refs = ?block.addr(),
                weak,
                "Object dropped with outstanding weak references; block freed by the last one"
            );
        }

        block.owner.store(ptr::null_mut(), Ordering::Release);
        Self::drop_weak(this, HolderId::ANONYMOUS);
    }

    unsafe fn free(this: NonNull<Self>) {
        log_refs_freed(this.as_ptr() as *const ());
        drop(Box::from_raw(this.as_ptr()));
    }

    // ------------------------------------------------------------------
    // Debugging
    // ------------------------------------------------------------------

    /// DEBUGGING ONLY: enable or disable acquire/release tracking.
    ///
    /// With `retain` every operation is kept; without it matched
    /// acquire/release pairs cancel and only outstanding holders remain.
    pub fn track_me(&self, enable: bool, retain: bool) {
        let mode = TrackingMode::from_retain(retain);
        if enable {
            tracking::enable_holder_ids();
        }
        let tracer = self
            .tracer
            .get_or_init(|| Box::new(ReferenceTracker::new(mode)) as Box<dyn RefTracer>);
        tracer.set_tracking(enable, mode);
    }

    pub fn install_tracer(&self, tracer: Box<dyn RefTracer>) -> Result<(), RefError> {
        self.tracer
            .set(tracer)
            .map_err(|_| RefError::TracerAlreadyInstalled)
    }

    /// DEBUGGING ONLY: log and return the references held on the object
    pub fn print_refs(&self) -> ReferenceReport {
        let tracer = self.tracer.get();
        let report = ReferenceReport {
            object: self.object_address() as usize,
            refs: self.addr() as usize,
            strong: self.strong_count(),
            weak: self.weak_count(),
            policy: self.policy,
            mode: tracer.and_then(|t| t.mode()),
            entries: tracer.map(|t| t.entries()).unwrap_or_default(),
        };

        info!("{}", report);
        report
    }
}

impl std::fmt::Debug for RefBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefBlock")
            .field("strong", &self.strong_count())
            .field("weak", &self.weak_count())
            .field("policy", &self.policy)
            .field("owner", &self.object_address())
            .finish()
    }
}

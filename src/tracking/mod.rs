//! Reference tracking - debug instrumentation for acquire/release pairs
//!
//! Every counting operation carries a `HolderId` naming the handle that
//! performed it. Blocks record those operations through a `RefTracer` only
//! when one is installed, so untracked objects pay a single atomic load.
//!
//! Two recording modes (see `ReferenceTracker`):
//! - retain history: every acquire and release is kept in order
//! - outstanding only: matched acquire/release pairs cancel, leaving the
//!   holders that still own a reference

mod report;
mod tracker;

pub use report::{RefEvent, ReferenceReport};
pub use tracker::ReferenceTracker;

use crate::config::TrackingConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Process-wide tracking switches (set once from config, read on hot paths)
static TRACKING: Lazy<TrackingState> = Lazy::new(TrackingState::new);

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

struct TrackingState {
    track_all: AtomicBool,
    retain: AtomicBool,
    holder_ids: AtomicBool,
}

impl TrackingState {
    fn new() -> Self {
        Self {
            track_all: AtomicBool::new(false),
            retain: AtomicBool::new(false),
            holder_ids: AtomicBool::new(false),
        }
    }
}

/// Apply tracking configuration process-wide
pub fn configure(config: &TrackingConfig) {
    TRACKING.track_all.store(config.track_all, Ordering::Relaxed);
    TRACKING.retain.store(config.retain, Ordering::Relaxed);
    TRACKING
        .holder_ids
        .store(config.holder_ids || config.track_all, Ordering::Relaxed);

    debug!(
        track_all = config.track_all,
        retain = config.retain,
        holder_ids = config.holder_ids,
        "Reference tracking configured"
    );
}

/// Mode new blocks start tracking in, if every object is tracked
#[inline]
pub(crate) fn auto_track_mode() -> Option<TrackingMode> {
    if TRACKING.track_all.load(Ordering::Relaxed) {
        Some(TrackingMode::from_retain(TRACKING.retain.load(Ordering::Relaxed)))
    } else {
        None
    }
}

/// Start handing out distinct holder ids to new handles
pub fn enable_holder_ids() {
    TRACKING.holder_ids.store(true, Ordering::Relaxed);
}

#[inline]
pub fn holder_ids_enabled() -> bool {
    TRACKING.holder_ids.load(Ordering::Relaxed)
}

/// Identity of whoever holds a reference
///
/// Handles draw a fresh id when holder ids are enabled and share
/// `HolderId::ANONYMOUS` otherwise, so production code never touches the
/// global id counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HolderId(u64);

impl HolderId {
    pub const ANONYMOUS: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Id derived from an address, for holders that are not handles
    pub fn of<T: ?Sized>(holder: *const T) -> Self {
        Self(holder as *const () as usize as u64)
    }

    #[inline]
    pub fn next() -> Self {
        if holder_ids_enabled() {
            Self(NEXT_HOLDER.fetch_add(1, Ordering::Relaxed))
        } else {
            Self::ANONYMOUS
        }
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_anonymous(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anonymous() {
            f.write_str("#anon")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Strong,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefOp {
    Acquire,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Keep every acquire and release in order
    RetainHistory,
    /// Cancel matched pairs; keep only outstanding holders
    OutstandingOnly,
}

impl TrackingMode {
    pub const fn from_retain(retain: bool) -> Self {
        if retain {
            Self::RetainHistory
        } else {
            Self::OutstandingOnly
        }
    }
}

/// Pluggable instrumentation called on every counting operation of a block
///
/// `count` is the logical count of `kind` after the operation.
pub trait RefTracer: Send + Sync {
    fn record(&self, kind: RefKind, op: RefOp, holder: HolderId, count: i32);

    /// Enable/disable recording and switch modes (`track_me`)
    fn set_tracking(&self, _enabled: bool, _mode: TrackingMode) {}

    fn mode(&self) -> Option<TrackingMode> {
        None
    }

    /// Recorded entries, in the tracer's own ordering
    fn entries(&self) -> Vec<RefEvent> {
        Vec::new()
    }
}

/// Tracer that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl RefTracer for NoopTracer {
    #[inline(always)]
    fn record(&self, _kind: RefKind, _op: RefOp, _holder: HolderId, _count: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holder_id_display() {
        assert_eq!(HolderId::ANONYMOUS.to_string(), "#anon");
        assert_eq!(HolderId::new(7).to_string(), "#7");
        assert!(HolderId::ANONYMOUS.is_anonymous());
    }

    #[test]
    fn test_holder_ids_distinct_once_enabled() {
        enable_holder_ids();
        let a = HolderId::next();
        let b = HolderId::next();
        assert_ne!(a, b);
        assert!(!a.is_anonymous());
    }

    #[test]
    fn test_mode_from_retain() {
        assert_eq!(TrackingMode::from_retain(true), TrackingMode::RetainHistory);
        assert_eq!(TrackingMode::from_retain(false), TrackingMode::OutstandingOnly);
    }

    #[test]
    fn test_noop_tracer_has_no_entries() {
        let tracer = NoopTracer;
        tracer.record(RefKind::Strong, RefOp::Acquire, HolderId::new(1), 1);
        assert!(tracer.entries().is_empty());
        assert_eq!(tracer.mode(), None);
    }
}

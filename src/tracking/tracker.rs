//! Recording tracer used by `track_me`

use super::{HolderId, RefEvent, RefKind, RefOp, RefTracer, TrackingMode};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

/// Per-object acquire/release recorder
///
/// Retain mode appends to an ordered history (with a backtrace when
/// `RUST_BACKTRACE` enables capture). Outstanding mode keeps a concurrent
/// map of holder -> unmatched acquisitions.
pub struct ReferenceTracker {
    enabled: AtomicBool,
    retain: AtomicBool,
    sequence: AtomicU64,
    history: Mutex<Vec<RefEvent>>,
    outstanding: DashMap<(RefKind, HolderId), u32>,
}

impl ReferenceTracker {
    pub fn new(mode: TrackingMode) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            retain: AtomicBool::new(mode == TrackingMode::RetainHistory),
            sequence: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
            outstanding: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn current_mode(&self) -> TrackingMode {
        TrackingMode::from_retain(self.retain.load(Ordering::Relaxed))
    }

    fn add_outstanding(&self, kind: RefKind, holder: HolderId) {
        *self.outstanding.entry((kind, holder)).or_insert(0) += 1;
    }

    fn remove_outstanding(&self, kind: RefKind, holder: HolderId) {
        let key = (kind, holder);
        let found = match self.outstanding.get_mut(&key) {
            Some(mut pending) => {
                *pending -= 1;
                true
            }
            None => false,
        };

        if found {
            self.outstanding.remove_if(&key, |_, pending| *pending == 0);
        } else {
            warn!(
                kind = ?kind,
                holder = %holder,
                "Released reference that was never recorded as acquired"
            );
        }
    }
}

impl RefTracer for ReferenceTracker {
    fn record(&self, kind: RefKind, op: RefOp, holder: HolderId, count: i32) {
        if !self.is_enabled() {
            return;
        }

        match self.current_mode() {
            TrackingMode::RetainHistory => {
                let backtrace = Backtrace::capture();
                let backtrace = match backtrace.status() {
                    BacktraceStatus::Captured => Some(backtrace.to_string()),
                    _ => None,
                };
                let event = RefEvent {
                    sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                    kind,
                    op,
                    holder,
                    count,
                    backtrace,
                };
                self.history.lock().push(event);
            }
            TrackingMode::OutstandingOnly => match op {
                RefOp::Acquire => self.add_outstanding(kind, holder),
                RefOp::Release => self.remove_outstanding(kind, holder),
            },
        }
    }

    fn set_tracking(&self, enabled: bool, mode: TrackingMode) {
        self.retain
            .store(mode == TrackingMode::RetainHistory, Ordering::Relaxed);
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn mode(&self) -> Option<TrackingMode> {
        Some(self.current_mode())
    }

    fn entries(&self) -> Vec<RefEvent> {
        match self.current_mode() {
            TrackingMode::RetainHistory => self.history.lock().clone(),
            TrackingMode::OutstandingOnly => {
                let mut entries: Vec<RefEvent> = self
                    .outstanding
                    .iter()
                    .map(|entry| {
                        let (kind, holder) = *entry.key();
                        RefEvent {
                            sequence: 0,
                            kind,
                            op: RefOp::Acquire,
                            holder,
                            count: *entry.value() as i32,
                            backtrace: None,
                        }
                    })
                    .collect();
                entries.sort_by_key(|e| (e.kind, e.holder));
                entries
            }
        }
    }
}

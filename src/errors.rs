//! Error types for the reference counting engine
//!
//! Two families:
//! - `RefError`: recoverable misuse reported through `Result` (configuring an
//!   object after it was shared, installing a hook twice, bad config input)
//! - `LifetimeViolation`: broken counting invariants. Memory safety can no
//!   longer be guaranteed once one is observed, so `fatal` logs and aborts.

use crate::refs::LifetimePolicy;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefError {
    PolicyFrozen { current: LifetimePolicy, requested: LifetimePolicy },
    AlreadyShared,
    DestroyerAlreadyInstalled,
    TracerAlreadyInstalled,
    Config { message: String },
}

impl fmt::Display for RefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyFrozen { current, requested } => {
                write!(
                    f,
                    "Lifetime policy is frozen at {} once references exist (requested {})",
                    current, requested
                )
            }
            Self::AlreadyShared => {
                write!(f, "Object already has a reference block and may be shared")
            }
            Self::DestroyerAlreadyInstalled => {
                write!(f, "A destroyer is already installed on this object")
            }
            Self::TracerAlreadyInstalled => {
                write!(f, "A reference tracer is already installed on this block")
            }
            Self::Config { message } => {
                write!(f, "Invalid configuration: {}", message)
            }
        }
    }
}

impl std::error::Error for RefError {}

impl RefError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }
}

/// Fatal counting invariant violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeViolation {
    /// `dec_strong` observed a count at or below zero (or never acquired)
    StrongUnderflow { previous: i32 },
    /// `dec_weak` observed a count at or below zero
    WeakUnderflow { previous: i32 },
    /// Strong increment on a STRONG_ONLY object whose strong side is gone
    StrongAfterLastRelease,
    /// Destruction requested for an object that was already torn down
    DoubleDestroy,
}

impl fmt::Display for LifetimeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StrongUnderflow { previous } => {
                write!(f, "dec_strong called too many times (previous count {})", previous)
            }
            Self::WeakUnderflow { previous } => {
                write!(f, "dec_weak called too many times (previous count {})", previous)
            }
            Self::StrongAfterLastRelease => {
                write!(f, "inc_strong called after the last strong reference was released")
            }
            Self::DoubleDestroy => {
                write!(f, "object destroyed more than once")
            }
        }
    }
}

/// Report a lifetime violation and abort the process.
///
/// Never returns: continuing after a counter underflow would free live
/// memory or touch freed memory.
#[cold]
#[inline(never)]
pub(crate) fn fatal(violation: LifetimeViolation, refs: *const ()) -> ! {
    tracing::error!(
        event = "lifetime_violation",
        refs = ?refs,
        violation = %violation,
        "Reference counting invariant violated, aborting"
    );
    std::process::abort()
}

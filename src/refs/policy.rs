//! Lifetime policies and hook flags

use serde::{Deserialize, Serialize};
use std::fmt;

/// Decides whether outstanding weak references keep an object alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifetimePolicy {
    /// Destroyed when the strong count drops to zero
    #[default]
    StrongOnly,
    /// Destroyed when both strong and weak counts are zero
    WeakExtendsLife,
    /// Never destroyed by the engine; the allocator frees it
    Forever,
}

impl LifetimePolicy {
    /// Whether the object body outlives its last strong reference.
    ///
    /// True for both `WeakExtendsLife` and `Forever`: in either case a weak
    /// holder can still safely call into the object at strong count zero.
    #[inline]
    pub const fn extends_life(self) -> bool {
        !matches!(self, Self::StrongOnly)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StrongOnly => "strong_only",
            Self::WeakExtendsLife => "weak_extends_life",
            Self::Forever => "forever",
        }
    }
}

impl fmt::Display for LifetimePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags passed to `RefCounted::on_inc_strong_attempted`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AttemptFlags(u32);

impl AttemptFlags {
    pub const NONE: Self = Self(0);
    /// The attempt would take the strong count from zero (or never-acquired) to one
    pub const FIRST_INC_STRONG: Self = Self(0x0001);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_extends_life() {
        assert!(!LifetimePolicy::StrongOnly.extends_life());
        assert!(LifetimePolicy::WeakExtendsLife.extends_life());
        assert!(LifetimePolicy::Forever.extends_life());
        assert_eq!(LifetimePolicy::default(), LifetimePolicy::StrongOnly);
    }

    #[test]
    fn test_attempt_flags() {
        assert!(AttemptFlags::FIRST_INC_STRONG.contains(AttemptFlags::FIRST_INC_STRONG));
        assert!(!AttemptFlags::NONE.contains(AttemptFlags::FIRST_INC_STRONG));
        assert_eq!(AttemptFlags::FIRST_INC_STRONG.bits(), 1);
    }
}

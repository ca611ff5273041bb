//! Typthon RefBase - intrusive strong/weak reference counting
//!
//! Managed objects embed a `RefBase` and are shared through `Sp` (strong)
//! and `Wp` (weak) handles. A per-object lifetime policy decides whether
//! weak references keep the object alive. Types that never need weak
//! references can use the lighter `LightRefBase` / `LightSp` pair.

pub mod config;
pub mod errors;
pub mod handle;
pub mod light;
pub mod logging;
pub mod refs;
pub mod tracking;

// Re-export core types
pub use config::{RefConfig, TrackingConfig};
pub use errors::{LifetimeViolation, RefError};
pub use handle::{Sp, Wp};
pub use light::{LightRefBase, LightRefCounted, LightSp};
pub use refs::{
    acquire_strong, acquire_weak, release_strong, release_weak, try_promote, AttemptFlags,
    Destroyer, LifetimePolicy, RefBase, RefBlock, RefCounted,
};
pub use tracking::{HolderId, RefTracer, ReferenceReport, ReferenceTracker, TrackingMode};

/// Configure logging and tracking from the environment
pub fn init() {
    init_with_config(RefConfig::from_env());
}

/// Configure logging and tracking from an explicit configuration
pub fn init_with_config(config: RefConfig) {
    logging::init_with_config(config.logging.clone());
    tracking::configure(&config.tracking);
    tracing::debug!(
        track_all = config.tracking.track_all,
        retain = config.tracking.retain,
        "Reference engine initialized"
    );
}

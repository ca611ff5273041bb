//! Engine configuration
//!
//! Loaded from TOML or the environment:
//!
//! ```toml
//! [logging]
//! level = "debug"
//! json_format = false
//!
//! [tracking]
//! track_all = true
//! retain = false
//! ```

use crate::errors::RefError;
use crate::logging::{parse_flag, LogConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefConfig {
    pub logging: LogConfig,
    pub tracking: TrackingConfig,
}

/// Process-wide reference tracking switches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Install a tracker on every new reference block
    pub track_all: bool,
    /// Keep the full acquire/release history instead of outstanding holders
    pub retain: bool,
    /// Give every handle a distinct holder id
    pub holder_ids: bool,
}

impl TrackingConfig {
    /// Override fields from `TYPTHON_REFS_TRACK*` variables
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TYPTHON_REFS_TRACK") {
            self.track_all = parse_flag(&value);
        }
        if let Some(value) = lookup("TYPTHON_REFS_TRACK_RETAIN") {
            self.retain = parse_flag(&value);
        }
        if let Some(value) = lookup("TYPTHON_REFS_HOLDER_IDS") {
            self.holder_ids = parse_flag(&value);
        }
    }
}

impl RefConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, RefError> {
        toml::from_str(source).map_err(|e| RefError::config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RefError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| RefError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Defaults overridden by the environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.logging.apply_env(&lookup);
        self.tracking.apply_env(&lookup);
    }

    pub fn to_toml_string(&self) -> Result<String, RefError> {
        toml::to_string_pretty(self).map_err(|e| RefError::config(e.to_string()))
    }
}

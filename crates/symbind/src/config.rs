//! User configuration, stored as JSON.
//!
//! ```json
//! {
//!   "features": ["CustomStats", "CustomStatsPane"],
//!   "code_section": ".text",
//!   "error_poll_attempts": 600,
//!   "error_poll_interval_ms": 100
//! }
//! ```
//!
//! Every field is optional.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::image::CODE_SECTION;
use crate::patch::FeatureFlags;

/// Default config file name
pub const CONFIG_FILE: &str = "symbind.json";

/// Polls before a deferred startup error is dropped
pub const DEFAULT_ERROR_POLL_ATTEMPTS: u32 = 600;

/// Delay between polls of a deferred startup error
pub const DEFAULT_ERROR_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Opt-in feature switches
    pub features: BTreeSet<String>,
    /// Section holding the host's code
    pub code_section: String,
    pub error_poll_attempts: u32,
    pub error_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            features: BTreeSet::new(),
            code_section: CODE_SECTION.to_string(),
            error_poll_attempts: DEFAULT_ERROR_POLL_ATTEMPTS,
            error_poll_interval_ms: DEFAULT_ERROR_POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Load from `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        debug!(
            "Loaded config from {}: {} features",
            path.display(),
            config.features.len()
        );
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        match Self::load(path) {
            Err(e) if e.is_not_found() => {
                debug!("No config file, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        info!("Saved config to {}", path.as_ref().display());
        Ok(())
    }

    pub fn error_poll_interval(&self) -> Duration {
        Duration::from_millis(self.error_poll_interval_ms)
    }
}

impl FeatureFlags for Config {
    fn has_feature(&self, name: &str) -> bool {
        self.features.contains(name)
    }
}

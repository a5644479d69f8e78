//! Engine configuration.
//!
//! Stored as JSON. Missing fields take their defaults and unknown fields are
//! rejected, so a typo in a config file fails loudly instead of being ignored.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Stack pointer after loading a program.
    pub initial_sp: u16,
    /// Offset the program is copied to; execution starts here.
    pub load_address: u16,
    /// Accumulate estimated clock cycles while running.
    pub estimate_cycles: bool,
    /// Abort `run()` after this many instructions.
    pub step_limit: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_sp: 0xFFFF,
            load_address: 0,
            estimate_cycles: false,
            step_limit: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

//! Configuration for a canoe-link session, loaded from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bridge::BridgeConfig;
use crate::error::{LinkError, Result};

/// Top-level configuration. Every field has a default, so `{}` is a valid file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How to reach the application.
    pub bridge: BridgeConfig,

    /// Namespaces searched, in order, when a variable is read by bare name.
    pub namespace_candidates: Vec<String>,

    /// Let the first operation on a fresh session connect implicitly.
    pub auto_connect: bool,

    /// CSV file that captured readings are appended to.
    pub capture_log: Option<PathBuf>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            namespace_candidates: vec!["General".to_string(), "Measurement".to_string()],
            auto_connect: true,
            capture_log: None,
        }
    }
}

impl LinkConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("cannot read '{}': {e}", path.display())))?;
        Self::from_json(&text)
            .map_err(|e| LinkError::Config(format!("'{}': {e}", path.display())))
    }

    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

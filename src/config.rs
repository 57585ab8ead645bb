//! Engine Configuration
//!
//! One JSON file: where compiled units live, render options, and the
//! default sandbox policy.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::policy::Policy;
use crate::render::RenderOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_units_dir")]
    pub units_dir: PathBuf,
    #[serde(default)]
    pub strict_variables: bool,
    #[serde(default = "default_true")]
    pub autoescape: bool,
    #[serde(default)]
    pub policy: Policy,
}

fn default_units_dir() -> PathBuf { PathBuf::from("units") }
fn default_true() -> bool { true }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            units_dir: default_units_dir(),
            strict_variables: false,
            autoescape: true,
            policy: Policy::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            strict_variables: self.strict_variables,
            autoescape: self.autoescape,
        }
    }
}

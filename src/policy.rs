//! Sandbox Policy - Allow-Lists per Render Invocation
//!
//! A policy is injected by the caller and only ever read.
//! Anything not listed is denied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::config::ConfigError;
use crate::source::ConstructKind;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub allowed_tags: BTreeSet<String>,
    #[serde(default)]
    pub allowed_filters: BTreeSet<String>,
    #[serde(default)]
    pub allowed_functions: BTreeSet<String>,
}

impl Policy {
    /// A policy that allows nothing.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn allow_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_filters.extend(filters.into_iter().map(Into::into));
        self
    }

    pub fn allow_functions<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_functions.extend(functions.into_iter().map(Into::into));
        self
    }

    /// Case-sensitive membership test against the matching allow-list.
    pub fn allows(&self, kind: ConstructKind, name: &str) -> bool {
        match kind {
            ConstructKind::Tag => self.allowed_tags.contains(name),
            ConstructKind::Filter => self.allowed_filters.contains(name),
            ConstructKind::Function => self.allowed_functions.contains(name),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}

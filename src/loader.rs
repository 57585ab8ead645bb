//! Unit Loader - Compiled Units by Name
//!
//! The core only consumes [`UnitLoader`]; where units come from and how
//! they are invalidated belongs to the caller.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::unit::{RenderUnit, UnitDefinition};
use crate::ENGINE_VERSION;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Unit not found: {0}")]
    NotFound(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid unit definition {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unit {0} requires engine >= {1}, current is {2}")]
    EngineVersionMismatch(String, String, String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Unit {name} is defined twice: {first} and {second}")]
    DuplicateUnit {
        name: String,
        first: String,
        second: String,
    },
}

pub trait UnitLoader {
    fn load(&self, name: &str) -> Result<Arc<RenderUnit>, LoaderError>;
}

impl<T: UnitLoader + ?Sized> UnitLoader for &T {
    fn load(&self, name: &str) -> Result<Arc<RenderUnit>, LoaderError> {
        (**self).load(name)
    }
}

/// Unit registry - loads and caches compiled units
#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: HashMap<String, Arc<RenderUnit>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self { units: HashMap::new() }
    }

    /// Load every `*.json` unit definition in `dir`. A missing directory
    /// yields an empty registry. Two files naming the same unit are an error.
    pub fn load_from_dir(dir: &Path) -> Result<Self, LoaderError> {
        let mut registry = Self::new();
        if !dir.exists() {
            return Ok(registry);
        }

        let io_err = |e| LoaderError::Io {
            path: dir.display().to_string(),
            source: e,
        };
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().map_or(false, |e| e == "json") {
                registry.load_file(&path)?;
            }
        }
        Ok(registry)
    }

    fn load_file(&mut self, path: &Path) -> Result<(), LoaderError> {
        let content = fs::read_to_string(path).map_err(|e| LoaderError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut def: UnitDefinition = serde_json::from_str(&content).map_err(|e| LoaderError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        if def.path.is_none() {
            def.path = Some(path.display().to_string());
        }
        if let Some(existing) = self.units.get(&def.name) {
            return Err(LoaderError::DuplicateUnit {
                name: def.name,
                first: existing.source().path().unwrap_or_default().to_string(),
                second: path.display().to_string(),
            });
        }
        debug!(unit = %def.name, path = %path.display(), "loaded unit definition");
        self.register_definition(def)
    }

    /// Register a serialized unit after checking its engine requirement.
    pub fn register_definition(&mut self, def: UnitDefinition) -> Result<(), LoaderError> {
        if let Some(min) = &def.engine_min_version {
            check_engine_version(&def.name, min)?;
        }
        self.register(RenderUnit::from(def));
        Ok(())
    }

    pub fn register(&mut self, unit: RenderUnit) {
        self.units.insert(unit.name().to_string(), Arc::new(unit));
    }

    pub fn get(&self, name: &str) -> Option<Arc<RenderUnit>> {
        self.units.get(name).cloned()
    }

    /// Units sorted by name.
    pub fn list(&self) -> Vec<&RenderUnit> {
        let mut units: Vec<_> = self.units.values().map(Arc::as_ref).collect();
        units.sort_by(|a, b| a.name().cmp(b.name()));
        units
    }
}

impl UnitLoader for UnitRegistry {
    fn load(&self, name: &str) -> Result<Arc<RenderUnit>, LoaderError> {
        self.get(name)
            .ok_or_else(|| LoaderError::NotFound(name.to_string()))
    }
}

fn check_engine_version(unit: &str, min_version: &str) -> Result<(), LoaderError> {
    let engine_ver = semver::Version::parse(ENGINE_VERSION)
        .map_err(|_| LoaderError::InvalidVersion(ENGINE_VERSION.to_string()))?;
    let min_ver = semver::Version::parse(min_version)
        .map_err(|_| LoaderError::InvalidVersion(min_version.to_string()))?;

    if engine_ver < min_ver {
        return Err(LoaderError::EngineVersionMismatch(
            unit.to_string(),
            min_version.to_string(),
            ENGINE_VERSION.to_string(),
        ));
    }
    Ok(())
}

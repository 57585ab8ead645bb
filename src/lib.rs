//! Stencil Core - Sandboxed Template Renderer
//!
//! # The Five Laws (Non-Negotiable)
//! 1. Units Are Data
//! 2. Check Before Output
//! 3. Anything Not Allowed Is Denied
//! 4. Every Failure Names Its Unit
//! 5. Output Is Pulled, Never Pushed

pub mod source;
pub mod policy;
pub mod sandbox;
pub mod context;
pub mod unit;
pub mod loader;
pub mod render;
pub mod hashing;
pub mod config;

pub use source::{SourceUnit, UsageRecord, ConstructKind, DebugMap};
pub use policy::Policy;
pub use sandbox::{check, check_unit, Checked, SecurityError, UsageIndex, Violation};
pub use context::Context;
pub use unit::{Chunk, OutputStream, RenderState, RenderUnit, UnitDefinition};
pub use loader::{LoaderError, UnitLoader, UnitRegistry};
pub use render::{Renderer, RenderError, RenderOptions, RuntimeCause};
pub use hashing::{compute_unit_key, unit_cache_key};
pub use config::{ConfigError, EngineConfig};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

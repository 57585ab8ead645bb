//! Render Units - Compiled Templates as Data
//!
//! A unit is a list of chunk-producing steps, not a type per template.
//! Output is pulled lazily through [`OutputStream`]; nested units are
//! resolved through the loader and checked against the same policy
//! before any of their chunks are produced.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::context::{escape_html, printable, Context};
use crate::loader::UnitLoader;
use crate::policy::Policy;
use crate::render::{RenderError, RenderOptions, RuntimeCause};
use crate::sandbox::{check_unit, Checked, UsageIndex};
use crate::source::{DebugMap, SourceUnit, UsageRecord};

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static PRODUCE_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_produce_call_count() -> u32 {
    PRODUCE_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_produce_call_count() {
    PRODUCE_CALL_COUNT.store(0, Ordering::SeqCst);
}

/// Units nested deeper than this through includes and blocks fail.
pub const MAX_NESTING_DEPTH: usize = 64;

/// One output-producing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chunk {
    /// Literal markup, emitted verbatim.
    Text(String),
    /// Context variable at a dotted path.
    Print {
        path: String,
        #[serde(default)]
        raw: bool,
    },
    /// Output of another unit, by name.
    Include(String),
    /// Named block, resolved against the inheritance chain.
    Block(String),
}

/// Serialized form of a compiled unit, as stored by the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitDefinition {
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub engine_min_version: Option<String>,
    #[serde(default)]
    pub usage: Vec<UsageRecord>,
    #[serde(default)]
    pub body: Vec<Chunk>,
    #[serde(default)]
    pub blocks: BTreeMap<String, Vec<Chunk>>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub debug_info: DebugMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderUnit {
    source: SourceUnit,
    usage: Vec<UsageRecord>,
    usage_index: UsageIndex,
    body: Vec<Chunk>,
    blocks: BTreeMap<String, Vec<Chunk>>,
    parent: Option<String>,
    debug: DebugMap,
}

impl RenderUnit {
    pub fn new(source: SourceUnit, usage: Vec<UsageRecord>, body: Vec<Chunk>) -> Self {
        let usage_index = UsageIndex::from_records(&usage);
        Self {
            source,
            usage,
            usage_index,
            body,
            blocks: BTreeMap::new(),
            parent: None,
            debug: DebugMap::new(),
        }
    }

    /// A unit that emits one literal string and declares no usage.
    pub fn literal(name: impl Into<String>, markup: impl Into<String>) -> Self {
        let markup = markup.into();
        let source = SourceUnit::new(name, markup.clone());
        Self::new(source, vec![], vec![Chunk::Text(markup)])
    }

    pub fn with_block(mut self, name: impl Into<String>, chunks: Vec<Chunk>) -> Self {
        self.blocks.insert(name.into(), chunks);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_debug_map(mut self, debug: DebugMap) -> Self {
        self.debug = debug;
        self
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn source(&self) -> &SourceUnit {
        &self.source
    }

    pub fn usage(&self) -> &[UsageRecord] {
        &self.usage
    }

    pub fn usage_index(&self) -> &UsageIndex {
        &self.usage_index
    }

    pub fn body(&self) -> &[Chunk] {
        &self.body
    }

    pub fn block(&self, name: &str) -> Option<&[Chunk]> {
        self.blocks.get(name).map(Vec::as_slice)
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn debug_map(&self) -> &DebugMap {
        &self.debug
    }

    /// Start producing output. Requires proof the unit passed its check.
    pub fn produce_output<'a>(
        checked: Checked<'a>,
        context: &'a Context,
        loader: &'a dyn UnitLoader,
        policy: &'a Policy,
        options: RenderOptions,
    ) -> OutputStream<'a> {
        #[cfg(feature = "test-hooks")]
        PRODUCE_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        OutputStream {
            context,
            loader,
            policy,
            options,
            pending: Some(UnitRef::Borrowed(checked.unit())),
            stack: Vec::new(),
            state: RenderState::Checked,
        }
    }
}

impl From<UnitDefinition> for RenderUnit {
    fn from(def: UnitDefinition) -> Self {
        let mut source = SourceUnit::new(def.name, def.code);
        if let Some(path) = def.path {
            source = source.with_path(path);
        }
        let mut unit = RenderUnit::new(source, def.usage, def.body).with_debug_map(def.debug_info);
        unit.blocks = def.blocks;
        unit.parent = def.parent;
        unit
    }
}

/// Lifecycle of one render attempt, from the moment the check passed.
///
/// A unit that is not yet loaded or checked has no stream at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderState {
    Checked,
    Rendering,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
enum UnitRef<'a> {
    Borrowed(&'a RenderUnit),
    Shared(Arc<RenderUnit>),
}

impl Deref for UnitRef<'_> {
    type Target = RenderUnit;

    fn deref(&self) -> &RenderUnit {
        match self {
            UnitRef::Borrowed(unit) => *unit,
            UnitRef::Shared(unit) => unit.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Body {
    Main,
    Block(String),
}

#[derive(Debug)]
struct Frame<'a> {
    unit: UnitRef<'a>,
    body: Body,
    pos: usize,
    /// Most-derived first.
    lineage: Rc<Vec<UnitRef<'a>>>,
}

impl Frame<'_> {
    fn chunks(&self) -> &[Chunk] {
        match &self.body {
            Body::Main => self.unit.body(),
            Body::Block(name) => self.unit.block(name).unwrap_or(&[]),
        }
    }
}

/// Pull-based, non-restartable output of one checked unit.
///
/// Dropping the stream early releases every nested frame.
pub struct OutputStream<'a> {
    context: &'a Context,
    loader: &'a dyn UnitLoader,
    policy: &'a Policy,
    options: RenderOptions,
    pending: Option<UnitRef<'a>>,
    stack: Vec<Frame<'a>>,
    state: RenderState,
}

impl fmt::Debug for OutputStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("state", &self.state)
            .field("depth", &self.stack.len())
            .field("options", &self.options)
            .finish()
    }
}

impl<'a> OutputStream<'a> {
    pub fn state(&self) -> RenderState {
        self.state
    }

    fn fail(&mut self, err: RenderError) -> Option<Result<String, RenderError>> {
        self.state = RenderState::Failed;
        self.stack.clear();
        self.pending = None;
        Some(Err(err))
    }

    /// Push frames for `unit`, walking its parent chain first.
    fn enter(&mut self, unit: UnitRef<'a>) -> Result<(), RenderError> {
        let mut lineage = vec![unit];
        let mut seen = BTreeSet::new();
        seen.insert(lineage[0].name().to_string());

        while let Some(parent_name) = lineage.last().and_then(|u| u.parent().map(str::to_string)) {
            let child = lineage.last().map(|u| u.name().to_string()).unwrap_or_default();
            if !seen.insert(parent_name.clone()) {
                return Err(runtime(&child, None, RuntimeCause::InheritanceCycle(parent_name)));
            }
            let parent = self
                .loader
                .load(&parent_name)
                .map_err(|e| runtime(&child, None, RuntimeCause::Loader(e)))?;
            check_unit(&parent, self.policy)?;
            debug!(unit = %child, parent = %parent_name, "entering parent unit");
            lineage.push(UnitRef::Shared(parent));
        }

        let root = lineage[lineage.len() - 1].clone();
        self.push(Frame {
            unit: root,
            body: Body::Main,
            pos: 0,
            lineage: Rc::new(lineage),
        })
    }

    fn push(&mut self, frame: Frame<'a>) -> Result<(), RenderError> {
        if self.stack.len() >= MAX_NESTING_DEPTH {
            return Err(runtime(
                frame.unit.name(),
                None,
                RuntimeCause::NestingTooDeep(MAX_NESTING_DEPTH),
            ));
        }
        self.stack.push(frame);
        Ok(())
    }

    fn include(&mut self, name: &str, from: &RenderUnit, line: Option<u32>) -> Result<(), RenderError> {
        let nested = self
            .loader
            .load(name)
            .map_err(|e| runtime(from.name(), line, RuntimeCause::Loader(e)))?;
        check_unit(&nested, self.policy)?;
        debug!(unit = from.name(), include = name, "entering nested unit");
        self.enter(UnitRef::Shared(nested))
    }

    fn print(&self, path: &str, raw: bool) -> Result<String, RuntimeCause> {
        let text = match self.context.lookup(path) {
            None if self.options.strict_variables => {
                return Err(RuntimeCause::UndefinedVariable(path.to_string()))
            }
            None => String::new(),
            Some(value) => {
                printable(value).ok_or_else(|| RuntimeCause::ArrayToString(path.to_string()))?
            }
        };
        if self.options.autoescape && !raw {
            Ok(escape_html(&text))
        } else {
            Ok(text)
        }
    }
}

impl<'a> Iterator for OutputStream<'a> {
    type Item = Result<String, RenderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, RenderState::Done | RenderState::Failed) {
            return None;
        }
        self.state = RenderState::Rendering;

        if let Some(root) = self.pending.take() {
            if let Err(e) = self.enter(root) {
                return self.fail(e);
            }
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.state = RenderState::Done;
                return None;
            };
            if frame.pos >= frame.chunks().len() {
                self.stack.pop();
                continue;
            }

            let pos = frame.pos;
            frame.pos += 1;
            let unit = frame.unit.clone();
            let body = frame.body.clone();
            let lineage = Rc::clone(&frame.lineage);
            let line = match body {
                Body::Main => unit.debug_map().line_for(pos),
                Body::Block(_) => None,
            };
            let chunk = match &body {
                Body::Main => &unit.body()[pos],
                Body::Block(name) => match unit.block(name) {
                    Some(chunks) => &chunks[pos],
                    None => continue,
                },
            };

            match chunk {
                Chunk::Text(text) => return Some(Ok(text.clone())),
                Chunk::Print { path, raw } => match self.print(path, *raw) {
                    Ok(text) if text.is_empty() => continue,
                    Ok(text) => return Some(Ok(text)),
                    Err(cause) => return self.fail(runtime(unit.name(), line, cause)),
                },
                Chunk::Include(name) => {
                    if let Err(e) = self.include(name, &unit, line) {
                        return self.fail(e);
                    }
                }
                Chunk::Block(name) => {
                    let Some(owner) = lineage.iter().find(|u| u.block(name).is_some()).cloned() else {
                        let cause = RuntimeCause::UnknownBlock(name.clone());
                        return self.fail(runtime(unit.name(), line, cause));
                    };
                    let frame = Frame {
                        unit: owner,
                        body: Body::Block(name.clone()),
                        pos: 0,
                        lineage: Rc::clone(&lineage),
                    };
                    if let Err(e) = self.push(frame) {
                        return self.fail(e);
                    }
                }
            }
        }
    }
}

fn runtime(unit: &str, line: Option<u32>, cause: RuntimeCause) -> RenderError {
    RenderError::Runtime {
        unit: unit.to_string(),
        line,
        cause,
    }
}

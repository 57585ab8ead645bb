//! Renderer - Single Entry Point for Output
//!
//! CRITICAL: every render path runs the sandbox check first. No bypass.
//! A unit that fails its check produces zero chunks.

use std::io::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::context::Context;
use crate::loader::{LoaderError, UnitLoader};
use crate::policy::Policy;
use crate::sandbox::{check_unit, SecurityError};
use crate::unit::{OutputStream, RenderUnit};

#[derive(Debug, Error)]
pub enum RuntimeCause {
    #[error("Variable \"{0}\" does not exist")]
    UndefinedVariable(String),

    #[error("Variable \"{0}\" is an array or object and cannot be printed")]
    ArrayToString(String),

    #[error("Block \"{0}\" is not defined")]
    UnknownBlock(String),

    #[error("Parent \"{0}\" closes an inheritance cycle")]
    InheritanceCycle(String),

    #[error("Units nested deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error(transparent)]
    Loader(#[from] LoaderError),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("Runtime error in \"{unit}\"{}: {cause}", at_line(.line))]
    Runtime {
        unit: String,
        line: Option<u32>,
        cause: RuntimeCause,
    },

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("Output sink error while rendering \"{unit}\": {source}")]
    Sink {
        unit: String,
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    /// Name of the unit the failure is attributed to, if any.
    pub fn unit_name(&self) -> Option<&str> {
        match self {
            RenderError::Security(e) => e.template_name(),
            RenderError::Runtime { unit, .. } | RenderError::Sink { unit, .. } => Some(unit),
            RenderError::Loader(_) => None,
        }
    }
}

fn at_line(line: &Option<u32>) -> String {
    line.map(|l| format!(" at line {}", l)).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    pub strict_variables: bool,
    pub autoescape: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            strict_variables: false,
            autoescape: true,
        }
    }
}

/// The dispatcher - check, then stream
pub struct Renderer<L> {
    loader: L,
    options: RenderOptions,
}

impl<L: UnitLoader> Renderer<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            options: RenderOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RenderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn options(&self) -> RenderOptions {
        self.options
    }

    /// Run the sandbox check alone. Repeatable, no side effects.
    pub fn check(&self, unit: &RenderUnit, policy: &Policy) -> Result<(), SecurityError> {
        check_unit(unit, policy).map(|_| ())
    }

    /// Check `unit`, then hand back its lazy output.
    ///
    /// This is the ONLY way to reach a unit's output.
    pub fn stream<'a>(
        &'a self,
        unit: &'a RenderUnit,
        context: &'a Context,
        policy: &'a Policy,
    ) -> Result<OutputStream<'a>, RenderError> {
        let checked = check_unit(unit, policy).map_err(|e| e.with_template(unit.name()))?;
        debug!(unit = unit.name(), "sandbox check passed");
        Ok(RenderUnit::produce_output(
            checked,
            context,
            &self.loader,
            policy,
            self.options,
        ))
    }

    /// Render to a string.
    pub fn render(
        &self,
        unit: &RenderUnit,
        context: &Context,
        policy: &Policy,
    ) -> Result<String, RenderError> {
        self.stream(unit, context, policy)?.collect()
    }

    /// Stream chunks into `sink` as they are produced. Returns bytes written.
    ///
    /// Output already written stays written if a later chunk fails.
    pub fn render_to<W: Write>(
        &self,
        unit: &RenderUnit,
        context: &Context,
        policy: &Policy,
        sink: &mut W,
    ) -> Result<usize, RenderError> {
        let sink_err = |source| RenderError::Sink {
            unit: unit.name().to_string(),
            source,
        };
        let mut written = 0;
        for chunk in self.stream(unit, context, policy)? {
            let chunk = chunk?;
            sink.write_all(chunk.as_bytes()).map_err(sink_err)?;
            written += chunk.len();
        }
        sink.flush().map_err(sink_err)?;
        Ok(written)
    }

    /// Load a unit by name, then render it. Loader errors pass through.
    pub fn render_named(
        &self,
        name: &str,
        context: &Context,
        policy: &Policy,
    ) -> Result<String, RenderError> {
        let unit = self.loader.load(name)?;
        self.render(&unit, context, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::UnitRegistry;
    use crate::source::{SourceUnit, UsageRecord};
    use crate::unit::Chunk;

    #[test]
    fn test_runtime_error_message_has_line() {
        let err = RenderError::Runtime {
            unit: "page".into(),
            line: Some(5),
            cause: RuntimeCause::UnknownBlock("sidebar".into()),
        };
        assert_eq!(
            err.to_string(),
            "Runtime error in \"page\" at line 5: Block \"sidebar\" is not defined"
        );
    }

    #[test]
    fn test_runtime_error_message_without_line() {
        let err = RenderError::Runtime {
            unit: "page".into(),
            line: None,
            cause: RuntimeCause::UndefinedVariable("x".into()),
        };
        assert_eq!(err.to_string(), "Runtime error in \"page\": Variable \"x\" does not exist");
    }

    #[test]
    fn test_strict_variables_fail_on_missing() {
        let unit = RenderUnit::new(
            SourceUnit::new("p", ""),
            vec![],
            vec![Chunk::Print { path: "missing".into(), raw: false }],
        );
        let renderer = Renderer::new(UnitRegistry::new()).with_options(RenderOptions {
            strict_variables: true,
            ..RenderOptions::default()
        });
        let err = renderer.render(&unit, &Context::new(), &Policy::new()).unwrap_err();
        assert_eq!(err.unit_name(), Some("p"));
        assert!(matches!(
            err,
            RenderError::Runtime { cause: RuntimeCause::UndefinedVariable(_), .. }
        ));
    }

    #[test]
    fn test_autoescape_off_prints_verbatim() {
        let unit = RenderUnit::new(
            SourceUnit::new("p", ""),
            vec![],
            vec![Chunk::Print { path: "html".into(), raw: false }],
        );
        let renderer = Renderer::new(UnitRegistry::new()).with_options(RenderOptions {
            autoescape: false,
            ..RenderOptions::default()
        });
        let ctx = Context::new().with("html", "<i>x</i>");
        assert_eq!(renderer.render(&unit, &ctx, &Policy::new()).unwrap(), "<i>x</i>");
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client went away"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sink_failure_names_the_unit() {
        let unit = RenderUnit::literal("frag", "<div>X</div>");
        let renderer = Renderer::new(UnitRegistry::new());
        let err = renderer
            .render_to(&unit, &Context::new(), &Policy::new(), &mut BrokenSink)
            .unwrap_err();
        assert_eq!(err.unit_name(), Some("frag"));
        assert!(matches!(err, RenderError::Sink { .. }));
        assert!(err.to_string().contains("\"frag\""));
    }

    #[test]
    fn test_check_reports_template_name() {
        let unit = RenderUnit::new(
            SourceUnit::new("blocked", ""),
            vec![UsageRecord::tag("include", 2)],
            vec![],
        );
        let renderer = Renderer::new(UnitRegistry::new());
        let err = renderer.check(&unit, &Policy::new()).unwrap_err();
        assert_eq!(err.template_name(), Some("blocked"));
        assert_eq!(err.line(), Some(2));
    }
}

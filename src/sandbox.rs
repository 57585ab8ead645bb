//! Sandbox Checker - Declared Usage vs Policy
//!
//! CRITICAL: a unit's output may only be produced through a [`Checked`]
//! token, and only `check_unit` can mint one.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::policy::Policy;
use crate::source::{ConstructKind, SourceUnit, UsageRecord};
use crate::unit::RenderUnit;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static CHECK_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_check_call_count() -> u32 {
    CHECK_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_check_call_count() {
    CHECK_CALL_COUNT.store(0, Ordering::SeqCst);
}

/// Details shared by every sandbox violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub name: String,
    pub line: Option<u32>,
    pub template: Option<String>,
}

impl Violation {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            line: None,
            template: None,
        }
    }

    fn location(&self) -> Location<'_> {
        Location(self)
    }
}

struct Location<'a>(&'a Violation);

impl fmt::Display for Location<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(template) = &self.0.template {
            write!(f, " in \"{}\"", template)?;
        }
        if let Some(line) = self.0.line {
            write!(f, " at line {}", line)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("Tag \"{}\" is not allowed{}.", .0.name, .0.location())]
    NotAllowedTag(Violation),

    #[error("Filter \"{}\" is not allowed{}.", .0.name, .0.location())]
    NotAllowedFilter(Violation),

    #[error("Function \"{}\" is not allowed{}.", .0.name, .0.location())]
    NotAllowedFunction(Violation),
}

impl SecurityError {
    pub fn not_allowed(kind: ConstructKind, name: &str) -> Self {
        let violation = Violation::new(name);
        match kind {
            ConstructKind::Tag => SecurityError::NotAllowedTag(violation),
            ConstructKind::Filter => SecurityError::NotAllowedFilter(violation),
            ConstructKind::Function => SecurityError::NotAllowedFunction(violation),
        }
    }

    pub fn kind(&self) -> ConstructKind {
        match self {
            SecurityError::NotAllowedTag(_) => ConstructKind::Tag,
            SecurityError::NotAllowedFilter(_) => ConstructKind::Filter,
            SecurityError::NotAllowedFunction(_) => ConstructKind::Function,
        }
    }

    pub fn violation(&self) -> &Violation {
        match self {
            SecurityError::NotAllowedTag(v)
            | SecurityError::NotAllowedFilter(v)
            | SecurityError::NotAllowedFunction(v) => v,
        }
    }

    fn violation_mut(&mut self) -> &mut Violation {
        match self {
            SecurityError::NotAllowedTag(v)
            | SecurityError::NotAllowedFilter(v)
            | SecurityError::NotAllowedFunction(v) => v,
        }
    }

    pub fn name(&self) -> &str {
        &self.violation().name
    }

    pub fn line(&self) -> Option<u32> {
        self.violation().line
    }

    pub fn template_name(&self) -> Option<&str> {
        self.violation().template.as_deref()
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.violation_mut().line = Some(line);
        self
    }

    /// Attach the template identity, keeping one that is already set.
    pub fn with_template(mut self, template: &str) -> Self {
        let violation = self.violation_mut();
        if violation.template.is_none() {
            violation.template = Some(template.to_string());
        }
        self
    }
}

/// Name → first line lookup built from a unit's own usage records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageIndex {
    tags: BTreeMap<String, u32>,
    filters: BTreeMap<String, u32>,
    functions: BTreeMap<String, u32>,
}

impl UsageIndex {
    pub fn from_records(records: &[UsageRecord]) -> Self {
        let mut index = Self::default();
        for record in records {
            index
                .table_mut(record.kind)
                .entry(record.name.clone())
                .or_insert(record.line);
        }
        index
    }

    pub fn line_of(&self, kind: ConstructKind, name: &str) -> Option<u32> {
        self.table(kind).get(name).copied()
    }

    fn table(&self, kind: ConstructKind) -> &BTreeMap<String, u32> {
        match kind {
            ConstructKind::Tag => &self.tags,
            ConstructKind::Filter => &self.filters,
            ConstructKind::Function => &self.functions,
        }
    }

    fn table_mut(&mut self, kind: ConstructKind) -> &mut BTreeMap<String, u32> {
        match kind {
            ConstructKind::Tag => &mut self.tags,
            ConstructKind::Filter => &mut self.filters,
            ConstructKind::Function => &mut self.functions,
        }
    }
}

/// Proof that a unit passed the sandbox check.
#[derive(Debug, Clone, Copy)]
pub struct Checked<'u> {
    unit: &'u RenderUnit,
}

impl<'u> Checked<'u> {
    pub fn unit(&self) -> &'u RenderUnit {
        self.unit
    }
}

/// Check usage records against a policy, stopping at the first violation.
///
/// The line lookup is built from `records` themselves.
pub fn check(
    records: &[UsageRecord],
    policy: &Policy,
    source: &SourceUnit,
) -> Result<(), SecurityError> {
    let index = UsageIndex::from_records(records);
    check_with_index(records, policy, source, &index)
}

/// Check a unit using the index cached at construction time.
pub fn check_unit<'u>(unit: &'u RenderUnit, policy: &Policy) -> Result<Checked<'u>, SecurityError> {
    check_with_index(unit.usage(), policy, unit.source(), unit.usage_index())?;
    Ok(Checked { unit })
}

fn check_with_index(
    records: &[UsageRecord],
    policy: &Policy,
    source: &SourceUnit,
    index: &UsageIndex,
) -> Result<(), SecurityError> {
    #[cfg(feature = "test-hooks")]
    CHECK_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

    debug!(unit = source.name(), records = records.len(), "sandbox check");

    let Some(record) = records.iter().find(|r| !policy.allows(r.kind, &r.name)) else {
        return Ok(());
    };

    let mut err = SecurityError::not_allowed(record.kind, &record.name).with_template(source.name());
    if let Some(line) = index.line_of(record.kind, &record.name) {
        err = err.with_line(line);
    }

    warn!(
        unit = source.name(),
        kind = %record.kind,
        name = %record.name,
        line = ?err.line(),
        "sandbox violation"
    );

    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceUnit {
        SourceUnit::new("page", "")
    }

    #[test]
    fn test_empty_records_pass_empty_policy() {
        assert!(check(&[], &Policy::new(), &source()).is_ok());
    }

    #[test]
    fn test_first_violation_wins() {
        let records = vec![
            UsageRecord::tag("if", 1),
            UsageRecord::filter("raw", 2),
            UsageRecord::function("exec", 3),
        ];
        let policy = Policy::new().allow_tags(["if"]);
        let err = check(&records, &policy, &source()).unwrap_err();
        assert_eq!(err.kind(), ConstructKind::Filter);
        assert_eq!(err.name(), "raw");
        assert_eq!(err.line(), Some(2));
        assert_eq!(err.template_name(), Some("page"));
    }

    #[test]
    fn test_line_comes_from_first_occurrence() {
        let records = vec![
            UsageRecord::function("exec", 3),
            UsageRecord::function("exec", 9),
        ];
        let err = check(&records, &Policy::new(), &source()).unwrap_err();
        assert_eq!(err.line(), Some(3));
    }

    #[test]
    fn test_index_is_kind_specific() {
        let index = UsageIndex::from_records(&[UsageRecord::tag("include", 4)]);
        assert_eq!(index.line_of(ConstructKind::Tag, "include"), Some(4));
        assert_eq!(index.line_of(ConstructKind::Function, "include"), None);
    }

    #[test]
    fn test_message_includes_location() {
        let err = SecurityError::not_allowed(ConstructKind::Function, "exec")
            .with_template("page")
            .with_line(3);
        assert_eq!(err.to_string(), "Function \"exec\" is not allowed in \"page\" at line 3.");
    }

    #[test]
    fn test_message_without_location() {
        let err = SecurityError::not_allowed(ConstructKind::Tag, "sandbox");
        assert_eq!(err.to_string(), "Tag \"sandbox\" is not allowed.");
    }

    #[test]
    fn test_with_template_keeps_existing() {
        let err = SecurityError::not_allowed(ConstructKind::Tag, "x")
            .with_template("inner")
            .with_template("outer");
        assert_eq!(err.template_name(), Some("inner"));
    }
}

//! Source Units - Template Identity and Declared Usage

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity and original text of one template.
///
/// Immutable once built; owned by the [`RenderUnit`](crate::RenderUnit)
/// compiled from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    name: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    path: Option<String>,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

/// The three kinds of construct a policy can restrict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstructKind {
    Tag,
    Filter,
    Function,
}

impl fmt::Display for ConstructKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstructKind::Tag => f.write_str("Tag"),
            ConstructKind::Filter => f.write_str("Filter"),
            ConstructKind::Function => f.write_str("Function"),
        }
    }
}

/// One declared use of a restricted construct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub kind: ConstructKind,
    pub name: String,
    pub line: u32,
}

impl UsageRecord {
    pub fn new(kind: ConstructKind, name: impl Into<String>, line: u32) -> Self {
        Self { kind, name: name.into(), line }
    }

    pub fn tag(name: impl Into<String>, line: u32) -> Self {
        Self::new(ConstructKind::Tag, name, line)
    }

    pub fn filter(name: impl Into<String>, line: u32) -> Self {
        Self::new(ConstructKind::Filter, name, line)
    }

    pub fn function(name: impl Into<String>, line: u32) -> Self {
        Self::new(ConstructKind::Function, name, line)
    }
}

/// Maps body chunk positions to template lines.
///
/// Only consulted when attributing runtime errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebugMap(BTreeMap<usize, u32>);

impl DebugMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, position: usize, line: u32) {
        self.0.insert(position, line);
    }

    /// Line of the closest recorded position at or before `position`.
    pub fn line_for(&self, position: usize) -> Option<u32> {
        self.0.range(..=position).next_back().map(|(_, line)| *line)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(usize, u32)> for DebugMap {
    fn from_iter<I: IntoIterator<Item = (usize, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_map_uses_closest_preceding_entry() {
        let map: DebugMap = [(0, 1), (3, 7)].into_iter().collect();
        assert_eq!(map.line_for(0), Some(1));
        assert_eq!(map.line_for(2), Some(1));
        assert_eq!(map.line_for(3), Some(7));
        assert_eq!(map.line_for(99), Some(7));
    }

    #[test]
    fn test_debug_map_empty_has_no_line() {
        assert_eq!(DebugMap::new().line_for(4), None);
    }

    #[test]
    fn test_usage_record_deserializes_lowercase_kind() {
        let record: UsageRecord =
            serde_json::from_str(r#"{"kind": "function", "name": "exec", "line": 3}"#).unwrap();
        assert_eq!(record, UsageRecord::function("exec", 3));
    }

    #[test]
    fn test_source_unit_path_optional() {
        let source = SourceUnit::new("page", "<p>hi</p>");
        assert_eq!(source.path(), None);
        let source = source.with_path("themes/page.html.twig");
        assert_eq!(source.path(), Some("themes/page.html.twig"));
    }
}

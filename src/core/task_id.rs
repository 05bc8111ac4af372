//! Task and pipeline identifiers

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// What a `TaskId` names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskIdKind {
    /// A single task factory
    Task,
    /// A task pipeline
    Pipeline,
}

impl TaskIdKind {
    fn as_str(&self) -> &'static str {
        match self {
            TaskIdKind::Task => "task",
            TaskIdKind::Pipeline => "pipeline",
        }
    }
}

/// Identity of a task factory or a task pipeline
///
/// The textual form is `[module:]kind:name[:version]`, for example
/// `task:convert` or `ms2:pipeline:search:1.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    /// Declaring module, if any
    pub module: Option<String>,

    /// Task or pipeline
    pub kind: TaskIdKind,

    /// Name, unique within module and kind
    pub name: String,

    /// Optional version
    pub version: Option<String>,
}

impl TaskId {
    /// Create a task id without module or version
    pub fn task(name: impl Into<String>) -> Self {
        Self {
            module: None,
            kind: TaskIdKind::Task,
            name: name.into(),
            version: None,
        }
    }

    /// Create a pipeline id without module or version
    pub fn pipeline(name: impl Into<String>) -> Self {
        Self {
            module: None,
            kind: TaskIdKind::Pipeline,
            name: name.into(),
            version: None,
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn is_pipeline(&self) -> bool {
        self.kind == TaskIdKind::Pipeline
    }

    /// Parse an id, assuming `default_kind` when the text is a bare name
    pub fn parse_with_default(s: &str, default_kind: TaskIdKind) -> Result<Self, String> {
        if s.contains(':') {
            return s.parse();
        }
        if s.trim().is_empty() {
            return Err("Task id must have a name".to_string());
        }
        Ok(Self {
            module: None,
            kind: default_kind,
            name: s.trim().to_string(),
            version: None,
        })
    }
}

fn parse_kind(s: &str) -> Option<TaskIdKind> {
    match s {
        "task" => Some(TaskIdKind::Task),
        "pipeline" => Some(TaskIdKind::Pipeline),
        _ => None,
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();

        // Locate the kind segment; it is either first or second
        let (module, kind_idx) = match parts.as_slice() {
            [first, ..] if parse_kind(first).is_some() => (None, 0),
            [first, second, ..] if parse_kind(second).is_some() => (Some(first.to_string()), 1),
            _ => return Err(format!("Invalid task id '{}': missing 'task' or 'pipeline'", s)),
        };

        let rest = &parts[kind_idx + 1..];
        let (name, version) = match rest {
            [name] => (*name, None),
            [name, version] => (*name, Some(version.to_string())),
            _ => return Err(format!("Invalid task id '{}'", s)),
        };

        if name.is_empty() {
            return Err(format!("Invalid task id '{}': empty name", s));
        }

        Ok(Self {
            module: module.filter(|m| !m.is_empty()),
            // Checked by the match above
            kind: parse_kind(parts[kind_idx]).unwrap_or(TaskIdKind::Task),
            name: name.to_string(),
            version: version.filter(|v| !v.is_empty()),
        })
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(module) = &self.module {
            write!(f, "{}:", module)?;
        }
        write!(f, "{}:{}", self.kind.as_str(), self.name)?;
        if let Some(version) = &self.version {
            write!(f, ":{}", version)?;
        }
        Ok(())
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_task() {
        let id: TaskId = "task:convert".parse().unwrap();
        assert_eq!(id, TaskId::task("convert"));
        assert_eq!(id.to_string(), "task:convert");
    }

    #[test]
    fn test_parse_with_module_and_version() {
        let id: TaskId = "ms2:pipeline:search:1.0".parse().unwrap();
        assert_eq!(id.module.as_deref(), Some("ms2"));
        assert!(id.is_pipeline());
        assert_eq!(id.name, "search");
        assert_eq!(id.version.as_deref(), Some("1.0"));
        assert_eq!(id.to_string(), "ms2:pipeline:search:1.0");
    }

    #[test]
    fn test_parse_rejects_missing_kind() {
        assert!("convert:step".parse::<TaskId>().is_err());
        assert!("task:".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_parse_bare_name_with_default() {
        let id = TaskId::parse_with_default("convert", TaskIdKind::Task).unwrap();
        assert_eq!(id, TaskId::task("convert"));

        let id = TaskId::parse_with_default("pipeline:search", TaskIdKind::Task).unwrap();
        assert_eq!(id, TaskId::pipeline("search"));
    }
}

//! File-system roots for pipeline I/O

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The file-system root a container's jobs read from and write to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeRoot {
    /// Container this root belongs to
    pub container: String,

    /// Root directory
    pub path: PathBuf,
}

impl PipeRoot {
    pub fn new(container: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            container: container.into(),
            path: path.into(),
        }
    }

    /// Resolve a path against the root; absolute paths are returned as-is
    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        let relative = relative.as_ref();
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.path.join(relative)
        }
    }

    /// Check whether a path lies under this root
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).starts_with(&self.path)
    }
}

/// Container -> pipe root mapping
#[derive(Debug, Clone, Default)]
pub struct PipeRootRegistry {
    roots: HashMap<String, PipeRoot>,
}

impl PipeRootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a container -> directory map
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut registry = Self::new();
        for (container, path) in map {
            registry.insert(PipeRoot::new(container.clone(), PathBuf::from(path)));
        }
        registry
    }

    /// Set the root for a container, replacing any previous one
    pub fn insert(&mut self, root: PipeRoot) {
        self.roots.insert(root.container.clone(), root);
    }

    pub fn get(&self, container: &str) -> Option<&PipeRoot> {
        self.roots.get(container)
    }

    pub fn containers(&self) -> impl Iterator<Item = &String> {
        self.roots.keys()
    }
}

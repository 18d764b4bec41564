use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::McResult;

/// Tunables of a [`crate::McPlusBuilder`].
///
/// Every field has a default, so a TOML document only needs to name what it
/// overrides:
///
/// ```toml
/// preallocated_allocators = 3
/// annotation_names = ["JTIndexReg", "Profile"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderOptions {
    /// Initial chunk size, in bytes, of each allocator arena. `0` lets the
    /// arena pick its own.
    pub arena_chunk_size: usize,
    /// Allocators created eagerly on top of the default allocator 0.
    pub preallocated_allocators: u16,
    /// Generic annotation names registered right after the built-ins, in
    /// order, so that their indices are known up front.
    pub annotation_names: Vec<String>,
    /// Prefix of the labels made up by `get_or_create_inst_label`.
    pub label_prefix: String,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            arena_chunk_size: 0,
            preallocated_allocators: 0,
            annotation_names: Vec::new(),
            label_prefix: ".Ltmp".to_owned(),
        }
    }
}

impl BuilderOptions {
    pub fn from_toml_str(source: &str) -> McResult<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn load_from_toml(path: &Path) -> McResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> McResult<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn with_arena_chunk_size(mut self, bytes: usize) -> Self {
        self.arena_chunk_size = bytes;
        self
    }

    pub fn with_preallocated_allocators(mut self, count: u16) -> Self {
        self.preallocated_allocators = count;
        self
    }

    pub fn with_annotation_name(mut self, name: impl Into<String>) -> Self {
        self.annotation_names.push(name.into());
        self
    }

    pub fn with_label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.label_prefix = prefix.into();
        self
    }
}

//! Runtime form of a patch module.
//!
//! Modules are built from validated definitions (or directly in code) and are
//! never mutated afterwards.

use crate::config::schema::{InputSpec, ResourceManifest};
use crate::marker::is_valid_name;
use std::fmt;

/// One textual rewrite a module performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOperation {
    /// Replace the body of a begin/end marker region
    Replace { region: String, text: String },
    /// Insert text in front of every occurrence of an insertion marker
    Insert { marker: String, text: String },
    /// Replace every literal occurrence of a string
    FindReplace {
        find: String,
        replacement: Replacement,
    },
}

/// Where a find/replace rule gets its replacement text from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement {
    Literal(String),
    /// The user's free text for the module, quoted as a string literal
    UserInput,
}

impl PatchOperation {
    /// Application phase: replacements, then insertions, then find/replace.
    pub fn phase(&self) -> u8 {
        match self {
            PatchOperation::Replace { .. } => 0,
            PatchOperation::Insert { .. } => 1,
            PatchOperation::FindReplace { .. } => 2,
        }
    }

    /// Check the operation is well formed.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PatchOperation::Replace { region, .. } if !is_valid_name(region) => {
                Err(format!("invalid region name '{region}'"))
            }
            PatchOperation::Insert { marker, .. } if !is_valid_name(marker) => {
                Err(format!("invalid marker name '{marker}'"))
            }
            PatchOperation::FindReplace { find, .. } if find.is_empty() => {
                Err("empty search string".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for PatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchOperation::Replace { region, .. } => write!(f, "replace {region}"),
            PatchOperation::Insert { marker, .. } => write!(f, "insert {marker}"),
            PatchOperation::FindReplace { find, .. } => write!(f, "find {find:?}"),
        }
    }
}

/// An independently selectable unit of firmware modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchModule {
    pub key: String,
    pub name: String,
    pub description: String,
    pub authors: Vec<String>,
    pub input: Option<InputSpec>,
    pub resources: Option<ResourceManifest>,
    pub operations: Vec<PatchOperation>,
}

impl PatchModule {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            description: String::new(),
            authors: Vec::new(),
            input: None,
            resources: None,
            operations: Vec::new(),
        }
    }

    pub fn with_replace(mut self, region: impl Into<String>, text: impl Into<String>) -> Self {
        self.operations.push(PatchOperation::Replace {
            region: region.into(),
            text: text.into(),
        });
        self
    }

    pub fn with_insert(mut self, marker: impl Into<String>, text: impl Into<String>) -> Self {
        self.operations.push(PatchOperation::Insert {
            marker: marker.into(),
            text: text.into(),
        });
        self
    }

    pub fn with_find(mut self, find: impl Into<String>, replace: impl Into<String>) -> Self {
        self.operations.push(PatchOperation::FindReplace {
            find: find.into(),
            replacement: Replacement::Literal(replace.into()),
        });
        self
    }

    /// Add a find rule whose replacement is the user's input.
    ///
    /// Also marks the module as taking input.
    pub fn with_input_find(mut self, find: impl Into<String>) -> Self {
        self.input.get_or_insert_with(InputSpec::default);
        self.operations.push(PatchOperation::FindReplace {
            find: find.into(),
            replacement: Replacement::UserInput,
        });
        self
    }

    pub fn with_resources(mut self, resources: ResourceManifest) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Operations in application order.
    ///
    /// Stable by phase, so declaration order is kept within a phase.
    pub fn ordered_operations(&self) -> Vec<&PatchOperation> {
        let mut ops: Vec<&PatchOperation> = self.operations.iter().collect();
        ops.sort_by_key(|op| op.phase());
        ops
    }
}

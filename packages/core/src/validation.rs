//! Validation outcome types.
//!
//! Validation rules themselves live outside this crate; whatever evaluates
//! them reports back through [`ValidationResult`], with failures organised as
//! a [`ValidationErrorTree`] that mirrors the shape of the message (one node
//! per member, nested for member-of-member failures).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of validating a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationResult {
    /// The message satisfies every rule.
    Valid,
    /// The message violates one or more rules.
    Invalid {
        /// Structured description of each failure.
        errors: ValidationErrorTree,
    },
}

impl ValidationResult {
    /// Build a result from a tree: empty trees are `Valid`.
    #[must_use]
    pub fn from_tree(errors: ValidationErrorTree) -> Self {
        if errors.is_empty() {
            Self::Valid
        } else {
            Self::Invalid { errors }
        }
    }

    /// Whether no rule was violated.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Hierarchical collection of validation errors.
///
/// Errors on the node itself describe the message (or member) as a whole;
/// `members` holds one subtree per failing member, keyed by member name.
/// `BTreeMap` keeps rendering and serialization order deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrorTree {
    /// Errors attached to this node.
    pub errors: Vec<String>,
    /// Failing members, keyed by name.
    pub members: BTreeMap<String, ValidationErrorTree>,
}

impl ValidationErrorTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an error to this node.
    pub fn add_error(&mut self, error: impl Into<String>) -> &mut Self {
        self.errors.push(error.into());
        self
    }

    /// Subtree for `name`, created on first access.
    pub fn member(&mut self, name: impl Into<String>) -> &mut Self {
        self.members.entry(name.into()).or_default()
    }

    /// True when neither this node nor any descendant holds an error.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.members.values().all(Self::is_empty)
    }

    /// Total number of errors in the tree.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.len()
            + self
                .members
                .values()
                .map(Self::error_count)
                .sum::<usize>()
    }

    /// Flatten to `(path, error)` pairs, path segments joined with `.`.
    /// Errors on the root node have an empty path.
    #[must_use]
    pub fn flatten(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.collect_into("", &mut out);
        out
    }

    fn collect_into(&self, prefix: &str, out: &mut Vec<(String, String)>) {
        for error in &self.errors {
            out.push((prefix.to_string(), error.clone()));
        }
        for (name, subtree) in &self.members {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            subtree.collect_into(&path, out);
        }
    }
}

impl fmt::Display for ValidationErrorTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flat = self.flatten();
        for (i, (path, error)) in flat.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            if path.is_empty() {
                f.write_str(error)?;
            } else {
                write!(f, "{path}: {error}")?;
            }
        }
        Ok(())
    }
}

//! Ownership matching: from a dependent back to the parent that controls it.

use crate::model::{ObjectMeta, WorkKey};

/// Maps a dependent to the work key of its controlling parent.
///
/// Only the controller reference is considered, and only when it names the
/// expected parent kind. The API group/version is not compared: nothing else
/// of that kind name is expected to control a dependent.
///
/// Owner references carry no namespace, so the parent is taken to live in
/// the dependent's namespace. Cross-namespace ownership is not supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerMatcher {
    parent_kind: String,
}

impl OwnerMatcher {
    pub fn new(parent_kind: impl Into<String>) -> Self {
        Self {
            parent_kind: parent_kind.into(),
        }
    }

    pub fn parent_kind(&self) -> &str {
        &self.parent_kind
    }

    /// The parent's work key, or `None` for orphans and foreign controllers.
    pub fn matches(&self, dependent: &ObjectMeta) -> Option<WorkKey> {
        let owner = dependent.controller_ref()?;
        if owner.kind != self.parent_kind {
            return None;
        }
        Some(WorkKey::new(dependent.namespace.clone(), owner.name.clone()))
    }
}

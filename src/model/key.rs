//! Work identity for a parent object.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::meta::ObjectMeta;
use crate::error::Error;

/// `(namespace, name)` of a parent. The unit of queueing and dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkKey {
    pub namespace: String,
    pub name: String,
}

impl WorkKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The key of the object described by `meta`.
    pub fn of(meta: &ObjectMeta) -> Self {
        Self::new(meta.namespace.clone(), meta.name.clone())
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Parses `namespace/name`, or a bare `name` for cluster-scoped objects.
impl FromStr for WorkKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = match s.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => ("", s),
        };
        if name.is_empty() || name.contains('/') {
            return Err(Error::Other(format!("invalid work key: {s:?}")));
        }
        Ok(Self::new(namespace, name))
    }
}

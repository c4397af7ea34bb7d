//! Core data model.
//!
//! Objects are identified by namespace and name. Dependents point at their
//! controlling parent through an owner reference; parents are queued by
//! [`WorkKey`].

pub mod key;
pub mod meta;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use key::WorkKey;
pub use meta::{ObjectMeta, OwnerReference};

/// Anything the controller can watch.
pub trait Resource: DeserializeOwned + Send + Sync + 'static {
    fn meta(&self) -> &ObjectMeta;

    fn key(&self) -> WorkKey {
        WorkKey::of(self.meta())
    }
}

// ---------------------------------------------------------------------------
// Dynamic object
// ---------------------------------------------------------------------------

/// An object of any kind, with `spec` and `status` kept as opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub status: serde_json::Value,
}

impl DynamicObject {
    pub fn new(kind: impl Into<String>, namespace: &str, name: &str) -> Self {
        Self {
            api_version: None,
            kind: kind.into(),
            metadata: ObjectMeta::new(namespace, name),
            spec: serde_json::Value::Null,
            status: serde_json::Value::Null,
        }
    }

    pub fn owned_by(mut self, owner: OwnerReference) -> Self {
        self.metadata.owner_references.push(owner);
        self
    }

    pub fn terminating(mut self, at: chrono::DateTime<chrono::Utc>) -> Self {
        self.metadata.deletion_timestamp = Some(at);
        self
    }

    pub fn spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }
}

impl Resource for DynamicObject {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
}

//! Watch events, raw and validated.
//!
//! The transport hands over [`RawEvent`]s with an untyped JSON payload.
//! Each stream validates them exactly once into a [`WatchEvent`] of its own
//! resource type; anything that fails validation is reported and dropped by
//! the caller.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Resource, WorkKey};

/// What the transport observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Added => "added",
            EventType::Modified => "modified",
            EventType::Deleted => "deleted",
        }
    }
}

/// A change notification as delivered on the wire.
///
/// `key` is only meaningful for deletions whose final object state was lost
/// (the object is then `null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub object: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl RawEvent {
    pub fn new(event_type: EventType, object: serde_json::Value) -> Self {
        Self {
            event_type,
            object,
            key: None,
        }
    }

    /// A deletion observed only by key.
    pub fn tombstone(key: &WorkKey) -> Self {
        Self {
            event_type: EventType::Deleted,
            object: serde_json::Value::Null,
            key: Some(key.to_string()),
        }
    }
}

/// A validated event carrying a concrete object.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Updated(T),
    Deleted(T),
    /// The delete was observed without the final state of the object.
    DeletedFinalStateUnknown {
        key: WorkKey,
        last_known: Option<T>,
    },
}

impl<T: Resource> WatchEvent<T> {
    /// Validate `raw` against the stream's declared `kind`.
    ///
    /// A payload whose `kind` field names a different kind, or that does not
    /// deserialize into `T`, is an [`Error::MalformedEvent`].
    pub fn decode(raw: RawEvent, kind: &str) -> Result<Self> {
        let malformed = |reason: String| Error::MalformedEvent {
            kind: kind.to_string(),
            reason,
        };

        if raw.object.is_null() {
            return match (raw.event_type, raw.key) {
                (EventType::Deleted, Some(key)) => Ok(WatchEvent::DeletedFinalStateUnknown {
                    key: key.parse().map_err(|e: Error| malformed(e.to_string()))?,
                    last_known: None,
                }),
                (event_type, _) => Err(malformed(format!(
                    "{} event without an object",
                    event_type.as_str()
                ))),
            };
        }

        if let Some(declared) = raw.object.get("kind").and_then(|k| k.as_str()) {
            if declared != kind {
                return Err(malformed(format!("not a {kind} object: got {declared}")));
            }
        }

        let object: T =
            serde_json::from_value(raw.object).map_err(|e| malformed(e.to_string()))?;

        Ok(match raw.event_type {
            EventType::Added => WatchEvent::Added(object),
            EventType::Modified => WatchEvent::Updated(object),
            EventType::Deleted => match raw.key {
                Some(key) => WatchEvent::DeletedFinalStateUnknown {
                    key: key.parse().map_err(|e: Error| malformed(e.to_string()))?,
                    last_known: Some(object),
                },
                None => WatchEvent::Deleted(object),
            },
        })
    }

    /// The object carried by the event, if it was observed.
    pub fn object(&self) -> Option<&T> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Updated(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::DeletedFinalStateUnknown { last_known, .. } => last_known.as_ref(),
        }
    }

    /// The key of the object the event is about.
    pub fn key(&self) -> WorkKey {
        match self {
            WatchEvent::DeletedFinalStateUnknown { key, .. } => key.clone(),
            WatchEvent::Added(o) | WatchEvent::Updated(o) | WatchEvent::Deleted(o) => o.key(),
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            WatchEvent::Added(_) => EventType::Added,
            WatchEvent::Updated(_) => EventType::Modified,
            WatchEvent::Deleted(_) | WatchEvent::DeletedFinalStateUnknown { .. } => {
                EventType::Deleted
            }
        }
    }
}

//! In-memory informer.
//!
//! Holds the current state of one resource kind, applies raw events to it
//! and fans the same events out to every subscriber. Late subscribers get the
//! current contents replayed as `ADDED` events first, as after an initial list.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{EventStream, Informer, Lister};
use crate::error::{Error, Result};
use crate::event::{EventType, RawEvent, WatchEvent};
use crate::model::{Resource, WorkKey};

pub struct MemoryCache<T> {
    kind: String,
    state: Mutex<CacheState<T>>,
}

struct CacheState<T> {
    objects: HashMap<WorkKey, Arc<T>>,
    subscribers: Vec<mpsc::UnboundedSender<RawEvent>>,
    synced: bool,
    closed: bool,
}

impl<T: Resource + Serialize> MemoryCache<T> {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            state: Mutex::new(CacheState {
                objects: HashMap::new(),
                subscribers: Vec::new(),
                synced: false,
                closed: false,
            }),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a raw event and forward it to subscribers.
    ///
    /// Events that do not decode as this cache's kind leave the store
    /// untouched but are still forwarded, the way a transport would deliver
    /// them.
    pub fn apply(&self, raw: RawEvent) {
        self.apply_locked(&mut self.lock(), raw);
    }

    fn apply_locked(&self, state: &mut CacheState<T>, raw: RawEvent) {
        match WatchEvent::<T>::decode(raw.clone(), &self.kind) {
            Ok(WatchEvent::Added(obj)) | Ok(WatchEvent::Updated(obj)) => {
                state.objects.insert(obj.key(), Arc::new(obj));
            }
            Ok(WatchEvent::Deleted(obj)) => {
                state.objects.remove(&obj.key());
            }
            Ok(WatchEvent::DeletedFinalStateUnknown { key, .. }) => {
                state.objects.remove(&key);
            }
            Err(e) => warn!(kind = %self.kind, error = %e, "forwarding undecodable event"),
        }
        state.subscribers.retain(|tx| tx.send(raw.clone()).is_ok());
    }

    /// Insert or replace an object, emitting `ADDED` or `MODIFIED`.
    pub fn upsert(&self, obj: T) -> Result<()> {
        let object = self.to_wire(&obj)?;
        let mut state = self.lock();
        let event_type = if state.objects.contains_key(&obj.key()) {
            EventType::Modified
        } else {
            EventType::Added
        };
        self.apply_locked(&mut state, RawEvent::new(event_type, object));
        Ok(())
    }

    /// Remove an object, emitting `DELETED` with its last state. Returns
    /// false if it was not cached.
    pub fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.lock();
        let Some(obj) = state.objects.get(&WorkKey::new(namespace, name)).cloned() else {
            return Ok(false);
        };
        let object = self.to_wire(obj.as_ref())?;
        self.apply_locked(&mut state, RawEvent::new(EventType::Deleted, object));
        Ok(true)
    }

    pub fn mark_synced(&self) {
        self.lock().synced = true;
        debug!(kind = %self.kind, "cache synced");
    }

    /// Drop all subscribers, ending their streams, and refuse new ones.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every cached object in `namespace`.
    pub fn list(&self, namespace: &str) -> Vec<Arc<T>> {
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, v)| Arc::clone(v))
            .collect()
    }

    fn to_wire(&self, obj: &T) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(obj)?;
        if let Some(map) = value.as_object_mut() {
            map.entry("kind")
                .or_insert_with(|| serde_json::Value::String(self.kind.clone()));
        }
        Ok(value)
    }
}

impl<T: Resource + Serialize> Lister<T> for MemoryCache<T> {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<T>>> {
        Ok(self
            .lock()
            .objects
            .get(&WorkKey::new(namespace, name))
            .cloned())
    }
}

impl<T: Resource + Serialize> Informer<T> for MemoryCache<T> {
    fn subscribe(&self) -> Result<EventStream> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Subscribe(format!("{} informer is closed", self.kind)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for obj in state.objects.values() {
            tx.send(RawEvent::new(EventType::Added, self.to_wire(obj)?))
                .map_err(|e| Error::Subscribe(e.to_string()))?;
        }
        state.subscribers.push(tx);
        Ok(rx)
    }

    fn has_synced(&self) -> bool {
        self.lock().synced
    }
}

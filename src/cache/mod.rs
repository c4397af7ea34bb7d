//! Read-through caches and their change streams.
//!
//! The controller never talks to the source of truth directly: it reads
//! objects through a [`Lister`] and learns about changes by subscribing to an
//! [`Informer`]. [`MemoryCache`] is an in-process implementation of both.

pub mod memory;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::RawEvent;

pub use memory::MemoryCache;

/// Stream of raw change notifications from one informer.
pub type EventStream = mpsc::UnboundedReceiver<RawEvent>;

/// Readiness probe: true once a cache has completed its initial list.
pub type SyncCheck = Arc<dyn Fn() -> bool + Send + Sync>;

pub trait Lister<T>: Send + Sync {
    /// Look up an object. `Ok(None)` means not found; errors are anything
    /// else that went wrong.
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<T>>>;
}

pub trait Informer<T>: Lister<T> {
    /// Open a new change stream. Fails if the informer cannot deliver events.
    fn subscribe(&self) -> Result<EventStream>;

    fn has_synced(&self) -> bool;
}

/// Wrap an informer's readiness as a [`SyncCheck`].
pub fn sync_check<T: 'static>(informer: Arc<dyn Informer<T>>) -> SyncCheck {
    Arc::new(move || informer.has_synced())
}

//! Controller: event routing, queueing and dispatch for one parent kind.

pub mod dispatch;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::queue::backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};

pub use dispatch::{Controller, Processed, Registration};
pub use router::EventRouter;

/// Brings a parent's dependents in line with what the parent asks for.
///
/// Called at least once per change and possibly more; implementations must
/// be idempotent. `cancel` fires when the controller is shutting down.
#[async_trait]
pub trait Reconciler<P>: Send + Sync {
    async fn sync(&self, cancel: &CancellationToken, parent: Arc<P>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Used for the queue name, logs and metric labels.
    pub name: String,
    /// Kind named in dependents' controller references.
    pub parent_kind: String,
    pub dependent_kind: String,
    /// Concurrent dispatch workers.
    pub workers: usize,
    /// How long to wait for the caches' initial list before giving up.
    pub sync_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "gateway-shim".to_string(),
            parent_kind: "Gateway".to_string(),
            dependent_kind: "Certificate".to_string(),
            workers: 5,
            sync_timeout: Duration::from_secs(60),
            backoff_base: DEFAULT_BASE_DELAY,
            backoff_max: DEFAULT_MAX_DELAY,
        }
    }
}

//! Dispatch loop: a pool of workers draining the queue into the reconciler.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt as _;
use opentelemetry::KeyValue;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};

use super::router::EventRouter;
use super::{ControllerConfig, Reconciler};
use crate::cache::{Informer, SyncCheck, sync_check};
use crate::error::{Error, Result};
use crate::model::{Resource, WorkKey};
use crate::queue::{ItemBackoff, WorkQueue};
use crate::sync::wait_for_cache_sync;
use crate::telemetry::metrics;
use crate::telemetry::reconcile::{record_outcome, start_reconcile_span};

/// How a work item was settled without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// The reconciler ran and succeeded.
    Synced,
    /// The parent is gone; nothing to do.
    NotFound,
    /// The parent is being deleted; left alone.
    Terminating,
}

impl Processed {
    pub fn as_str(self) -> &'static str {
        match self {
            Processed::Synced => "synced",
            Processed::NotFound => "not_found",
            Processed::Terminating => "terminating",
        }
    }
}

/// What [`Controller::register`] hands back.
pub struct Registration {
    pub queue: Arc<WorkQueue>,
    /// Must all report true before dispatch starts.
    pub must_sync: Vec<SyncCheck>,
    routers: Vec<JoinHandle<()>>,
}

impl Registration {
    /// Stop the event router tasks.
    pub fn abort(&self) {
        for router in &self.routers {
            router.abort();
        }
    }
}

pub struct Controller<P, D> {
    config: ControllerConfig,
    parents: Arc<dyn Informer<P>>,
    dependents: Arc<dyn Informer<D>>,
    reconciler: Arc<dyn Reconciler<P>>,
    queue: Arc<WorkQueue>,
}

impl<P, D> Clone for Controller<P, D> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            parents: Arc::clone(&self.parents),
            dependents: Arc::clone(&self.dependents),
            reconciler: Arc::clone(&self.reconciler),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<P: Resource, D: Resource> Controller<P, D> {
    pub fn new(
        config: ControllerConfig,
        parents: Arc<dyn Informer<P>>,
        dependents: Arc<dyn Informer<D>>,
        reconciler: Arc<dyn Reconciler<P>>,
    ) -> Self {
        let queue = Arc::new(WorkQueue::with_backoff(
            config.name.clone(),
            ItemBackoff::new(config.backoff_base, config.backoff_max),
        ));
        Self {
            config,
            parents,
            dependents,
            reconciler,
            queue,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The work queue, for introspection.
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    pub fn router(&self) -> EventRouter {
        EventRouter::new(
            self.config.name.clone(),
            self.queue(),
            self.config.parent_kind.clone(),
            self.config.dependent_kind.clone(),
        )
    }

    /// Subscribe to both streams and start routing their events into the
    /// queue. Must be called from within a tokio runtime.
    pub fn register(&self) -> Result<Registration> {
        let parent_events = self.parents.subscribe()?;
        let dependent_events = self.dependents.subscribe()?;

        let router = self.router();
        let routers = vec![
            tokio::spawn(router.clone().run_parents::<P>(parent_events)),
            tokio::spawn(router.run_dependents::<D>(dependent_events)),
        ];

        Ok(Registration {
            queue: self.queue(),
            must_sync: vec![
                sync_check(Arc::clone(&self.parents)),
                sync_check(Arc::clone(&self.dependents)),
            ],
            routers,
        })
    }

    /// Register, wait for the caches, then dispatch until `cancel` fires.
    ///
    /// On cancellation the queue is shut down and workers finish what they
    /// hold before this returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let registration = self.register()?;

        info!(controller = %self.config.name, "waiting for caches to sync");
        let synced = wait_for_cache_sync(
            &self.config.name,
            &registration.must_sync,
            self.config.sync_timeout,
            &cancel,
        )
        .await;
        if !synced {
            registration.abort();
            self.queue.shut_down();
            return Err(Error::CacheSync);
        }

        info!(controller = %self.config.name, workers = self.config.workers, "starting workers");
        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers {
            let ctrl = self.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { ctrl.worker(worker, cancel).await });
        }

        cancel.cancelled().await;
        info!(controller = %self.config.name, "shutting down queue");
        self.queue.shut_down();

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(controller = %self.config.name, error = %e, "worker task failed");
            }
        }
        registration.abort();
        info!(controller = %self.config.name, "controller stopped");
        Ok(())
    }

    async fn worker(&self, worker: usize, cancel: CancellationToken) {
        debug!(controller = %self.config.name, worker, "worker started");
        while self.process_next(&cancel).await {}
        debug!(controller = %self.config.name, worker, "worker stopped");
    }

    /// Take one key off the queue and settle it. Returns false once the
    /// queue has shut down.
    pub async fn process_next(&self, cancel: &CancellationToken) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let span = start_reconcile_span(&self.config.name, &key);
        let started = Instant::now();
        // A panicking reconciler must not leave the key marked in flight.
        let result = AssertUnwindSafe(self.process_item(cancel, &key))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(&*panic))));

        let outcome = match result {
            Ok(processed) => {
                self.queue.forget(&key);
                processed.as_str()
            }
            Err(e) => {
                let delay = self.queue.add_rate_limited(key.clone());
                span.in_scope(|| {
                    error!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "re-queuing item due to error processing"
                    );
                });
                "error"
            }
        };
        record_outcome(&span, outcome);

        let labels = [
            KeyValue::new("controller", self.config.name.clone()),
            KeyValue::new("result", outcome),
        ];
        metrics::reconcile_results().add(1, &labels);
        metrics::reconcile_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &labels[..1],
        );

        self.queue.done(&key);
        true
    }

    /// Resolve the parent behind `key` and reconcile it if it is live.
    pub async fn process_item(
        &self,
        cancel: &CancellationToken,
        key: &WorkKey,
    ) -> Result<Processed> {
        let Some(parent) = self.parents.get(&key.namespace, &key.name)? else {
            debug!(%key, "parent not found, nothing to reconcile");
            return Ok(Processed::NotFound);
        };

        // No new dependents for a parent on its way out; they would race
        // garbage collection.
        if parent.meta().is_terminating() {
            debug!(%key, "parent is terminating, skipping");
            return Ok(Processed::Terminating);
        }

        self.reconciler
            .sync(cancel, parent)
            .await
            .map_err(Error::Reconcile)?;
        Ok(Processed::Synced)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

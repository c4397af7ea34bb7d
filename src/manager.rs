//! Composition root: an explicit list of controllers run side by side.
//!
//! Controllers are built by the caller and handed over here; nothing
//! registers itself. They share one cancellation token. A controller that
//! fails to start is reported without taking the others down.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::model::Resource;

/// Something the manager can run until cancelled.
#[async_trait]
pub trait Runnable: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

#[async_trait]
impl<P: Resource, D: Resource> Runnable for Controller<P, D> {
    fn name(&self) -> &str {
        Controller::name(self)
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        Controller::run(self, cancel).await
    }
}

#[derive(Default)]
pub struct Manager {
    runnables: Vec<Arc<dyn Runnable>>,
    cancel: CancellationToken,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, runnable: impl Runnable + 'static) -> Self {
        self.runnables.push(Arc::new(runnable));
        self
    }

    pub fn add(&mut self, runnable: Arc<dyn Runnable>) {
        self.runnables.push(runnable);
    }

    /// Token that stops every controller when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.runnables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runnables.is_empty()
    }

    /// Run every controller until the token is cancelled and all have
    /// stopped. Fails naming the controllers that returned an error.
    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for runnable in self.runnables {
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let name = runnable.name().to_string();
                info!(controller = %name, "starting controller");
                let result = runnable.run(cancel).await;
                (name, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    error!(controller = %name, error = %e, "controller failed");
                    failed.push(name);
                }
                Err(e) => {
                    error!(error = %e, "controller task panicked");
                    failed.push("<panicked>".to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort();
            Err(Error::Other(format!(
                "controller(s) failed: {}",
                failed.join(", ")
            )))
        }
    }
}

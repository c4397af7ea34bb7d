//! reconq CLI: run a controller over recorded watch events, or inspect
//! ownership of a dependent object.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use reconq::cache::MemoryCache;
use reconq::config::Config;
use reconq::controller::{Controller, Reconciler};
use reconq::event::RawEvent;
use reconq::manager::Manager;
use reconq::matcher::OwnerMatcher;
use reconq::model::{DynamicObject, Resource};
use reconq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "reconq", about = "Owner-driven reconciliation controller")]
struct Cli {
    /// TOML config file; environment variables are used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay recorded watch events through a controller
    Replay {
        /// JSON-lines file of parent watch events
        #[arg(long)]
        parents: PathBuf,
        /// JSON-lines file of dependent watch events
        #[arg(long)]
        dependents: PathBuf,
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
        /// Stop after this many seconds instead of waiting for ctrl-c
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Print the parent work key a dependent object maps to
    Owner {
        /// JSON file holding one dependent object
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Replay {
            parents,
            dependents,
            workers,
            duration,
        } => cmd_replay(config, &parents, &dependents, workers, duration).await,
        Command::Owner { file } => cmd_owner(&config, &file),
    }
}

async fn cmd_replay(
    mut config: Config,
    parents_file: &Path,
    dependents_file: &Path,
    workers: Option<usize>,
    duration: Option<u64>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "reconq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    if let Some(workers) = workers {
        anyhow::ensure!(workers > 0, "--workers must be at least 1");
        config.controller.workers = workers;
    }

    let parents = Arc::new(MemoryCache::<DynamicObject>::new(
        config.controller.parent_kind.clone(),
    ));
    let dependents = Arc::new(MemoryCache::<DynamicObject>::new(
        config.controller.dependent_kind.clone(),
    ));

    let loaded = load_events(&parents, parents_file)?;
    info!(count = loaded, file = %parents_file.display(), "loaded parent events");
    let loaded = load_events(&dependents, dependents_file)?;
    info!(count = loaded, file = %dependents_file.display(), "loaded dependent events");
    parents.mark_synced();
    dependents.mark_synced();

    let reconciler = LoggingReconciler {
        dependents: Arc::clone(&dependents),
        matcher: OwnerMatcher::new(config.controller.parent_kind.clone()),
    };
    let controller = Controller::<DynamicObject, DynamicObject>::new(
        config.controller.clone(),
        parents,
        dependents,
        Arc::new(reconciler),
    );

    let manager = Manager::new().with(controller);
    let cancel = manager.cancel_token();
    tokio::spawn(stop_on_signal(cancel, duration.map(Duration::from_secs)));

    manager.run().await?;
    Ok(())
}

fn cmd_owner(config: &Config, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let dependent: DynamicObject = serde_json::from_str(&content)
        .with_context(|| format!("{} is not an object", file.display()))?;

    let matcher = OwnerMatcher::new(config.controller.parent_kind.clone());
    match matcher.matches(dependent.meta()) {
        Some(key) => println!("{key}"),
        None => println!(
            "{} has no {} controller",
            dependent.key(),
            matcher.parent_kind()
        ),
    }
    Ok(())
}

/// Feed a JSON-lines event file into a cache. Lines that are not events are
/// skipped with a warning.
fn load_events(cache: &MemoryCache<DynamicObject>, path: &Path) -> anyhow::Result<usize> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;

    let mut count = 0;
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<RawEvent>(line) {
            Ok(raw) => {
                cache.apply(raw);
                count += 1;
            }
            Err(e) => warn!(file = %path.display(), line = lineno + 1, error = %e, "skipping unparsable event"),
        }
    }
    Ok(count)
}

async fn stop_on_signal(cancel: CancellationToken, after: Option<Duration>) {
    match after {
        Some(after) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(after) => {}
            }
        }
        None => {
            tokio::signal::ctrl_c().await.ok();
        }
    }
    info!("stopping");
    cancel.cancel();
}

/// Logs each reconciled parent with the number of dependents it controls.
struct LoggingReconciler {
    dependents: Arc<MemoryCache<DynamicObject>>,
    matcher: OwnerMatcher,
}

#[async_trait]
impl Reconciler<DynamicObject> for LoggingReconciler {
    async fn sync(
        &self,
        _cancel: &CancellationToken,
        parent: Arc<DynamicObject>,
    ) -> anyhow::Result<()> {
        let key = parent.key();
        let owned = self
            .dependents
            .list(&key.namespace)
            .iter()
            .filter(|d| self.matcher.matches(d.meta()).as_ref() == Some(&key))
            .count();
        info!(parent = %key, owned, "reconciled");
        Ok(())
    }
}

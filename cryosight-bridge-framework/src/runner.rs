//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use cryosight_common::{connect, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::Publisher;
use crate::status::StatusPublisher;
use crate::store::{TelemetryStore, ZenohStore};

/// A worker that stopped with an error.
#[derive(Debug)]
struct WorkerFailure {
    name: String,
    message: String,
}

/// Bridge runner that manages the lifecycle of a bridge.
///
/// Handles:
/// - Logging initialization
/// - Zenoh connection and the telemetry store
/// - Task spawning and cooperative shutdown
/// - Graceful shutdown on Ctrl+C or SIGTERM
/// - Status publishing (optional)
///
/// # Example
///
/// ```ignore
/// use cryosight_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
///
///     let publisher = runner.publisher();
///     let shutdown = runner.shutdown_receiver();
///     runner.spawn_critical("worker", my_worker(publisher, shutdown));
///
///     runner.run().await?;
///     Ok(())
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Zenoh session.
    session: Arc<zenoh::Session>,
    /// Store shared by every publisher of this bridge.
    store: Arc<ZenohStore>,
    /// Publisher for telemetry.
    publisher: Publisher<ZenohStore>,
    /// Status publisher (optional).
    status_publisher: Option<StatusPublisher<ZenohStore>>,
    /// Spawned tasks.
    tasks: Vec<(String, JoinHandle<()>)>,
    shutdown_tx: watch::Sender<bool>,
    failure_tx: mpsc::UnboundedSender<WorkerFailure>,
    failure_rx: mpsc::UnboundedReceiver<WorkerFailure>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner.
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Create a new bridge runner with CLI args for log level override.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Connect to Zenoh
    /// 3. Create the store and publisher
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = config
            .logging()
            .with_level_override(args.and_then(|a| a.log_level.as_deref()));
        init_tracing(&log_config)?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let session = Arc::new(
            connect(config.zenoh())
                .await
                .map_err(|e| BridgeError::ZenohConnection(e.to_string()))?,
        );

        let store = Arc::new(ZenohStore::new(session.clone(), config.store_history()));
        let publisher = Publisher::new(
            store.clone(),
            config.store_key()?,
            name.clone(),
            config.serialization(),
        );

        let (shutdown_tx, _) = watch::channel(false);
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        Ok(Self {
            name,
            version,
            config,
            session,
            store,
            publisher,
            status_publisher: None,
            tasks: Vec::new(),
            shutdown_tx,
            failure_tx,
            failure_rx,
        })
    }

    /// Enable status publishing.
    ///
    /// When enabled, the runner will publish status messages on startup and shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(StatusPublisher::new(
            self.publisher.clone(),
            &self.name,
            &self.version,
        ));
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Get the shared store.
    pub fn store(&self) -> Arc<ZenohStore> {
        self.store.clone()
    }

    /// Get a clone of the publisher.
    pub fn publisher(&self) -> Publisher<ZenohStore> {
        self.publisher.clone()
    }

    /// Receiver that flips to `true` once shutdown is requested.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a worker task.
    ///
    /// The task is given the shutdown grace period and then aborted.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name.into(), tokio::spawn(future)));
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged automatically.
    pub fn spawn_with_error<F, E>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let worker = name.clone();
        self.spawn(name, async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %worker, error = %e, "Worker failed");
            }
        });
    }

    /// Spawn a worker the bridge cannot run without.
    ///
    /// If it returns an error the whole bridge shuts down and
    /// [`run`](Self::run) returns that error.
    pub fn spawn_critical<F, E>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let worker = name.clone();
        let failures = self.failure_tx.clone();
        self.spawn(name, async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %worker, error = %e, "Critical worker failed");
                let _ = failures.send(WorkerFailure {
                    name: worker,
                    message: e.to_string(),
                });
            }
        });
    }

    /// Run the bridge until a shutdown signal or a critical worker failure.
    ///
    /// This will:
    /// 1. Publish "running" status (if enabled)
    /// 2. Wait for Ctrl+C, SIGTERM or a critical failure
    /// 3. Signal workers and give them the grace period to finish
    /// 4. Abort whatever is still running
    /// 5. Publish "offline" or "error" status (if enabled)
    /// 6. Close the store and the Zenoh session
    pub async fn run(self) -> Result<()> {
        self.run_with_metadata(None).await
    }

    /// Run the bridge with custom status metadata.
    pub async fn run_with_metadata(mut self, metadata: Option<serde_json::Value>) -> Result<()> {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_running(metadata).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        let failure = tokio::select! {
            _ = wait_for_signal() => {
                tracing::info!(bridge = %self.name, "Received shutdown signal");
                None
            }
            failure = self.failure_rx.recv() => failure,
        };

        let _ = self.shutdown_tx.send(true);
        drain_tasks(std::mem::take(&mut self.tasks), self.config.shutdown_grace()).await;

        if let Some(ref status_pub) = self.status_publisher {
            let published = match &failure {
                Some(f) => status_pub.publish_error(&f.message).await,
                None => status_pub.publish_offline().await,
            };
            if let Err(e) = published {
                tracing::warn!(error = %e, "Failed to publish final status");
            }
        }

        if let Err(e) = self.store.close().await {
            tracing::warn!(error = %e, "Error closing telemetry store");
        }
        if let Err(e) = self.session.close().await {
            tracing::warn!(error = %e, "Error closing Zenoh session");
        }

        match failure {
            Some(f) => Err(BridgeError::worker(f.name, f.message)),
            None => {
                tracing::info!(bridge = %self.name, "Goodbye!");
                Ok(())
            }
        }
    }
}

/// Wait for every task up to a shared deadline, then abort the rest.
async fn drain_tasks(tasks: Vec<(String, JoinHandle<()>)>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;

    for (name, mut handle) in tasks {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(_) => tracing::debug!(worker = %name, "Worker stopped"),
            Err(_) => {
                tracing::warn!(worker = %name, grace = ?grace, "Worker did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to listen for SIGTERM");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_tasks_aborts_stragglers() {
        let finished = tokio::spawn(async {});
        let stuck = tokio::spawn(std::future::pending::<()>());
        let stuck_abort = stuck.abort_handle();

        let start = tokio::time::Instant::now();
        drain_tasks(
            vec![("done".into(), finished), ("stuck".into(), stuck)],
            Duration::from_millis(50),
        )
        .await;

        assert!(start.elapsed() < Duration::from_secs(1));
        tokio::task::yield_now().await;
        assert!(stuck_abort.is_finished());
    }
}

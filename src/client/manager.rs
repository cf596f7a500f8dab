use futures::future::join_all;
use prometheus::Registry;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::metrics::QueueClientMetrics;
use super::queue_client::{QueueClient, QueueClientError};
use crate::config::{client_name, manager_name, Config};
use crate::marker::{MarkerError, MarkerFileHandler, MarkerHandler, MarkerMetrics};
use crate::wal::{Marker, Watcher, WatcherMetrics, WriterEventsNotifier};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("at least one client config must be provided")]
    NoClients,

    #[error("duplicate client name '{0}', client names must be unique")]
    DuplicateClientName(String),

    #[error("failed to set up segment marker: {0}")]
    Marker(#[from] MarkerError),

    #[error("failed to create client: {0}")]
    Client(#[from] QueueClientError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// One watcher feeding one queue client.
struct Pair {
    name: String,
    watcher: Arc<Watcher>,
    client: Arc<QueueClient>,
}

impl Pair {
    async fn stop(&self, drain: bool) {
        if drain {
            self.watcher.drain().await;
        }
        self.watcher.stop().await;
        self.client.stop().await;
        info!(client = %self.name, "Stopped WAL watcher and client");
    }
}

/// Builds a watcher, queue client and marker for every configured client
/// and wires them to the WAL notifier.
pub struct Manager {
    name: String,
    pairs: Vec<Pair>,
}

impl Manager {
    pub fn new(
        registry: &Registry,
        config: &Config,
        notifier: &dyn WriterEventsNotifier,
    ) -> Result<Self, ManagerError> {
        if config.clients.is_empty() {
            return Err(ManagerError::NoClients);
        }

        let mut names = Vec::with_capacity(config.clients.len());
        let mut seen = HashSet::new();
        for client in &config.clients {
            let name = client_name(client);
            if !seen.insert(name.clone()) {
                return Err(ManagerError::DuplicateClientName(name));
            }
            names.push(name);
        }

        let client_metrics = QueueClientMetrics::new(registry)?;
        let marker_metrics = MarkerMetrics::new(registry)?;
        let watcher_metrics = WatcherMetrics::new(registry)?;

        let mut pairs = Vec::with_capacity(config.clients.len());
        for (client_config, name) in config.clients.iter().zip(names.iter()) {
            let store = Arc::new(MarkerFileHandler::new(&config.wal.dir, name)?);
            let marker = Arc::new(MarkerHandler::new(store, marker_metrics.curried(name)));

            let client = Arc::new(QueueClient::new(
                client_metrics.clone(),
                client_config.clone(),
                config.limits,
                marker.clone(),
            )?);

            let watcher = Arc::new(Watcher::new(
                &config.wal.dir,
                name,
                watcher_metrics.clone(),
                client.clone(),
                config.wal.watch,
                Some(marker as Arc<dyn Marker>),
            ));

            notifier.subscribe_cleanup(client.clone());
            notifier.subscribe_write(watcher.clone());
            watcher.start();

            info!(client = %name, host = %client.host(), "Started WAL client");
            pairs.push(Pair {
                name: name.clone(),
                watcher,
                client,
            });
        }

        Ok(Self {
            name: manager_name(&names),
            pairs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops without draining the WAL.
    pub async fn stop(&self) {
        self.stop_with_drain(false).await;
    }

    /// Stops every pair concurrently. With `drain`, watchers first read the
    /// WAL to its end, each bounded by its drain timeout.
    pub async fn stop_with_drain(&self, drain: bool) {
        info!(manager = %self.name, drain, "Stopping WAL clients");
        join_all(self.pairs.iter().map(|pair| pair.stop(drain))).await;
    }

    /// Cancels all in-flight delivery right away. Anything not yet marked is
    /// replayed after a restart.
    pub async fn stop_now(&self) {
        info!(manager = %self.name, "Stopping WAL clients immediately");
        join_all(self.pairs.iter().map(|pair| async move {
            // Clients first, so a watcher blocked on a full queue is released.
            pair.client.stop_now().await;
            pair.watcher.stop().await;
        }))
        .await;
    }
}

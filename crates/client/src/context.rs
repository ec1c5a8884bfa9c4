//! Service wiring.

use std::sync::Arc;

use log::info;

use fieldsync_core::entities::{EntityDataManager, LocalStoreTrait};
use fieldsync_core::errors::{Error, Result};
use fieldsync_core::events::EventBus;
use fieldsync_core::network::NetworkMonitor;
use fieldsync_core::sync::{Outbox, OutboxRepositoryTrait, RemoteAuthority, SyncManager};
use fieldsync_remote::HttpRemoteClient;
use fieldsync_storage_sqlite::{open, OutboxRepository, RecordRepository};

use crate::config::AppConfig;

/// Every long-lived service of the engine. Build once, share by reference.
pub struct ServiceContext {
    pub config: AppConfig,
    pub events: EventBus,
    pub network: NetworkMonitor,
    pub store: Arc<dyn LocalStoreTrait>,
    pub outbox: Outbox,
    pub sync_manager: Arc<SyncManager>,
    pub data_manager: EntityDataManager,
}

impl ServiceContext {
    /// Opens the local database under `config.data_dir` and wires the services around
    /// `remote`. Connectivity is reported by the platform through `network`.
    pub fn build(
        config: AppConfig,
        remote: Arc<dyn RemoteAuthority>,
        network: NetworkMonitor,
    ) -> Result<Self> {
        let (pool, writer) = open(&config.data_dir)?;
        let store: Arc<dyn LocalStoreTrait> =
            Arc::new(RecordRepository::new(pool.clone(), writer.clone()));
        let outbox_repository: Arc<dyn OutboxRepositoryTrait> =
            Arc::new(OutboxRepository::new(pool, writer));

        let events = EventBus::new();
        let outbox = Outbox::new(outbox_repository, events.clone(), config.sync.max_retries);
        let sync_manager = SyncManager::new(
            store.clone(),
            outbox.clone(),
            remote,
            network.clone(),
            events.clone(),
            config.sync.clone(),
        );
        let data_manager = EntityDataManager::new(store.clone(), sync_manager.clone());

        Ok(Self {
            config,
            events,
            network,
            store,
            outbox,
            sync_manager,
            data_manager,
        })
    }

    /// [`ServiceContext::build`] against the HTTP API at `config.api_base_url`.
    pub fn connect(config: AppConfig, network: NetworkMonitor) -> Result<Self> {
        let remote = HttpRemoteClient::with_timeout(&config.api_base_url, config.sync.request_timeout)
            .map_err(|e| Error::Config(e.to_string()))?;
        Self::build(config, Arc::new(remote), network)
    }

    /// Starts the connectivity watcher and re-arms retries persisted by a previous run.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.sync_manager.watch_connectivity();
        self.sync_manager.rearm_retry_timer()?;
        let pending = self.outbox.notify_pending_count()?;
        info!(
            "[Sync] Engine started with {} pending mutation(s), {}",
            pending,
            if self.network.is_online() { "online" } else { "offline" }
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        self.sync_manager.shutdown();
    }

    pub fn data_manager(&self) -> &EntityDataManager {
        &self.data_manager
    }
}

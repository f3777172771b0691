//! Wiring of the sync engine for one CLI invocation

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use sync_core::{
    config::SyncEngineConfig,
    session::{FileSessionStore, RefreshCoordinator, SessionStore},
    source::FileDataSource,
    sync::{
        build_http_client, parse_base_url, AuthClient, HttpTransport, OfflineQueue,
        SyncOrchestrator,
    },
};

/// Session store, auth client and transport against one service
pub struct SyncClient {
    engine: SyncEngineConfig,
    store: Arc<dyn SessionStore>,
    auth: Arc<AuthClient>,
    transport: Arc<HttpTransport>,
}

impl SyncClient {
    /// Create a client for `api_url`, keeping state under `home`
    pub async fn new(api_url: &str, home: &Path) -> Result<Self> {
        let mut engine = SyncEngineConfig::default();
        engine.transport.base_url = api_url.to_string();
        engine.queue.persistence_path = Some(crate::config::queue_path(home));

        let store: Arc<dyn SessionStore> = Arc::new(
            FileSessionStore::open(crate::config::session_path(home))
                .await
                .context("Failed to open session file")?,
        );
        let client = build_http_client(&engine.transport).context("Failed to create HTTP client")?;
        let base_url = parse_base_url(api_url).context("Invalid API URL")?;

        let auth = Arc::new(AuthClient::new(client.clone(), base_url.clone(), store.clone()));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), auth.clone()));
        let transport = Arc::new(HttpTransport::with_client(client, base_url, coordinator));

        Ok(Self {
            engine,
            store,
            auth,
            transport,
        })
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<HttpTransport> {
        &self.transport
    }

    /// Open the persisted offline queue
    pub async fn queue(&self) -> Result<Arc<OfflineQueue>> {
        let queue = OfflineQueue::open(
            self.engine.queue.clone(),
            self.engine.routing.clone(),
            self.transport.clone(),
        )
        .await
        .context("Failed to open offline queue")?;
        Ok(Arc::new(queue))
    }

    /// Orchestrator reading exported records from `data_dir`
    pub fn orchestrator(&self, data_dir: &Path, queue: Arc<OfflineQueue>) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.engine.orchestrator.clone(),
            self.engine.routing.clone(),
            Arc::new(FileDataSource::new(data_dir)),
            self.transport.clone(),
        )
        .with_queue(queue)
    }
}

//! Application state management

use anyhow::Result;
use meterline_core::shutdown::Shutdown;
use meterline_core::{Index, InMemoryStore, IngestReport, Recorder, Registry, SampleCache, Store};
use meterline_postgres::{PgOptions, PgStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{Config, StoreKind};
use crate::probe::ProbeFetcher;

/// Shared application state
pub struct AppState {
    /// Persistent store shared by every task
    pub store: Arc<dyn Store>,
    /// Node registry
    pub registry: Registry,
    /// Path and element indexes from the latest ingestion
    pub index: Arc<RwLock<Index>>,
    /// Latest value per key
    pub cache: Arc<SampleCache>,
    /// Sample writer
    pub recorder: Recorder,
    /// Probe source
    pub probe: ProbeFetcher,
    /// Configuration
    pub config: Config,
    /// Set once the cache has been warmed from the store
    warmed: AtomicBool,
}

/// Open the configured store; `None` when shutdown arrives while waiting for it
pub async fn open_store(config: &Config, shutdown: &mut Shutdown) -> Option<Arc<dyn Store>> {
    match config.store.kind {
        StoreKind::Memory => {
            info!("Using in-memory store");
            Some(Arc::new(InMemoryStore::new()))
        }
        StoreKind::Postgres => {
            let options = PgOptions {
                url: config.store.url.clone(),
                max_connections: config.store.max_connections,
                retry_delay: config.store.retry_delay(),
            };
            let store = PgStore::connect_with_retry(&options, shutdown).await?;
            Some(Arc::new(store))
        }
    }
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, store: Arc<dyn Store>) -> Result<Arc<Self>> {
        let cache = Arc::new(SampleCache::new());
        let probe = ProbeFetcher::new(config.probe.source.clone(), config.probe.format)?;

        Ok(Arc::new(Self {
            registry: Registry::new(store.clone(), config.paths.clone()),
            recorder: Recorder::new(store.clone(), cache.clone()),
            index: Arc::new(RwLock::new(Index::default())),
            store,
            cache,
            probe,
            config,
            warmed: AtomicBool::new(false),
        }))
    }

    /// Fetch the probe and register it when it changed since the last pass.
    ///
    /// The first successful pass also warms the cache from the store. A
    /// failed pass leaves the probe uncommitted, so the next call retries.
    pub async fn ingest(&self) -> Result<Option<IngestReport>> {
        let Some(probe) = self.probe.fetch_if_changed().await? else {
            return Ok(None);
        };

        let (index, report) = self.registry.ingest(&probe.document).await?;
        *self.index.write().await = index;
        info!(sha = %&probe.sha[..8], nodes = report.created + report.existing, "Index updated");

        if !self.warmed.load(Ordering::SeqCst) {
            let index = self.index.read().await;
            self.recorder.warm_start(&index, chrono::Utc::now()).await?;
            self.warmed.store(true, Ordering::SeqCst);
        }
        self.probe.commit(probe.sha).await;
        Ok(Some(report))
    }
}

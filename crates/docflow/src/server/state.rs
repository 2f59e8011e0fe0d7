//! Application state for the docflow server

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::DocflowConfig;
use crate::error::Result;
use crate::events::{EventBus, EventPublisher};
use crate::extraction::{DisabledOcr, ExtractionPipeline, ExtractorRegistry, OcrEngine, TesseractOcr};
use crate::ingestion::{ContentLocks, DocumentService, UploadCoordinator};
use crate::processing::{spawn_reaper, BatchOrchestrator, IndexerWorker, JobRegistry, ReconciliationSweep, RetryPolicy};
use crate::providers::{
    scanner, CommandThumbnailer, LocalObjectStore, NoopThumbnailer, ObjectStore, ThumbnailGenerator, UrlSigner,
    VirusScanner,
};
use crate::search::{FtsSearchEngine, SearchEngine};
use crate::storage::DocumentDb;

/// Swappable backends behind the pipeline
pub struct Backends {
    pub db: DocumentDb,
    pub store: Arc<dyn ObjectStore>,
    pub search: Arc<dyn SearchEngine>,
    pub scanner: Arc<dyn VirusScanner>,
    pub thumbnailer: Arc<dyn ThumbnailGenerator>,
    pub ocr: Arc<dyn OcrEngine>,
}

impl Backends {
    /// Open the on-disk backends named in config
    pub fn from_config(config: &DocflowConfig) -> Result<Self> {
        if let Some(parent) = config.storage.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = config.search.index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if config.storage.presign_secret == "change-me" {
            tracing::warn!("storage.presign_secret is the default; download URLs are forgeable");
        }

        let db = DocumentDb::new(&config.storage.database_path)?;
        let signer = UrlSigner::new(config.storage.presign_secret.clone(), config.storage.public_base_url.clone());
        let store = LocalObjectStore::new(config.storage.objects_dir.clone(), signer)?;
        let search = FtsSearchEngine::new(&config.search.index_path, &config.search)?;
        let scanner: Arc<dyn VirusScanner> = Arc::from(scanner::from_config(&config.scanner)?);

        let thumbnailer: Arc<dyn ThumbnailGenerator> = if config.thumbnails.enabled {
            Arc::new(CommandThumbnailer::new(&config.thumbnails))
        } else {
            Arc::new(NoopThumbnailer)
        };

        let ocr: Arc<dyn OcrEngine> = if !config.extraction.ocr_enabled {
            Arc::new(DisabledOcr)
        } else if TesseractOcr::is_installed() {
            Arc::new(TesseractOcr::new(&config.extraction))
        } else {
            tracing::warn!("tesseract not found on PATH, OCR disabled");
            Arc::new(DisabledOcr)
        };

        tracing::info!(
            database = %config.storage.database_path.display(),
            objects = %config.storage.objects_dir.display(),
            index = %config.search.index_path.display(),
            scanner = scanner.name(),
            thumbnails = thumbnailer.name(),
            ocr = ocr.name(),
            "Backends opened"
        );

        Ok(Self {
            db,
            store: Arc::new(store),
            search: Arc::new(search),
            scanner,
            thumbnailer,
            ocr,
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: DocflowConfig,
    db: DocumentDb,
    bus: EventBus,
    store: Arc<dyn ObjectStore>,
    signer: UrlSigner,
    search: Arc<dyn SearchEngine>,
    coordinator: Arc<UploadCoordinator>,
    documents: Arc<DocumentService>,
    indexer: Arc<IndexerWorker>,
    orchestrator: BatchOrchestrator,
    reconcile: Arc<ReconciliationSweep>,
    ready: RwLock<bool>,
}

impl AppState {
    /// Open the configured backends and wire the pipeline
    pub async fn new(config: DocflowConfig) -> Result<Self> {
        tracing::info!("Initializing docflow application state...");
        let backends = Backends::from_config(&config)?;
        Ok(Self::with_backends(config, backends))
    }

    /// Wire the pipeline over explicit backends; no background task is started
    pub fn with_backends(config: DocflowConfig, backends: Backends) -> Self {
        let Backends {
            db,
            store,
            search,
            scanner,
            thumbnailer,
            ocr,
        } = backends;

        let bus = EventBus::with_retention(config.events.partitions, config.events.retention);
        let signer = UrlSigner::new(config.storage.presign_secret.clone(), config.storage.public_base_url.clone());
        let publisher: Arc<dyn EventPublisher> = Arc::new(bus.clone());
        let locks = ContentLocks::new();

        let coordinator = Arc::new(UploadCoordinator::new(
            config.upload.clone(),
            config.scanner.on_unavailable,
            scanner,
            Arc::clone(&store),
            db.clone(),
            thumbnailer,
            Arc::clone(&publisher),
            locks.clone(),
        ));
        let documents = Arc::new(DocumentService::new(
            db.clone(),
            Arc::clone(&store),
            Arc::clone(&search),
            Arc::clone(&publisher),
            locks,
        ));

        let pipeline = Arc::new(ExtractionPipeline::new(
            Arc::new(ExtractorRegistry::with_defaults()),
            ocr,
            &config.extraction,
        ));
        let indexer = Arc::new(IndexerWorker::new(
            bus.clone(),
            Arc::clone(&store),
            pipeline,
            Arc::clone(&search),
            db.clone(),
            RetryPolicy::from_config(&config.indexer),
            config.events.indexer_group.clone(),
        ));

        let registry = Arc::new(JobRegistry::new(Some(db.clone())));
        let orchestrator = BatchOrchestrator::new(registry, Arc::clone(&coordinator), Arc::clone(&documents), &config.jobs);
        let reconcile = Arc::new(ReconciliationSweep::new(db.clone(), publisher, &config.reconcile));

        Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                bus,
                store,
                signer,
                search,
                coordinator,
                documents,
                indexer,
                orchestrator,
                reconcile,
                ready: RwLock::new(false),
            }),
        }
    }

    /// Start the indexer consumers, the job reaper and the reconciliation sweep
    pub fn start_background(&self) -> Result<Vec<JoinHandle<()>>> {
        let inner = &self.inner;
        let mut handles = Arc::clone(&inner.indexer).spawn()?;
        handles.push(spawn_reaper(Arc::clone(inner.orchestrator.registry()), &inner.config.jobs));

        if inner.config.reconcile.enabled {
            let interval = Duration::from_secs(inner.config.reconcile.interval_secs.max(1));
            handles.push(Arc::clone(&inner.reconcile).spawn(interval));
        } else {
            tracing::info!("Reconciliation sweep disabled");
        }

        self.set_ready(true);
        Ok(handles)
    }

    pub fn config(&self) -> &DocflowConfig {
        &self.inner.config
    }

    pub fn db(&self) -> &DocumentDb {
        &self.inner.db
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.store
    }

    /// Verifies presigned blob URLs handed out by the object store
    pub fn signer(&self) -> &UrlSigner {
        &self.inner.signer
    }

    pub fn search(&self) -> &Arc<dyn SearchEngine> {
        &self.inner.search
    }

    pub fn coordinator(&self) -> &Arc<UploadCoordinator> {
        &self.inner.coordinator
    }

    pub fn documents(&self) -> &Arc<DocumentService> {
        &self.inner.documents
    }

    pub fn indexer(&self) -> &Arc<IndexerWorker> {
        &self.inner.indexer
    }

    pub fn orchestrator(&self) -> &BatchOrchestrator {
        &self.inner.orchestrator
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        self.inner.orchestrator.registry()
    }

    pub fn reconcile(&self) -> &Arc<ReconciliationSweep> {
        &self.inner.reconcile
    }

    /// Check if ready
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.read()
    }

    /// Set ready state
    pub fn set_ready(&self, ready: bool) {
        *self.inner.ready.write() = ready;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::providers::{MemoryObjectStore, SignatureScanner};

    pub(crate) fn memory_state(config: DocflowConfig) -> AppState {
        let backends = Backends {
            db: DocumentDb::in_memory().unwrap(),
            store: Arc::new(MemoryObjectStore::new()),
            search: Arc::new(FtsSearchEngine::in_memory(&SearchConfig::default()).unwrap()),
            scanner: Arc::new(SignatureScanner::new()),
            thumbnailer: Arc::new(NoopThumbnailer),
            ocr: Arc::new(DisabledOcr),
        };
        AppState::with_backends(config, backends)
    }

    #[tokio::test]
    async fn test_background_tasks_mark_ready() {
        let mut config = DocflowConfig::default();
        config.events.partitions = 2;
        let state = memory_state(config);
        assert!(!state.is_ready());

        let handles = state.start_background().unwrap();
        // two consumers per partition, the reaper and the sweep
        assert_eq!(handles.len(), 2 * 2 + 2);
        assert!(state.is_ready());
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_on_disk_backends() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DocflowConfig::default();
        config.storage.database_path = dir.path().join("db/docflow.db");
        config.storage.objects_dir = dir.path().join("objects");
        config.search.index_path = dir.path().join("index/search.db");
        config.extraction.ocr_enabled = false;
        config.thumbnails.enabled = false;

        let state = AppState::new(config).await.unwrap();
        assert_eq!(state.search().count().await.unwrap(), 0);
        assert!(dir.path().join("db/docflow.db").exists());
    }
}

//! End-to-end tests: upload, event channel, indexer, search and bulk jobs

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use docflow::config::DocflowConfig;
use docflow::extraction::{DisabledOcr, OcrEngine};
use docflow::ingestion::UploadRequest;
use docflow::processing::WorkItem;
use docflow::providers::{MemoryObjectStore, NoopThumbnailer, ObjectStore, SignatureScanner};
use docflow::search::{FtsSearchEngine, SearchQuery};
use docflow::server::state::{AppState, Backends};
use docflow::storage::DocumentDb;
use docflow::types::IndexedEvent;
use docflow::{DocumentStatus, Error, JobStatus, JobType, Result};

fn backends(store: Arc<dyn ObjectStore>, ocr: Arc<dyn OcrEngine>) -> Backends {
    let config = DocflowConfig::default();
    Backends {
        db: DocumentDb::in_memory().unwrap(),
        store,
        search: Arc::new(FtsSearchEngine::in_memory(&config.search).unwrap()),
        scanner: Arc::new(SignatureScanner::new()),
        thumbnailer: Arc::new(NoopThumbnailer),
        ocr,
    }
}

fn config() -> DocflowConfig {
    let mut config = DocflowConfig::default();
    config.events.partitions = 2;
    config.indexer.max_attempts = 4;
    config.indexer.backoff_base_ms = 10;
    config.indexer.backoff_cap_ms = 1_000;
    config
}

fn memory_state() -> AppState {
    AppState::with_backends(config(), backends(Arc::new(MemoryObjectStore::new()), Arc::new(DisabledOcr)))
}

/// Wait for the detached `uploaded` emission of the last upload
async fn wait_for_events(state: &AppState, count: usize) {
    while state.bus().message_count("uploaded") < count {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_upload_index_search() {
    let state = memory_state();
    let doc = state
        .coordinator()
        .upload(UploadRequest::new("fox.txt", "text/plain", "The quick brown fox"))
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);
    assert!(!doc.is_indexed);

    wait_for_events(&state, 1).await;
    assert_eq!(state.indexer().drain().await.unwrap(), 1);

    let row = state.db().get_document(doc.id).unwrap().unwrap();
    assert_eq!(row.status, DocumentStatus::Active);
    assert!(row.is_indexed);

    let results = state.search().query(&SearchQuery::new("quick fox")).await.unwrap();
    assert_eq!(results.total, 1);
    assert_eq!(results.hits[0].document_id, doc.id);
    assert!(results.hits[0].score > 0.0);
}

#[tokio::test]
async fn test_duplicate_content_is_rejected() {
    let state = memory_state();
    let first = state
        .coordinator()
        .upload(UploadRequest::new("a.txt", "text/plain", "same bytes"))
        .await
        .unwrap();

    let second = state
        .coordinator()
        .upload(UploadRequest::new("b.txt", "text/plain", "same bytes"))
        .await;
    match second {
        Err(Error::Conflict { existing_id }) => assert_eq!(existing_id, first.id),
        other => panic!("expected conflict, got {:?}", other.map(|d| d.id)),
    }

    wait_for_events(&state, 1).await;
    tokio::task::yield_now().await;
    assert_eq!(state.bus().message_count("uploaded"), 1);
}

#[tokio::test]
async fn test_redelivery_indexes_once() {
    let state = memory_state();
    let doc = state
        .coordinator()
        .upload(UploadRequest::new("memo.txt", "text/plain", "quarterly memo"))
        .await
        .unwrap();
    wait_for_events(&state, 1).await;
    state.indexer().drain().await.unwrap();

    let group = state.config().events.indexer_group.clone();
    let partition = state.bus().partition_for(&doc.id.to_string());
    state.bus().rewind(&group, "uploaded", partition, 0);
    assert_eq!(state.indexer().drain().await.unwrap(), 1);

    assert_eq!(state.search().count().await.unwrap(), 1);
    assert_eq!(state.bus().message_count("indexed"), 1);
    assert_eq!(state.search().query(&SearchQuery::new("memo")).await.unwrap().total, 1);
}

struct FakeOcr;

#[async_trait]
impl OcrEngine for FakeOcr {
    fn supports(&self, mime_type: &str) -> bool {
        mime_type.starts_with("image/")
    }

    async fn recognize(&self, _data: &[u8], _mime_type: &str) -> Result<String> {
        Ok("Handwritten   invoice\n\n\n\ntotal due".to_string())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[tokio::test]
async fn test_images_are_indexed_through_ocr() {
    let state = AppState::with_backends(config(), backends(Arc::new(MemoryObjectStore::new()), Arc::new(FakeOcr)));
    let png = b"\x89PNG\r\n\x1a\nfake image body".to_vec();
    let doc = state
        .coordinator()
        .upload(UploadRequest::new("scan.png", "image/png", png))
        .await
        .unwrap();
    wait_for_events(&state, 1).await;
    state.indexer().drain().await.unwrap();

    let row = state.db().get_document(doc.id).unwrap().unwrap();
    assert!(row.is_indexed);

    let partition = state.bus().partition_for(&doc.id.to_string());
    let message = state
        .bus()
        .subscribe("observer", "indexed", partition)
        .unwrap()
        .try_next()
        .unwrap();
    let event: IndexedEvent = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(event.provenance, "ocr");

    let results = state.search().query(&SearchQuery::new("invoice")).await.unwrap();
    assert_eq!(results.total, 1);
}

#[tokio::test]
async fn test_images_without_ocr_are_dead_lettered() {
    let state = memory_state();
    let doc = state
        .coordinator()
        .upload(UploadRequest::new("scan.png", "image/png", b"\x89PNG\r\n\x1a\nbody".to_vec()))
        .await
        .unwrap();
    wait_for_events(&state, 1).await;
    state.indexer().drain().await.unwrap();

    let letters = state.bus().dead_letters("uploaded").unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].retry_count, 1);
    assert_eq!(state.db().get_document(doc.id).unwrap().unwrap().status, DocumentStatus::Failed);
}

/// Object store whose reads fail while `failing` is set
struct FlakyStore {
    inner: MemoryObjectStore,
    failing: AtomicBool,
    reads: Mutex<Vec<Instant>>,
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put(&self, path: &str, data: Bytes, size: u64, content_type: &str) -> Result<()> {
        self.inner.put(path, data, size, content_type).await
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.reads.lock().push(Instant::now());
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::transient("object store unavailable"));
        }
        self.inner.get(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn presign(&self, path: &str, ttl: Duration) -> Result<String> {
        self.inner.presign(path, ttl).await
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.failing.load(Ordering::SeqCst))
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

#[tokio::test]
async fn test_transient_failures_retry_then_dead_letter() {
    let store = Arc::new(FlakyStore {
        inner: MemoryObjectStore::new(),
        failing: AtomicBool::new(true),
        reads: Mutex::new(Vec::new()),
    });
    let state = AppState::with_backends(config(), backends(store.clone(), Arc::new(DisabledOcr)));
    let max_attempts = state.config().indexer.max_attempts;

    let doc = state
        .coordinator()
        .upload(UploadRequest::new("ledger.txt", "text/plain", "general ledger"))
        .await
        .unwrap();
    wait_for_events(&state, 1).await;

    tokio::time::pause();
    state.indexer().drain().await.unwrap();
    tokio::time::resume();

    let reads = store.reads.lock().clone();
    assert_eq!(reads.len(), max_attempts as usize);
    let gaps: Vec<Duration> = reads.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps.windows(2).all(|g| g[1] > g[0]), "backoff not increasing: {:?}", gaps);

    let letters = state.bus().dead_letters("uploaded").unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].retry_count, max_attempts);
    assert_eq!(letters[0].key, doc.id.to_string());
    assert!(letters[0].reason.contains("object store unavailable"));

    let row = state.db().get_document(doc.id).unwrap().unwrap();
    assert!(!row.is_indexed);
    assert_eq!(row.status, DocumentStatus::Failed);
    assert_eq!(row.index_attempts, max_attempts);

    // the store recovers and the dead letter is replayed
    store.failing.store(false, Ordering::SeqCst);
    assert_eq!(state.bus().replay_dead_letters("uploaded").await.unwrap(), 1);
    state.indexer().drain().await.unwrap();

    let row = state.db().get_document(doc.id).unwrap().unwrap();
    assert!(row.is_indexed);
    assert_eq!(row.status, DocumentStatus::Active);
}

/// Object store whose deletes take a while to land
struct SlowDeleteStore {
    inner: MemoryObjectStore,
}

#[async_trait]
impl ObjectStore for SlowDeleteStore {
    async fn put(&self, path: &str, data: Bytes, size: u64, content_type: &str) -> Result<()> {
        self.inner.put(path, data, size, content_type).await
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.inner.get(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn presign(&self, path: &str, ttl: Duration) -> Result<String> {
        self.inner.presign(path, ttl).await
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "slow-delete"
    }
}

#[tokio::test]
async fn test_reupload_during_delete_keeps_its_blob() {
    let store = Arc::new(SlowDeleteStore { inner: MemoryObjectStore::new() });
    let state = AppState::with_backends(config(), backends(store.clone(), Arc::new(DisabledOcr)));
    let first = state
        .coordinator()
        .upload(UploadRequest::new("contract.txt", "text/plain", "signed contract"))
        .await
        .unwrap();

    let delete = state.documents().delete(first.id);
    let reupload = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        state
            .coordinator()
            .upload(UploadRequest::new("contract-v2.txt", "text/plain", "signed contract"))
            .await
    };
    let (deleted, second) = tokio::join!(delete, reupload);
    deleted.unwrap();
    let second = second.unwrap();

    assert!(state.db().get_document(first.id).unwrap().is_none());
    assert!(state.db().get_document(second.id).unwrap().is_some());
    assert_eq!(second.storage_locator, first.storage_locator);
    assert!(store.inner.exists(&second.storage_locator).await.unwrap());
}

#[tokio::test]
async fn test_bulk_upload_counts_every_item() {
    let state = memory_state();
    let mut items: Vec<WorkItem> = (0..5)
        .map(|i| WorkItem::Upload(UploadRequest::new(format!("doc-{}.txt", i), "text/plain", format!("document {}", i))))
        .collect();
    items.push(WorkItem::Upload(UploadRequest::new("empty.txt", "text/plain", Bytes::new())));
    items.push(WorkItem::Upload(UploadRequest::new("tool.exe", "application/x-msdownload", "MZ")));

    let (job, handle) = state.orchestrator().start(JobType::BulkUpload, items, "admin").unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    handle.await.unwrap();

    let done = state.jobs().get(job.id).unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.total, 7);
    assert_eq!(done.completed + done.failed, done.total);
    assert_eq!(done.failed, 2);
    assert!(done.completed_at.is_some());

    wait_for_events(&state, 5).await;
    assert_eq!(state.indexer().drain().await.unwrap(), 5);
    assert_eq!(state.search().count().await.unwrap(), 5);
}

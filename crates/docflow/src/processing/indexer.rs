//! Indexer worker: consumes `uploaded`, extracts, upserts, dead-letters
//!
//! Retries happen in place with exponential backoff, so a document's attempts
//! never overlap with each other. The consumer commits only after the event is
//! settled (indexed, dead-lettered or skipped); anything else is redelivered.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::backoff::RetryPolicy;
use crate::error::{Error, Result};
use crate::events::{publish_json, Consumer, EventBus, Message};
use crate::extraction::{ExtractionPipeline, ExtractionResult, Provenance};
use crate::providers::ObjectStore;
use crate::search::{SearchDocument, SearchEngine};
use crate::storage::DocumentDb;
use crate::types::event::dead_letter_topic;
use crate::types::{DeadLetter, DeletedEvent, Document, DocumentStatus, IndexedEvent, IngestionEvent, Topic};

/// Pause before redelivering an event whose handling hit an infrastructure error
const REDELIVERY_PAUSE: Duration = Duration::from_secs(1);

/// How one delivery was settled
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutcome {
    Indexed { provenance: Provenance, attempts: u32 },
    DeadLettered { reason: String, attempts: u32 },
    Skipped(&'static str),
}

/// Removes a document from the in-flight set when its handling ends
struct InFlight<'a> {
    set: &'a DashMap<Uuid, ()>,
    id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

pub struct IndexerWorker {
    bus: EventBus,
    store: Arc<dyn ObjectStore>,
    pipeline: Arc<ExtractionPipeline>,
    search: Arc<dyn SearchEngine>,
    db: DocumentDb,
    policy: RetryPolicy,
    group: String,
    in_flight: DashMap<Uuid, ()>,
}

impl IndexerWorker {
    pub fn new(
        bus: EventBus,
        store: Arc<dyn ObjectStore>,
        pipeline: Arc<ExtractionPipeline>,
        search: Arc<dyn SearchEngine>,
        db: DocumentDb,
        policy: RetryPolicy,
        group: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            store,
            pipeline,
            search,
            db,
            policy,
            group: group.into(),
            in_flight: DashMap::new(),
        }
    }

    /// Start one consumer loop per partition for `uploaded` and `deleted`
    pub fn spawn(self: Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        for partition in 0..self.bus.partitions() {
            let consumer = self.bus.subscribe(&self.group, Topic::Uploaded.as_str(), partition)?;
            let worker = Arc::clone(&self);
            handles.push(tokio::spawn(async move { worker.run_uploaded(consumer).await }));

            let consumer = self.bus.subscribe(&self.group, Topic::Deleted.as_str(), partition)?;
            let worker = Arc::clone(&self);
            handles.push(tokio::spawn(async move { worker.run_deleted(consumer).await }));
        }

        tracing::info!(
            group = %self.group,
            partitions = self.bus.partitions(),
            max_attempts = self.policy.max_attempts,
            "Indexer workers started"
        );
        Ok(handles)
    }

    async fn run_uploaded(&self, consumer: Consumer) {
        loop {
            let message = consumer.next().await;
            match self.handle_delivery(&message).await {
                Ok(outcome) => {
                    tracing::debug!(key = %message.key, offset = message.offset, ?outcome, "Settled ingestion event");
                    consumer.commit(&message);
                }
                Err(e) => {
                    tracing::error!(
                        key = %message.key,
                        partition = consumer.partition(),
                        error = %e,
                        "Could not settle ingestion event, will redeliver"
                    );
                    tokio::time::sleep(REDELIVERY_PAUSE).await;
                }
            }
        }
    }

    async fn run_deleted(&self, consumer: Consumer) {
        loop {
            let message = consumer.next().await;
            match self.handle_deleted(&message).await {
                Ok(()) => consumer.commit(&message),
                Err(e) => {
                    tracing::error!(key = %message.key, error = %e, "Could not apply delete event, will redeliver");
                    tokio::time::sleep(REDELIVERY_PAUSE).await;
                }
            }
        }
    }

    /// Settle every `uploaded` event currently waiting for this group
    ///
    /// Returns how many events were settled.
    pub async fn drain(&self) -> Result<usize> {
        let mut settled = 0;
        for partition in 0..self.bus.partitions() {
            let consumer = self.bus.subscribe(&self.group, Topic::Uploaded.as_str(), partition)?;
            while let Some(message) = consumer.try_next() {
                self.handle_delivery(&message).await?;
                consumer.commit(&message);
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Handle one delivery of an ingestion event
    ///
    /// An `Err` means the event could not be settled and must be redelivered.
    pub async fn handle_delivery(&self, message: &Message) -> Result<IndexOutcome> {
        let event: IngestionEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                let reason = format!("Malformed ingestion event: {}", e);
                self.dead_letter(message, &reason, 0).await?;
                return Ok(IndexOutcome::DeadLettered { reason, attempts: 0 });
            }
        };
        let id = event.document_id;

        let Some(doc) = self.db.get_document(id)? else {
            tracing::debug!(document_id = %id, "Document gone before indexing");
            return Ok(IndexOutcome::Skipped("document no longer exists"));
        };
        if doc.is_indexed {
            return Ok(IndexOutcome::Skipped("already indexed"));
        }

        if self.in_flight.insert(id, ()).is_some() {
            return Ok(IndexOutcome::Skipped("already in flight"));
        }
        let _guard = InFlight { set: &self.in_flight, id };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.index_once(&event, &doc).await {
                Ok(result) => {
                    if !self.db.mark_indexed(id)? {
                        // deleted while extracting; the delete consumer may already have run
                        self.search.delete(id).await?;
                        tracing::info!(document_id = %id, "Document deleted during indexing, entry removed");
                        return Ok(IndexOutcome::Skipped("document deleted during indexing"));
                    }
                    let indexed = IndexedEvent {
                        document_id: id,
                        provenance: result.provenance.as_str().to_string(),
                        text_length: result.text.len(),
                        attempts: attempt,
                        indexed_at: Utc::now(),
                    };
                    if let Err(e) = publish_json(&self.bus, Topic::Indexed.as_str(), &id.to_string(), &indexed).await {
                        tracing::warn!(document_id = %id, error = %e, "Failed to publish indexed event");
                    }

                    tracing::info!(
                        document_id = %id,
                        attempts = attempt,
                        provenance = result.provenance.as_str(),
                        extractor = %result.extractor,
                        chars = result.text.len(),
                        "Document indexed"
                    );
                    return Ok(IndexOutcome::Indexed {
                        provenance: result.provenance,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_retryable() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_for(attempt);
                    self.db.record_index_attempt(id, &e.to_string())?;
                    tracing::warn!(
                        document_id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Indexing failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.dead_letter(message, &reason, attempt).await?;
                    self.db.mark_failed(id, &reason)?;
                    return Ok(IndexOutcome::DeadLettered { reason, attempts: attempt });
                }
            }
        }
    }

    async fn index_once(&self, event: &IngestionEvent, doc: &Document) -> Result<ExtractionResult> {
        let data = self.store.get(&event.storage_locator).await.map_err(|e| {
            Error::transient(format!("Failed to download {}: {}", event.storage_locator, e))
        })?;

        let result = self.pipeline.extract(&event.mime_type, data).await?;

        let entry = SearchDocument {
            title: event.title.clone(),
            content: result.text.clone(),
            file_type: doc.file_type.as_str().to_string(),
            status: DocumentStatus::Active.as_str().to_string(),
            collection_id: event.collection_id.clone(),
            uploader_id: event.uploader_id.clone(),
            created_at: event.created_at,
        };
        self.search
            .upsert(event.document_id, &entry)
            .await
            .map_err(|e| match e {
                e if e.is_retryable() => e,
                e => Error::transient(format!("Search engine upsert failed: {}", e)),
            })?;

        Ok(result)
    }

    async fn dead_letter(&self, message: &Message, reason: &str, retry_count: u32) -> Result<()> {
        let payload = serde_json::from_slice(&message.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
        });
        let envelope = DeadLetter {
            topic: message.topic.clone(),
            key: message.key.clone(),
            payload,
            reason: reason.to_string(),
            retry_count,
            failed_at: Utc::now(),
        };
        publish_json(&self.bus, &dead_letter_topic(&message.topic), &message.key, &envelope).await?;

        tracing::error!(key = %message.key, retry_count, reason, "Event dead-lettered");
        Ok(())
    }

    /// Remove the index entry of a deleted document; missing entries are fine
    pub async fn handle_deleted(&self, message: &Message) -> Result<()> {
        let event: DeletedEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                self.dead_letter(message, &format!("Malformed delete event: {}", e), 0).await?;
                return Ok(());
            }
        };
        let removed = self.search.delete(event.document_id).await?;
        tracing::debug!(document_id = %event.document_id, removed, "Applied delete event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtractionConfig, SearchConfig};
    use crate::events::EventPublisher;
    use crate::extraction::{DisabledOcr, ExtractorRegistry, OcrEngine};
    use crate::ingestion::content_hash;
    use crate::providers::object_store::content_path;
    use crate::providers::MemoryObjectStore;
    use crate::search::{FtsSearchEngine, SearchQuery};
    use crate::types::NewDocument;
    use bytes::Bytes;
    use std::collections::HashMap;

    struct Harness {
        bus: EventBus,
        store: Arc<MemoryObjectStore>,
        search: Arc<FtsSearchEngine>,
        db: DocumentDb,
        worker: IndexerWorker,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryObjectStore::new());
        harness_with(store.clone(), store, DocumentDb::in_memory().unwrap(), Arc::new(DisabledOcr))
    }

    /// The worker reads through `reader`; fixtures write into `store`
    fn harness_with(
        reader: Arc<dyn ObjectStore>,
        store: Arc<MemoryObjectStore>,
        db: DocumentDb,
        ocr: Arc<dyn OcrEngine>,
    ) -> Harness {
        let bus = EventBus::new(2);
        let search = Arc::new(FtsSearchEngine::in_memory(&SearchConfig::default()).unwrap());
        let pipeline = Arc::new(ExtractionPipeline::new(
            Arc::new(ExtractorRegistry::with_defaults()),
            ocr,
            &ExtractionConfig::default(),
        ));
        let worker = IndexerWorker::new(
            bus.clone(),
            reader,
            pipeline,
            search.clone(),
            db.clone(),
            RetryPolicy {
                max_attempts: 3,
                base: Duration::from_millis(1),
                cap: Duration::from_millis(10),
            },
            "indexer",
        );
        Harness { bus, store, search, db, worker }
    }

    async fn stored_document(h: &Harness, mime: &str, body: &[u8]) -> Document {
        let hash = content_hash(body);
        let doc = Document::pending(NewDocument {
            id: Uuid::new_v4(),
            storage_locator: content_path(&hash),
            content_hash: hash,
            mime_type: mime.to_string(),
            file_size: body.len() as u64,
            filename: "note.txt".to_string(),
            title: "Note".to_string(),
            description: None,
            uploader_id: "u1".to_string(),
            collection_id: None,
            metadata: HashMap::new(),
        });
        h.db.insert_document(&doc).unwrap();
        h.store
            .put(&doc.storage_locator, Bytes::copy_from_slice(body), body.len() as u64, mime)
            .await
            .unwrap();
        doc
    }

    async fn deliver(h: &Harness, doc: &Document) -> Message {
        let receipt = publish_json(&h.bus, "uploaded", &doc.id.to_string(), &IngestionEvent::from(doc))
            .await
            .unwrap();
        h.bus
            .subscribe("test", "uploaded", receipt.partition)
            .unwrap()
            .try_next()
            .unwrap()
    }

    #[tokio::test]
    async fn test_indexes_and_marks_active() {
        let h = harness();
        let doc = stored_document(&h, "text/plain", b"The quick brown fox").await;
        let message = deliver(&h, &doc).await;

        let outcome = h.worker.handle_delivery(&message).await.unwrap();
        assert_eq!(
            outcome,
            IndexOutcome::Indexed { provenance: Provenance::Native, attempts: 1 }
        );

        let row = h.db.get_document(doc.id).unwrap().unwrap();
        assert!(row.is_indexed);
        assert_eq!(row.status, DocumentStatus::Active);
        assert_eq!(h.bus.message_count("indexed"), 1);
        assert_eq!(h.search.query(&SearchQuery::new("fox")).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_dead_letters_without_retry() {
        let h = harness();
        let doc = stored_document(&h, "application/x-unknown", b"\x00\x01").await;
        let message = deliver(&h, &doc).await;

        let outcome = h.worker.handle_delivery(&message).await.unwrap();
        assert!(matches!(outcome, IndexOutcome::DeadLettered { attempts: 1, .. }));

        let letters = h.bus.dead_letters("uploaded").unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].retry_count, 1);
        assert_eq!(letters[0].payload, serde_json::from_slice::<serde_json::Value>(&message.payload).unwrap());

        let row = h.db.get_document(doc.id).unwrap().unwrap();
        assert!(!row.is_indexed);
        assert_eq!(row.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered() {
        let h = harness();
        h.bus.publish("uploaded", "bogus", b"not json".to_vec()).await.unwrap();
        assert_eq!(h.worker.drain().await.unwrap(), 1);

        let letters = h.bus.dead_letters("uploaded").unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, serde_json::json!("not json"));
    }

    #[tokio::test]
    async fn test_missing_document_is_skipped() {
        let h = harness();
        let doc = stored_document(&h, "text/plain", b"gone soon").await;
        let message = deliver(&h, &doc).await;
        h.db.delete_document(doc.id).unwrap();

        let outcome = h.worker.handle_delivery(&message).await.unwrap();
        assert!(matches!(outcome, IndexOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_delete_event_removes_index_entry() {
        let h = harness();
        let doc = stored_document(&h, "text/plain", b"ephemeral words").await;
        h.worker.handle_delivery(&deliver(&h, &doc).await).await.unwrap();
        assert_eq!(h.search.count().await.unwrap(), 1);

        let event = DeletedEvent {
            document_id: doc.id,
            storage_locator: doc.storage_locator.clone(),
            deleted_at: Utc::now(),
        };
        let receipt = publish_json(&h.bus, "deleted", &doc.id.to_string(), &event).await.unwrap();
        let message = h.bus.subscribe("test", "deleted", receipt.partition).unwrap().try_next().unwrap();

        h.worker.handle_deleted(&message).await.unwrap();
        h.worker.handle_deleted(&message).await.unwrap();
        assert_eq!(h.search.count().await.unwrap(), 0);
    }

    /// Deletes the document row as soon as its bytes are read
    struct DeletingStore {
        inner: Arc<MemoryObjectStore>,
        db: DocumentDb,
        victim: parking_lot::Mutex<Option<Uuid>>,
    }

    #[async_trait::async_trait]
    impl ObjectStore for DeletingStore {
        async fn put(&self, path: &str, data: Bytes, size: u64, content_type: &str) -> Result<()> {
            self.inner.put(path, data, size, content_type).await
        }
        async fn get(&self, path: &str) -> Result<Bytes> {
            if let Some(id) = self.victim.lock().take() {
                self.db.delete_document(id)?;
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
            Ok(true)
        }
        fn name(&self) -> &str {
            "deleting"
        }
    }

    #[tokio::test]
    async fn test_document_deleted_mid_indexing_leaves_no_entry() {
        let memory = Arc::new(MemoryObjectStore::new());
        let db = DocumentDb::in_memory().unwrap();
        let reader = Arc::new(DeletingStore {
            inner: memory.clone(),
            db: db.clone(),
            victim: parking_lot::Mutex::new(None),
        });
        let h = harness_with(reader.clone(), memory, db, Arc::new(DisabledOcr));

        let doc = stored_document(&h, "text/plain", b"short lived memo").await;
        *reader.victim.lock() = Some(doc.id);
        let message = deliver(&h, &doc).await;

        let outcome = h.worker.handle_delivery(&message).await.unwrap();
        assert!(matches!(outcome, IndexOutcome::Skipped(_)));
        assert!(h.db.get_document(doc.id).unwrap().is_none());
        assert_eq!(h.search.query(&SearchQuery::new("memo")).await.unwrap().total, 0);
        assert_eq!(h.bus.message_count("indexed"), 0);
    }

    struct StalledOcr;

    #[async_trait::async_trait]
    impl OcrEngine for StalledOcr {
        fn supports(&self, mime_type: &str) -> bool {
            mime_type.starts_with("image/")
        }
        async fn recognize(&self, _data: &[u8], _mime_type: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
            Ok(String::new())
        }
        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ocr_timeout_is_retried_then_dead_lettered() {
        let store = Arc::new(MemoryObjectStore::new());
        let h = harness_with(store.clone(), store, DocumentDb::in_memory().unwrap(), Arc::new(StalledOcr));
        let doc = stored_document(&h, "image/png", b"\x89PNG\r\n\x1a\nscan").await;
        let message = deliver(&h, &doc).await;

        let outcome = h.worker.handle_delivery(&message).await.unwrap();
        match outcome {
            IndexOutcome::DeadLettered { reason, attempts } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("timed out"), "{}", reason);
            }
            other => panic!("expected dead letter, got {:?}", other),
        }

        let row = h.db.get_document(doc.id).unwrap().unwrap();
        assert_eq!(row.index_attempts, 3);
        assert_eq!(row.status, DocumentStatus::Failed);
        assert_eq!(h.bus.dead_letters("uploaded").unwrap()[0].retry_count, 3);
    }
}

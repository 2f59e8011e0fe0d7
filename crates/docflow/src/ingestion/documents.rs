//! Document lifecycle after upload: read, delete, re-index, counters

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::locks::ContentLocks;
use crate::error::{Error, Result};
use crate::events::{publish_json, EventPublisher};
use crate::providers::ObjectStore;
use crate::search::SearchEngine;
use crate::storage::DocumentDb;
use crate::types::{DeletedEvent, Document, IngestionEvent, Topic};

pub struct DocumentService {
    db: DocumentDb,
    store: Arc<dyn ObjectStore>,
    search: Arc<dyn SearchEngine>,
    publisher: Arc<dyn EventPublisher>,
    locks: ContentLocks,
}

impl DocumentService {
    pub fn new(
        db: DocumentDb,
        store: Arc<dyn ObjectStore>,
        search: Arc<dyn SearchEngine>,
        publisher: Arc<dyn EventPublisher>,
        locks: ContentLocks,
    ) -> Self {
        Self {
            db,
            store,
            search,
            publisher,
            locks,
        }
    }

    pub fn get(&self, id: Uuid) -> Result<Document> {
        self.db
            .get_document(id)?
            .ok_or_else(|| Error::not_found(format!("Document {}", id)))
    }

    /// Remove a document everywhere and announce it on `deleted`
    ///
    /// The row goes first so a visible row always has its bytes; blob and
    /// index cleanup after that is best-effort. The blob is shared by key with
    /// any later upload of the same bytes, so it is kept while another row
    /// holds the hash.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let doc = self.get(id)?;
        let hash_lock = self.locks.lock(&doc.content_hash).await;
        if !self.db.delete_document(id)? {
            return Err(Error::not_found(format!("Document {}", id)));
        }

        match self.db.find_by_hash(&doc.content_hash)? {
            Some(owner) => {
                tracing::info!(document_id = %id, owner = %owner.id, "Blob now belongs to another document, kept");
            }
            None => {
                if let Err(e) = self.store.delete(&doc.storage_locator).await {
                    tracing::warn!(document_id = %id, error = %e, "Failed to delete blob");
                }
            }
        }
        drop(hash_lock);

        if let Some(thumbnail) = &doc.thumbnail_locator {
            if let Err(e) = self.store.delete(thumbnail).await {
                tracing::warn!(document_id = %id, error = %e, "Failed to delete thumbnail");
            }
        }
        if let Err(e) = self.search.delete(id).await {
            // the deleted-event consumer retries this
            tracing::warn!(document_id = %id, error = %e, "Failed to remove index entry");
        }

        let event = DeletedEvent {
            document_id: id,
            storage_locator: doc.storage_locator.clone(),
            deleted_at: Utc::now(),
        };
        if let Err(e) = publish_json(self.publisher.as_ref(), Topic::Deleted.as_str(), &id.to_string(), &event).await {
            tracing::warn!(document_id = %id, error = %e, "Failed to publish delete event");
        }

        tracing::info!(document_id = %id, filename = %doc.filename, "Document deleted");
        Ok(())
    }

    /// Put a document back to `pending` and re-emit its ingestion event
    pub async fn reindex(&self, id: Uuid) -> Result<Document> {
        if !self.db.reset_for_reindex(id)? {
            return Err(Error::not_found(format!("Document {}", id)));
        }
        let doc = self.get(id)?;
        publish_json(
            self.publisher.as_ref(),
            Topic::Uploaded.as_str(),
            &id.to_string(),
            &IngestionEvent::from(&doc),
        )
        .await?;

        tracing::info!(document_id = %id, "Re-indexing requested");
        Ok(doc)
    }

    /// Merge metadata keys; `null` values remove keys
    pub async fn update_metadata(
        &self,
        id: Uuid,
        patch: &HashMap<String, serde_json::Value>,
    ) -> Result<Document> {
        self.db
            .update_metadata(id, patch)?
            .ok_or_else(|| Error::not_found(format!("Document {}", id)))
    }

    pub fn record_view(&self, id: Uuid) -> Result<()> {
        if !self.db.increment_view_count(id)? {
            return Err(Error::not_found(format!("Document {}", id)));
        }
        Ok(())
    }

    /// Presigned download URL; counts as a download
    pub async fn download_url(&self, id: Uuid, ttl: Duration) -> Result<String> {
        let doc = self.get(id)?;
        let url = self.store.presign(&doc.storage_locator, ttl).await?;
        self.record_download(id)?;
        Ok(url)
    }

    pub fn record_download(&self, id: Uuid) -> Result<()> {
        if !self.db.increment_download_count(id)? {
            return Err(Error::not_found(format!("Document {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::events::EventBus;
    use crate::ingestion::content_hash;
    use crate::providers::object_store::content_path;
    use crate::providers::MemoryObjectStore;
    use crate::search::{FtsSearchEngine, SearchDocument};
    use crate::types::{DocumentStatus, NewDocument};
    use bytes::Bytes;

    struct Fixture {
        service: DocumentService,
        db: DocumentDb,
        store: Arc<MemoryObjectStore>,
        search: Arc<FtsSearchEngine>,
        bus: EventBus,
    }

    fn fixture() -> Fixture {
        let db = DocumentDb::in_memory().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let search = Arc::new(FtsSearchEngine::in_memory(&SearchConfig::default()).unwrap());
        let bus = EventBus::new(1);
        let service = DocumentService::new(db.clone(), store.clone(), search.clone(), Arc::new(bus.clone()), ContentLocks::new());
        Fixture { service, db, store, search, bus }
    }

    async fn indexed_document(f: &Fixture) -> Document {
        let body = b"annual report";
        let hash = content_hash(body);
        let doc = Document::pending(NewDocument {
            id: Uuid::new_v4(),
            storage_locator: content_path(&hash),
            content_hash: hash,
            mime_type: "text/plain".to_string(),
            file_size: body.len() as u64,
            filename: "report.txt".to_string(),
            title: "report".to_string(),
            description: None,
            uploader_id: "u1".to_string(),
            collection_id: None,
            metadata: HashMap::new(),
        });
        f.db.insert_document(&doc).unwrap();
        f.store
            .put(&doc.storage_locator, Bytes::from_static(body), body.len() as u64, "text/plain")
            .await
            .unwrap();
        f.search
            .upsert(
                doc.id,
                &SearchDocument {
                    title: doc.title.clone(),
                    content: "annual report".to_string(),
                    file_type: "txt".to_string(),
                    status: "active".to_string(),
                    collection_id: None,
                    uploader_id: "u1".to_string(),
                    created_at: doc.created_at,
                },
            )
            .await
            .unwrap();
        f.db.mark_indexed(doc.id).unwrap();
        doc
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let f = fixture();
        let doc = indexed_document(&f).await;

        f.service.delete(doc.id).await.unwrap();
        assert!(f.db.get_document(doc.id).unwrap().is_none());
        assert!(f.store.is_empty());
        assert_eq!(f.search.count().await.unwrap(), 0);
        assert_eq!(f.bus.message_count("deleted"), 1);

        assert!(matches!(f.service.delete(doc.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reindex_resets_and_emits() {
        let f = fixture();
        let doc = indexed_document(&f).await;

        let reset = f.service.reindex(doc.id).await.unwrap();
        assert_eq!(reset.status, DocumentStatus::Pending);
        assert!(!reset.is_indexed);
        assert_eq!(f.bus.message_count("uploaded"), 1);
    }

    #[tokio::test]
    async fn test_counters_and_metadata() {
        let f = fixture();
        let doc = indexed_document(&f).await;

        f.service.record_view(doc.id).unwrap();
        f.service.record_view(doc.id).unwrap();
        let url = f.service.download_url(doc.id, Duration::from_secs(60)).await.unwrap();
        assert!(!url.is_empty());

        let patch = HashMap::from([("department".to_string(), serde_json::json!("finance"))]);
        let updated = f.service.update_metadata(doc.id, &patch).await.unwrap();
        assert_eq!(updated.view_count, 2);
        assert_eq!(updated.download_count, 1);
        assert_eq!(updated.metadata["department"], "finance");

        assert!(f.service.record_view(Uuid::new_v4()).is_err());
    }
}

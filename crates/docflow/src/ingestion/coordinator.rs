//! Upload coordinator: validate, scan, dedup, persist, emit
//!
//! The metadata row is written before the blob, and removed again if the blob
//! cannot be stored or the upload is abandoned halfway, so a visible row always
//! has retrievable bytes. Thumbnail generation and event emission run detached
//! and never fail an upload.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use super::hasher::content_hash;
use super::locks::ContentLocks;
use crate::config::{UnavailablePolicy, UploadConfig};
use crate::error::{Error, Result};
use crate::events::{publish_json, EventPublisher};
use crate::providers::object_store::{content_path, thumbnail_path};
use crate::providers::{ObjectStore, ScanVerdict, ThumbnailGenerator, VirusScanner};
use crate::storage::DocumentDb;
use crate::types::{Document, IngestionEvent, NewDocument, Topic};

const OCTET_STREAM: &str = "application/octet-stream";

/// One file to ingest
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    /// Declared content type; parameters and case are ignored
    pub mime_type: String,
    pub data: Bytes,
    /// Defaults to the filename without its extension
    pub title: Option<String>,
    pub description: Option<String>,
    pub uploader_id: String,
    pub collection_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl UploadRequest {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            data: data.into(),
            title: None,
            description: None,
            uploader_id: "anonymous".to_string(),
            collection_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn uploaded_by(mut self, uploader_id: impl Into<String>) -> Self {
        self.uploader_id = uploader_id.into();
        self
    }
}

/// Lowercase essence of a declared mime type, guessed from the filename when
/// the client sent nothing useful
pub fn normalize_mime(declared: &str, filename: &str) -> String {
    let essence = declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if essence.is_empty() || essence == OCTET_STREAM {
        mime_guess::from_path(filename)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| OCTET_STREAM.to_string())
    } else {
        essence
    }
}

fn title_from_filename(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.trim().is_empty())
        .unwrap_or_else(|| filename.to_string())
}

pub struct UploadCoordinator {
    config: UploadConfig,
    on_scanner_unavailable: UnavailablePolicy,
    scanner: Arc<dyn VirusScanner>,
    store: Arc<dyn ObjectStore>,
    db: DocumentDb,
    thumbnailer: Arc<dyn ThumbnailGenerator>,
    publisher: Arc<dyn EventPublisher>,
    locks: ContentLocks,
}

/// Deletes a freshly inserted row unless disarmed
///
/// Covers both a failed blob write and the upload future being dropped.
struct PendingRow<'a> {
    db: &'a DocumentDb,
    id: Uuid,
    armed: bool,
}

impl PendingRow<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRow<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.db.delete_document(self.id) {
            Ok(_) => tracing::warn!(document_id = %self.id, "Rolled back document row without a stored blob"),
            Err(e) => tracing::error!(document_id = %self.id, error = %e, "Rollback of document row failed"),
        }
    }
}

impl UploadCoordinator {
    pub fn new(
        config: UploadConfig,
        on_scanner_unavailable: UnavailablePolicy,
        scanner: Arc<dyn VirusScanner>,
        store: Arc<dyn ObjectStore>,
        db: DocumentDb,
        thumbnailer: Arc<dyn ThumbnailGenerator>,
        publisher: Arc<dyn EventPublisher>,
        locks: ContentLocks,
    ) -> Self {
        if !scanner.is_enabled() {
            tracing::warn!("Virus scanning is disabled; uploads will be accepted unscanned");
        } else if on_scanner_unavailable == UnavailablePolicy::Allow {
            tracing::warn!(
                scanner = scanner.name(),
                "Uploads will be accepted unscanned while the scanner is unreachable"
            );
        }

        Self {
            config,
            on_scanner_unavailable,
            scanner,
            store,
            db,
            thumbnailer,
            publisher,
            locks,
        }
    }

    pub fn max_upload_size(&self) -> usize {
        self.config.max_upload_size
    }

    /// Ingest one file, returning the new `pending` document
    ///
    /// Validation and conflict errors leave nothing behind.
    pub async fn upload(&self, request: UploadRequest) -> Result<Document> {
        if request.data.is_empty() {
            return Err(Error::validation(format!("{} is empty", request.filename)));
        }
        if request.data.len() > self.config.max_upload_size {
            return Err(Error::validation(format!(
                "{} is {} bytes, limit is {}",
                request.filename,
                request.data.len(),
                self.config.max_upload_size
            )));
        }

        let mime_type = normalize_mime(&request.mime_type, &request.filename);
        if !self.config.allowed_mime_types.iter().any(|allowed| *allowed == mime_type) {
            return Err(Error::validation(format!(
                "File type {} is not allowed",
                mime_type
            )));
        }

        let hash = content_hash(&request.data);
        self.scan(&request.data, &request.filename).await?;

        let _hash_lock = self.locks.lock(&hash).await;
        if let Some(existing) = self.db.find_by_hash(&hash)? {
            tracing::info!(existing_id = %existing.id, filename = %request.filename, "Duplicate upload rejected");
            return Err(Error::Conflict { existing_id: existing.id });
        }

        let title = request
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| title_from_filename(&request.filename));
        let doc = Document::pending(NewDocument {
            id: Uuid::new_v4(),
            storage_locator: content_path(&hash),
            content_hash: hash,
            mime_type: mime_type.clone(),
            file_size: request.data.len() as u64,
            filename: request.filename,
            title,
            description: request.description,
            uploader_id: request.uploader_id,
            collection_id: request.collection_id,
            metadata: request.metadata,
        });

        // the unique hash constraint is authoritative for concurrent duplicates
        self.db.insert_document(&doc)?;
        let row = PendingRow {
            db: &self.db,
            id: doc.id,
            armed: true,
        };

        if let Err(e) = self
            .store
            .put(&doc.storage_locator, request.data.clone(), doc.file_size, &mime_type)
            .await
        {
            tracing::error!(document_id = %doc.id, error = %e, "Blob upload failed, rolling back");
            return Err(Error::transient(format!("Failed to store {}: {}", doc.filename, e)));
        }
        row.disarm();

        self.spawn_thumbnail(doc.id, request.data, mime_type);
        self.spawn_emit(IngestionEvent::from(&doc));

        tracing::info!(
            document_id = %doc.id,
            filename = %doc.filename,
            mime_type = %doc.mime_type,
            size = doc.file_size,
            "Document stored"
        );
        Ok(doc)
    }

    async fn scan(&self, data: &[u8], filename: &str) -> Result<()> {
        match self.scanner.scan(data, filename).await {
            Ok(ScanVerdict::Clean) => Ok(()),
            Ok(ScanVerdict::Infected(signature)) => {
                tracing::warn!(filename, signature = %signature, "Infected upload rejected");
                Err(Error::validation(format!(
                    "{} rejected: malware detected ({})",
                    filename, signature
                )))
            }
            Err(e) => match self.on_scanner_unavailable {
                UnavailablePolicy::Reject => Err(Error::transient(format!(
                    "Virus scanner unavailable: {}",
                    e
                ))),
                UnavailablePolicy::Allow => {
                    tracing::warn!(filename, error = %e, "Scanner unavailable; accepting upload unscanned");
                    Ok(())
                }
            },
        }
    }

    fn spawn_thumbnail(&self, id: Uuid, data: Bytes, mime_type: String) {
        let thumbnailer = Arc::clone(&self.thumbnailer);
        let store = Arc::clone(&self.store);
        let db = self.db.clone();

        tokio::spawn(async move {
            let png = match thumbnailer.generate(&data, &mime_type).await {
                Ok(Some(png)) => png,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(document_id = %id, error = %e, "Thumbnail generation failed");
                    return;
                }
            };

            let path = thumbnail_path(&id);
            let size = png.len() as u64;
            if let Err(e) = store.put(&path, Bytes::from(png), size, "image/png").await {
                tracing::warn!(document_id = %id, error = %e, "Failed to store thumbnail");
                return;
            }

            match db.set_thumbnail(id, &path) {
                Ok(true) => tracing::debug!(document_id = %id, "Thumbnail stored"),
                Ok(false) => {
                    // document deleted meanwhile
                    if let Err(e) = store.delete(&path).await {
                        tracing::warn!(document_id = %id, error = %e, "Failed to remove orphaned thumbnail");
                    }
                }
                Err(e) => tracing::warn!(document_id = %id, error = %e, "Failed to record thumbnail"),
            }
        });
    }

    fn spawn_emit(&self, event: IngestionEvent) {
        let publisher = Arc::clone(&self.publisher);
        tokio::spawn(async move {
            let key = event.document_id.to_string();
            if let Err(e) = publish_json(publisher.as_ref(), Topic::Uploaded.as_str(), &key, &event).await {
                tracing::warn!(
                    document_id = %event.document_id,
                    error = %e,
                    "Failed to emit ingestion event; reconciliation will re-emit it"
                );
            }
        });
    }
}

//! API routes for docflow

pub mod documents;
pub mod jobs;
pub mod search;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::{Error, Result};
use crate::ingestion::UploadRequest;
use crate::server::state::AppState;
use crate::types::Topic;

/// Header naming the caller; unauthenticated requests are "anonymous"
pub const UPLOADER_HEADER: &str = "x-uploader-id";

/// Files of maximum size a bulk upload body may carry
const BULK_UPLOAD_FILES: usize = 32;

/// Build all API routes
pub fn api_routes(max_upload_size: usize) -> Router<AppState> {
    // multipart framing on top of the file itself
    let body_limit = DefaultBodyLimit::max(max_upload_size.saturating_add(64 * 1024));

    Router::new()
        .route(
            "/documents",
            post(documents::upload_document).layer(body_limit),
        )
        .route(
            "/documents/:id",
            get(documents::get_document)
                .patch(documents::update_metadata)
                .delete(documents::delete_document),
        )
        .route("/documents/:id/reindex", post(documents::reindex_document))
        .route("/documents/:id/download", get(documents::download_document))
        .route("/search", get(search::search))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route(
            "/jobs/bulk-upload",
            post(jobs::bulk_upload).layer(
                ServiceBuilder::new()
                    .layer(RequestBodyLimitLayer::new(max_upload_size.saturating_mul(BULK_UPLOAD_FILES)))
                    .layer(DefaultBodyLimit::disable()),
            ),
        )
        .route("/jobs/bulk-update", post(jobs::bulk_update))
        .route("/jobs/bulk-delete", post(jobs::bulk_delete))
        .route("/dead-letters/:topic", get(jobs::list_dead_letters))
        .route("/dead-letters/:topic/replay", post(jobs::replay_dead_letters))
        .route("/stats", get(stats))
        .route("/info", get(info))
}

/// Caller identity from `x-uploader-id`
pub(crate) fn uploader_id(headers: &HeaderMap) -> String {
    headers
        .get(UPLOADER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

/// A file part of a multipart upload
pub(crate) struct FilePart {
    pub filename: String,
    pub content_type: String,
    pub data: Bytes,
}

impl FilePart {
    pub fn into_request(self, uploader: &str, fields: &HashMap<String, String>) -> Result<UploadRequest> {
        let mut request = UploadRequest::new(self.filename, self.content_type, self.data).uploaded_by(uploader);
        request.title = fields.get("title").cloned();
        request.description = fields.get("description").cloned();
        request.collection_id = fields.get("collection_id").cloned();
        if let Some(raw) = fields.get("metadata") {
            request.metadata = serde_json::from_str(raw)
                .map_err(|e| Error::validation(format!("metadata must be a JSON object: {}", e)))?;
        }
        Ok(request)
    }
}

/// Split a multipart body into file parts and plain text fields
pub(crate) async fn read_multipart(mut multipart: Multipart) -> Result<(Vec<FilePart>, HashMap<String, String>)> {
    let mut files = Vec::new();
    let mut fields = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::validation(format!("Failed to read multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match field.file_name().map(str::to_string) {
            Some(filename) => {
                let content_type = field.content_type().unwrap_or("").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::validation(format!("Failed to read {}: {}", filename, e)))?;
                files.push(FilePart {
                    filename,
                    content_type,
                    data,
                });
            }
            None => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::validation(format!("Failed to read field {}: {}", name, e)))?;
                fields.insert(name, value);
            }
        }
    }

    Ok((files, fields))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub documents: HashMap<String, usize>,
    pub indexed_entries: usize,
    /// Ingestion events not yet settled by the indexer
    pub indexer_lag: usize,
    pub dead_letters: usize,
}

/// GET /api/stats
async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let documents = state
        .db()
        .count_by_status()?
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), count))
        .collect();
    let indexed_entries = state.search().count().await?;
    let bus = state.bus();

    Ok(Json(StatsResponse {
        documents,
        indexed_entries,
        indexer_lag: bus.lag(&state.config().events.indexer_group, Topic::Uploaded.as_str()),
        dead_letters: bus.retained_count(&Topic::Uploaded.dead_letter()),
    }))
}

/// API info endpoint
async fn info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "docflow",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /api/documents": "Upload one document (multipart)",
            "GET /api/documents/:id": "Document metadata",
            "PATCH /api/documents/:id": "Merge metadata keys",
            "DELETE /api/documents/:id": "Delete a document",
            "POST /api/documents/:id/reindex": "Re-run extraction and indexing",
            "GET /api/documents/:id/download": "Presigned download URL",
            "GET /api/search?q=": "Full-text search with facets",
            "POST /api/jobs/bulk-upload": "Bulk upload (multipart)",
            "POST /api/jobs/bulk-update": "Bulk metadata update",
            "POST /api/jobs/bulk-delete": "Bulk delete",
            "GET /api/jobs/:id": "Job progress",
            "GET /api/dead-letters/:topic": "Dead-lettered events",
            "POST /api/dead-letters/:topic/replay": "Replay dead-lettered events"
        }
    }))
}

//! Single-document endpoints

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::{read_multipart, uploader_id};
use crate::error::{Error, Result};
use crate::server::state::AppState;
use crate::types::Document;

/// POST /api/documents - upload one file
///
/// Text fields `title`, `description`, `collection_id` and `metadata` (a JSON
/// object) may accompany the file part.
pub async fn upload_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Document>)> {
    let (mut files, fields) = read_multipart(multipart).await?;
    let part = match files.len() {
        1 => files.remove(0),
        0 => return Err(Error::validation("No file provided")),
        n => return Err(Error::validation(format!("Expected one file, got {}; use /api/jobs/bulk-upload", n))),
    };

    let request = part.into_request(&uploader_id(&headers), &fields)?;
    let document = state.coordinator().upload(request).await?;
    Ok((StatusCode::CREATED, Json(document)))
}

/// GET /api/documents/:id - counts as a view
pub async fn get_document(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Document>> {
    let documents = state.documents();
    documents.record_view(id)?;
    Ok(Json(documents.get(id)?))
}

#[derive(Debug, Deserialize)]
pub struct MetadataPatch {
    /// Keys to merge; `null` removes a key
    pub metadata: HashMap<String, serde_json::Value>,
}

/// PATCH /api/documents/:id
pub async fn update_metadata(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<MetadataPatch>,
) -> Result<Json<Document>> {
    let document = state.documents().update_metadata(id, &patch.metadata).await?;
    Ok(Json(document))
}

/// DELETE /api/documents/:id
pub async fn delete_document(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    state.documents().delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/documents/:id/reindex
pub async fn reindex_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Document>)> {
    let document = state.documents().reindex(id).await?;
    Ok((StatusCode::ACCEPTED, Json(document)))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

fn default_ttl() -> u64 {
    3600
}

/// Longest lifetime a presigned URL may be given
const MAX_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub url: String,
    pub expires_in: u64,
}

/// GET /api/documents/:id/download - presigned URL, counts as a download
pub async fn download_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<DownloadResponse>> {
    let ttl = query.ttl_secs.clamp(1, MAX_TTL_SECS);
    let url = state.documents().download_url(id, Duration::from_secs(ttl)).await?;
    Ok(Json(DownloadResponse { url, expires_in: ttl }))
}

#[derive(Debug, Deserialize)]
pub struct BlobQuery {
    pub expires: i64,
    pub signature: String,
}

/// GET /blobs/*path - serve bytes behind a presigned URL
pub async fn serve_blob(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<BlobQuery>,
) -> Result<Response> {
    if !state.signer().verify(&path, query.expires, &query.signature) {
        return Ok((StatusCode::FORBIDDEN, "invalid or expired signature").into_response());
    }

    let data = state.store().get(&path).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocflowConfig;
    use crate::ingestion::UploadRequest;
    use crate::server::state::tests::memory_state;
    use crate::types::DocumentStatus;

    #[tokio::test]
    async fn test_document_handlers() {
        let state = memory_state(DocflowConfig::default());
        let doc = state
            .coordinator()
            .upload(UploadRequest::new("notes.txt", "text/plain", "meeting notes"))
            .await
            .unwrap();

        let Json(fetched) = get_document(State(state.clone()), Path(doc.id)).await.unwrap();
        assert_eq!(fetched.view_count, 1);
        assert_eq!(fetched.status, DocumentStatus::Pending);

        let patch = MetadataPatch {
            metadata: HashMap::from([("owner".to_string(), serde_json::json!("ops"))]),
        };
        let Json(updated) = update_metadata(State(state.clone()), Path(doc.id), Json(patch)).await.unwrap();
        assert_eq!(updated.metadata["owner"], "ops");

        let (status, _) = reindex_document(State(state.clone()), Path(doc.id)).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let status = delete_document(State(state.clone()), Path(doc.id)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(matches!(
            get_document(State(state), Path(doc.id)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_presigned_blob_round_trip() {
        let state = memory_state(DocflowConfig::default());
        let signer = state.signer().clone();
        let doc = state
            .coordinator()
            .upload(UploadRequest::new("a.txt", "text/plain", "blob body"))
            .await
            .unwrap();

        let signed = signer.sign(&doc.storage_locator, Duration::from_secs(60)).unwrap();
        let query = signed.split_once('?').unwrap().1;
        let params: HashMap<&str, &str> = query.split('&').filter_map(|kv| kv.split_once('=')).collect();
        let good = BlobQuery {
            expires: params["expires"].parse().unwrap(),
            signature: params["signature"].to_string(),
        };

        let response = serve_blob(State(state.clone()), Path(doc.storage_locator.clone()), Query(good))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let forged = BlobQuery {
            expires: i64::MAX,
            signature: "forged".to_string(),
        };
        let response = serve_blob(State(state), Path(doc.storage_locator), Query(forged)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}

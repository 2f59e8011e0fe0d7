//! Bulk job and dead-letter endpoints

use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::{read_multipart, uploader_id};
use crate::error::{Error, Result};
use crate::processing::WorkItem;
use crate::server::state::AppState;
use crate::types::{DeadLetter, Job, JobType, Topic};

/// Returned when a job is accepted
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub total: usize,
}

fn submit(state: &AppState, job_type: JobType, items: Vec<WorkItem>, created_by: &str) -> Result<(StatusCode, Json<JobAccepted>)> {
    let job = state.orchestrator().submit(job_type, items, created_by)?;
    tracing::info!(job_id = %job.id, job_type = job_type.as_str(), total = job.total, "Job accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: job.id,
            total: job.total,
        }),
    ))
}

/// POST /api/jobs/bulk-upload - every file part becomes one upload
///
/// Text fields (`collection_id`, `metadata`, ...) apply to all files.
pub async fn bulk_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<(StatusCode, Json<JobAccepted>)> {
    let (files, mut fields) = read_multipart(multipart).await?;
    if files.is_empty() {
        return Err(Error::validation("No files provided"));
    }
    // per-file titles come from filenames
    fields.remove("title");

    let uploader = uploader_id(&headers);
    let items = files
        .into_iter()
        .map(|part| part.into_request(&uploader, &fields).map(WorkItem::Upload))
        .collect::<Result<Vec<_>>>()?;

    submit(&state, JobType::BulkUpload, items, &uploader)
}

#[derive(Debug, Deserialize)]
pub struct MetadataUpdate {
    pub document_id: Uuid,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct BulkUpdateRequest {
    pub items: Vec<MetadataUpdate>,
}

/// POST /api/jobs/bulk-update
pub async fn bulk_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BulkUpdateRequest>,
) -> Result<(StatusCode, Json<JobAccepted>)> {
    let items = request
        .items
        .into_iter()
        .map(|item| WorkItem::UpdateMetadata {
            document_id: item.document_id,
            metadata: item.metadata,
        })
        .collect();
    submit(&state, JobType::BulkMetadataUpdate, items, &uploader_id(&headers))
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteRequest {
    pub document_ids: Vec<Uuid>,
}

/// POST /api/jobs/bulk-delete
pub async fn bulk_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BulkDeleteRequest>,
) -> Result<(StatusCode, Json<JobAccepted>)> {
    let items = request
        .document_ids
        .into_iter()
        .map(|document_id| WorkItem::Delete { document_id })
        .collect();
    submit(&state, JobType::BulkDelete, items, &uploader_id(&headers))
}

/// GET /api/jobs/:id
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Job>> {
    state
        .jobs()
        .get(id)?
        .map(Json)
        .ok_or_else(|| Error::not_found(format!("Job {}", id)))
}

/// GET /api/jobs - jobs still held in memory, newest first
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.jobs().list())
}

fn parse_topic(topic: &str) -> Result<Topic> {
    Topic::parse(topic).ok_or_else(|| Error::validation(format!("Unknown topic: {}", topic)))
}

/// GET /api/dead-letters/:topic
pub async fn list_dead_letters(State(state): State<AppState>, Path(topic): Path<String>) -> Result<Json<Vec<DeadLetter>>> {
    let topic = parse_topic(&topic)?;
    Ok(Json(state.bus().dead_letters(topic.as_str())?))
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub replayed: usize,
}

/// POST /api/dead-letters/:topic/replay
pub async fn replay_dead_letters(State(state): State<AppState>, Path(topic): Path<String>) -> Result<Json<ReplayResponse>> {
    let topic = parse_topic(&topic)?;
    let replayed = state.bus().replay_dead_letters(topic.as_str()).await?;
    Ok(Json(ReplayResponse { replayed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocflowConfig;
    use crate::types::JobStatus;

    #[tokio::test]
    async fn test_bulk_delete_job_reports_failures() {
        let state = memory_state();
        let request = BulkDeleteRequest {
            document_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        let (status, Json(accepted)) = bulk_delete(State(state.clone()), HeaderMap::new(), Json(request))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted.total, 2);

        let job = loop {
            let Json(job) = get_job(State(state.clone()), Path(accepted.job_id)).await.unwrap();
            if job.status.is_terminal() {
                break job;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.completed, job.failed), (0, 2));
        assert_eq!(job.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_job_and_topic() {
        let state = memory_state();
        assert!(matches!(
            get_job(State(state.clone()), Path(Uuid::new_v4())).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            list_dead_letters(State(state.clone()), Path("nope".to_string())).await,
            Err(Error::Validation(_))
        ));
        let Json(letters) = list_dead_letters(State(state), Path("uploaded".to_string())).await.unwrap();
        assert!(letters.is_empty());
    }

    fn memory_state() -> AppState {
        crate::server::state::tests::memory_state(DocflowConfig::default())
    }
}

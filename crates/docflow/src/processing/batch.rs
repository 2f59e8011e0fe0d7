//! Bounded-concurrency bulk jobs
//!
//! A job is created `pending`, moved to `running` before any item is
//! dispatched and to `completed` once every item was attempted, however many
//! failed. `failed` is reserved for the orchestrator itself breaking down.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use super::jobs::JobRegistry;
use crate::config::JobsConfig;
use crate::error::{Error, Result};
use crate::ingestion::{DocumentService, UploadCoordinator, UploadRequest};
use crate::types::{Job, JobType};

/// One unit of work inside a bulk job
#[derive(Debug, Clone)]
pub enum WorkItem {
    Upload(UploadRequest),
    UpdateMetadata {
        document_id: Uuid,
        metadata: HashMap<String, serde_json::Value>,
    },
    Delete {
        document_id: Uuid,
    },
}

impl WorkItem {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Upload(_) => JobType::BulkUpload,
            Self::UpdateMetadata { .. } => JobType::BulkMetadataUpdate,
            Self::Delete { .. } => JobType::BulkDelete,
        }
    }

    /// Prefix for this item's error messages
    fn label(&self) -> String {
        match self {
            Self::Upload(request) => request.filename.clone(),
            Self::UpdateMetadata { document_id, .. } | Self::Delete { document_id } => {
                document_id.to_string()
            }
        }
    }
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    registry: Arc<JobRegistry>,
    coordinator: Arc<UploadCoordinator>,
    documents: Arc<DocumentService>,
    concurrency: usize,
    item_timeout: Duration,
}

impl BatchOrchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        coordinator: Arc<UploadCoordinator>,
        documents: Arc<DocumentService>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            registry,
            coordinator,
            documents,
            concurrency: config.concurrency.max(1),
            item_timeout: Duration::from_secs(config.item_timeout_secs),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Create a job and run it in the background
    pub fn submit(&self, job_type: JobType, items: Vec<WorkItem>, created_by: &str) -> Result<Job> {
        self.start(job_type, items, created_by).map(|(job, _)| job)
    }

    /// Like `submit`, also returning the handle of the background run
    pub fn start(
        &self,
        job_type: JobType,
        items: Vec<WorkItem>,
        created_by: &str,
    ) -> Result<(Job, JoinHandle<()>)> {
        if let Some(item) = items.iter().find(|item| item.job_type() != job_type) {
            return Err(Error::validation(format!(
                "{} item in a {} job",
                item.job_type().as_str(),
                job_type.as_str()
            )));
        }

        let job = self.registry.create(job_type, items.len(), created_by);
        let this = self.clone();
        let job_id = job.id;
        let handle = tokio::spawn(async move { this.supervise(job_id, items).await });
        Ok((job, handle))
    }

    async fn supervise(self, job_id: Uuid, items: Vec<WorkItem>) {
        let registry = Arc::clone(&self.registry);
        let run = tokio::spawn(async move { self.run(job_id, items).await });

        let reason = match run.await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(join) => format!("Job runner panicked: {}", join),
        };
        if let Err(e) = registry.fail(job_id, reason) {
            tracing::error!(job_id = %job_id, error = %e, "Could not mark job failed");
        }
    }

    async fn run(&self, job_id: Uuid, items: Vec<WorkItem>) -> Result<()> {
        self.registry.mark_running(job_id)?;
        tracing::info!(job_id = %job_id, items = items.len(), concurrency = self.concurrency, "Job running");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (labels, handles): (Vec<String>, Vec<_>) = items
            .into_iter()
            .map(|item| {
                let label = item.label();
                let this = self.clone();
                let semaphore = Arc::clone(&semaphore);
                let task_label = label.clone();
                let handle = tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return this.record(job_id, &task_label, Err(Error::internal("Job semaphore closed")));
                    };
                    let outcome = match timeout(this.item_timeout, this.execute(item)).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(Error::transient(format!(
                            "timed out after {}s",
                            this.item_timeout.as_secs()
                        ))),
                    };
                    this.record(job_id, &task_label, outcome)
                });
                (label, handle)
            })
            .unzip();

        for (label, joined) in labels.into_iter().zip(join_all(handles).await) {
            if let Err(join) = joined {
                tracing::error!(job_id = %job_id, item = %label, "Job item panicked");
                self.registry
                    .record_failure(job_id, format!("{}: worker panicked: {}", label, join))?;
            }
        }

        self.registry.finish(job_id)?;
        Ok(())
    }

    fn record(&self, job_id: Uuid, label: &str, outcome: Result<()>) {
        let recorded = match outcome {
            Ok(()) => self.registry.record_success(job_id),
            Err(e) => {
                tracing::debug!(job_id = %job_id, item = %label, error = %e, "Job item failed");
                self.registry.record_failure(job_id, format!("{}: {}", label, e))
            }
        };
        if let Err(e) = recorded {
            tracing::warn!(job_id = %job_id, item = %label, error = %e, "Could not record item outcome");
        }
    }

    async fn execute(&self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::Upload(request) => self.coordinator.upload(request).await.map(|_| ()),
            WorkItem::UpdateMetadata { document_id, metadata } => self
                .documents
                .update_metadata(document_id, &metadata)
                .await
                .map(|_| ()),
            WorkItem::Delete { document_id } => self.documents.delete(document_id).await,
        }
    }
}

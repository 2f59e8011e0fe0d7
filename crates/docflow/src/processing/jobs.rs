//! In-process arena of bulk jobs
//!
//! Every mutation goes through one mutex, so counters are never updated
//! concurrently. Terminal snapshots are written to the database, which is
//! where `get` looks once the reaper has dropped a job from memory.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::DocumentDb;
use crate::types::{Job, JobStatus, JobType};

/// Cap on stored error strings per job
const MAX_ERRORS: usize = 1_000;

pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, Job>>,
    db: Option<DocumentDb>,
}

impl JobRegistry {
    pub fn new(db: Option<DocumentDb>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            db,
        }
    }

    /// Register a new pending job
    pub fn create(&self, job_type: JobType, total: usize, created_by: &str) -> Job {
        let job = Job::new(job_type, total, created_by);
        self.jobs.lock().insert(job.id, job.clone());
        tracing::info!(job_id = %job.id, job_type = job_type.as_str(), total, "Job created");
        job
    }

    /// Snapshot of a job, falling back to persisted terminal state
    pub fn get(&self, id: Uuid) -> Result<Option<Job>> {
        if let Some(job) = self.jobs.lock().get(&id) {
            return Ok(Some(job.clone()));
        }
        match &self.db {
            Some(db) => db.get_job(id),
            None => Ok(None),
        }
    }

    /// Jobs still held in memory, newest first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    fn update<T>(&self, id: Uuid, f: impl FnOnce(&mut Job) -> Result<T>) -> Result<T> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("Job {}", id)))?;
        f(job)
    }

    fn advance(job: &mut Job, next: JobStatus) -> Result<()> {
        if !job.status.can_advance_to(next) {
            return Err(Error::internal(format!(
                "Job {} cannot move from {} to {}",
                job.id,
                job.status.as_str(),
                next.as_str()
            )));
        }
        job.status = next;
        Ok(())
    }

    pub fn mark_running(&self, id: Uuid) -> Result<()> {
        self.update(id, |job| {
            Self::advance(job, JobStatus::Running)?;
            job.started_at = Some(Utc::now());
            Ok(())
        })
    }

    pub fn record_success(&self, id: Uuid) -> Result<()> {
        self.update(id, |job| {
            Self::ensure_capacity(job)?;
            job.completed += 1;
            Ok(())
        })
    }

    pub fn record_failure(&self, id: Uuid, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.update(id, |job| {
            Self::ensure_capacity(job)?;
            job.failed += 1;
            if job.errors.len() < MAX_ERRORS {
                job.errors.push(error);
            }
            Ok(())
        })
    }

    fn ensure_capacity(job: &Job) -> Result<()> {
        if job.processed() >= job.total {
            return Err(Error::internal(format!(
                "Job {} already accounted for all {} items",
                job.id, job.total
            )));
        }
        Ok(())
    }

    /// Every item attempted; the job completes even if some failed
    pub fn finish(&self, id: Uuid) -> Result<Job> {
        let job = self.update(id, |job| {
            if job.status != JobStatus::Running {
                return Err(Error::internal(format!("Job {} finished without running", job.id)));
            }
            Self::advance(job, JobStatus::Completed)?;
            job.completed_at = Some(Utc::now());
            Ok(job.clone())
        })?;
        self.persist(&job);
        tracing::info!(
            job_id = %id,
            completed = job.completed,
            failed = job.failed,
            total = job.total,
            "Job completed"
        );
        Ok(job)
    }

    /// Orchestrator-level failure; remaining items are not attempted
    pub fn fail(&self, id: Uuid, reason: impl Into<String>) -> Result<Job> {
        let reason = reason.into();
        let job = self.update(id, |job| {
            Self::advance(job, JobStatus::Failed)?;
            job.completed_at = Some(Utc::now());
            job.errors.push(reason.clone());
            Ok(job.clone())
        })?;
        self.persist(&job);
        tracing::error!(job_id = %id, reason = %reason, "Job failed");
        Ok(job)
    }

    fn persist(&self, job: &Job) {
        if let Some(db) = &self.db {
            if let Err(e) = db.save_job(job) {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to persist job outcome");
            }
        }
    }

    /// Drop terminal jobs finished more than `retention` ago
    ///
    /// Persisted snapshots are kept for `history` before they are purged.
    /// Returns how many in-memory jobs were removed.
    pub fn reap(&self, retention: Duration, history: Duration) -> usize {
        let cutoff = cutoff(retention);
        let removed = {
            let mut jobs = self.jobs.lock();
            let before = jobs.len();
            jobs.retain(|_, job| {
                !(job.status.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
            });
            before - jobs.len()
        };

        if let Some(db) = &self.db {
            match db.delete_jobs_completed_before(self::cutoff(history)) {
                Ok(purged) if purged > 0 => tracing::debug!(purged, "Purged persisted jobs"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to purge persisted jobs"),
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Reaped finished jobs");
        }
        removed
    }
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_forward_only_status() {
        let registry = JobRegistry::new(None);
        let job = registry.create(JobType::BulkDelete, 2, "admin");

        // cannot finish before running
        assert!(registry.finish(job.id).is_err());

        registry.mark_running(job.id).unwrap();
        registry.record_success(job.id).unwrap();
        registry.record_failure(job.id, "doc missing").unwrap();
        // no third item
        assert!(registry.record_success(job.id).is_err());

        let done = registry.finish(job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!((done.completed, done.failed), (1, 1));
        assert_eq!(done.errors, vec!["doc missing".to_string()]);

        assert!(registry.mark_running(job.id).is_err());
        assert!(registry.fail(job.id, "late").is_err());
    }

    #[test]
    fn test_reap_keeps_persisted_snapshot() {
        let db = DocumentDb::in_memory().unwrap();
        let registry = JobRegistry::new(Some(db));
        let job = registry.create(JobType::BulkUpload, 0, "admin");
        let running = registry.create(JobType::BulkUpload, 1, "admin");
        registry.mark_running(job.id).unwrap();
        registry.mark_running(running.id).unwrap();
        registry.finish(job.id).unwrap();

        let week = Duration::from_secs(7 * 24 * 3600);
        assert_eq!(registry.reap(Duration::from_secs(3600), week), 0);
        assert_eq!(registry.reap(Duration::ZERO, week), 1);
        assert_eq!(registry.list().len(), 1);

        // still readable from the database after reaping
        let persisted = registry.get(job.id).unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Completed);
    }

    #[test]
    fn test_unknown_job() {
        let registry = JobRegistry::new(None);
        assert!(registry.get(Uuid::new_v4()).unwrap().is_none());
        assert!(matches!(
            registry.record_success(Uuid::new_v4()),
            Err(Error::NotFound(_))
        ));
    }
}

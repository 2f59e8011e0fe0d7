//! Batch job records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of bulk operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    BulkUpload,
    BulkMetadataUpdate,
    BulkDelete,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BulkUpload => "bulk_upload",
            Self::BulkMetadataUpdate => "bulk_metadata_update",
            Self::BulkDelete => "bulk_delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bulk_upload" => Some(Self::BulkUpload),
            "bulk_metadata_update" => Some(Self::BulkMetadataUpdate),
            "bulk_delete" => Some(Self::BulkDelete),
            _ => None,
        }
    }
}

/// Job status; only ever moves forward
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether `next` is a legal forward transition from `self`
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// A bulk job and its progress counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_type: JobType, total: usize, created_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            total,
            completed: 0,
            failed: 0,
            errors: Vec::new(),
            created_by: created_by.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Items attempted so far
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() {
        assert!(JobStatus::Pending.can_advance_to(JobStatus::Running));
        assert!(JobStatus::Running.can_advance_to(JobStatus::Completed));
        assert!(JobStatus::Pending.can_advance_to(JobStatus::Failed));
        assert!(!JobStatus::Running.can_advance_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_advance_to(JobStatus::Failed));
        assert!(!JobStatus::Running.can_advance_to(JobStatus::Running));
    }
}

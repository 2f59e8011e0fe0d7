//! SQLite database for document metadata and finished jobs
//!
//! The `content_hash` column carries a UNIQUE constraint; a violation on insert
//! is the authoritative duplicate signal and surfaces as `Error::Conflict`.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Document, DocumentStatus, FileType, Job, JobStatus, JobType};

const DOCUMENT_COLUMNS: &str = "id, content_hash, status, is_indexed, storage_locator, \
    thumbnail_locator, mime_type, file_type, file_size, filename, title, description, \
    uploader_id, collection_id, view_count, download_count, metadata, index_attempts, \
    last_error, last_attempt_at, created_at, updated_at";

const JOB_COLUMNS: &str = "id, job_type, status, total, completed, failed, errors, \
    created_by, created_at, started_at, completed_at";

/// SQLite-backed document metadata store
#[derive(Clone)]
pub struct DocumentDb {
    conn: Arc<Mutex<Connection>>,
}

impl DocumentDb {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate(true)?;
        Ok(db)
    }

    /// Create an in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate(false)?;
        Ok(db)
    }

    fn migrate(&self, wal: bool) -> Result<()> {
        let conn = self.conn.lock();

        if wal {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA temp_store=MEMORY;
                "#,
            )
            .map_err(|e| Error::Internal(format!("Failed to set pragmas: {}", e)))?;
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                is_indexed INTEGER NOT NULL DEFAULT 0,
                storage_locator TEXT NOT NULL,
                thumbnail_locator TEXT,
                mime_type TEXT NOT NULL,
                file_type TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                filename TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                uploader_id TEXT NOT NULL,
                collection_id TEXT,
                view_count INTEGER NOT NULL DEFAULT 0,
                download_count INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                index_attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_attempt_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status, is_indexed);
            CREATE INDEX IF NOT EXISTS idx_documents_created_at ON documents(created_at);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                total INTEGER NOT NULL,
                completed INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                errors TEXT NOT NULL DEFAULT '[]',
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_completed_at ON jobs(completed_at);
            "#,
        )
        .map_err(|e| Error::Internal(format!("Failed to run migrations: {}", e)))?;

        tracing::debug!("Database migrations complete");
        Ok(())
    }

    // ==================== Document Operations ====================

    /// Insert a new document row
    ///
    /// Fails with `Error::Conflict` when another row already holds the same hash.
    pub fn insert_document(&self, doc: &Document) -> Result<()> {
        let conn = self.conn.lock();

        let metadata = serde_json::to_string(&doc.metadata)?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO documents ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
                DOCUMENT_COLUMNS
            ),
            params![
                doc.id.to_string(),
                doc.content_hash,
                doc.status.as_str(),
                doc.is_indexed,
                doc.storage_locator,
                doc.thumbnail_locator,
                doc.mime_type,
                doc.file_type.as_str(),
                doc.file_size as i64,
                doc.filename,
                doc.title,
                doc.description,
                doc.uploader_id,
                doc.collection_id,
                doc.view_count as i64,
                doc.download_count as i64,
                metadata,
                doc.index_attempts as i64,
                doc.last_error,
                doc.last_attempt_at.map(timestamp),
                timestamp(doc.created_at),
                timestamp(doc.updated_at),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT id FROM documents WHERE content_hash = ?1",
                        params![doc.content_hash],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| Error::Internal(format!("Failed to look up duplicate: {}", e)))?;

                match existing.and_then(|s| Uuid::parse_str(&s).ok()) {
                    Some(existing_id) => Err(Error::Conflict { existing_id }),
                    None => Err(Error::Internal(format!(
                        "Constraint violation inserting document {}",
                        doc.id
                    ))),
                }
            }
            Err(e) => Err(Error::Internal(format!("Failed to insert document: {}", e))),
        }
    }

    /// Get a document by id
    pub fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let conn = self.conn.lock();

        conn.query_row(
            &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
            params![id.to_string()],
            row_to_document,
        )
        .optional()
        .map_err(|e| Error::Internal(format!("Failed to get document: {}", e)))
    }

    /// Get a document by content hash
    pub fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock();

        conn.query_row(
            &format!("SELECT {} FROM documents WHERE content_hash = ?1", DOCUMENT_COLUMNS),
            params![content_hash],
            row_to_document,
        )
        .optional()
        .map_err(|e| Error::Internal(format!("Failed to get document by hash: {}", e)))
    }

    /// Delete a document row
    pub fn delete_document(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])
            .map_err(|e| Error::Internal(format!("Failed to delete document: {}", e)))?;

        Ok(count > 0)
    }

    /// Mark a document searchable: `is_indexed = 1`, `status = active`
    pub fn mark_indexed(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn
            .execute(
                "UPDATE documents SET status = 'active', is_indexed = 1, last_error = NULL, \
                 last_attempt_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), timestamp(Utc::now())],
            )
            .map_err(|e| Error::Internal(format!("Failed to mark document indexed: {}", e)))?;

        Ok(count > 0)
    }

    /// Record a failed indexing attempt that will be retried
    pub fn record_index_attempt(&self, id: Uuid, error: &str) -> Result<bool> {
        let conn = self.conn.lock();

        let now = timestamp(Utc::now());
        let count = conn
            .execute(
                "UPDATE documents SET index_attempts = index_attempts + 1, last_error = ?2, \
                 last_attempt_at = ?3, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), error, now],
            )
            .map_err(|e| Error::Internal(format!("Failed to record index attempt: {}", e)))?;

        Ok(count > 0)
    }

    /// Mark a dead-lettered document failed
    ///
    /// Already-indexed documents keep their status.
    pub fn mark_failed(&self, id: Uuid, reason: &str) -> Result<bool> {
        let conn = self.conn.lock();

        let now = timestamp(Utc::now());
        let count = conn
            .execute(
                "UPDATE documents SET status = 'failed', index_attempts = index_attempts + 1, \
                 last_error = ?2, last_attempt_at = ?3, updated_at = ?3 \
                 WHERE id = ?1 AND is_indexed = 0",
                params![id.to_string(), reason, now],
            )
            .map_err(|e| Error::Internal(format!("Failed to mark document failed: {}", e)))?;

        Ok(count > 0)
    }

    /// Put a document back into `pending` for re-indexing
    pub fn reset_for_reindex(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn
            .execute(
                "UPDATE documents SET status = 'pending', is_indexed = 0, index_attempts = 0, \
                 last_error = NULL, last_attempt_at = NULL, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), timestamp(Utc::now())],
            )
            .map_err(|e| Error::Internal(format!("Failed to reset document: {}", e)))?;

        Ok(count > 0)
    }

    /// Stamp `last_attempt_at` without touching counters
    pub fn touch_attempt(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn
            .execute(
                "UPDATE documents SET last_attempt_at = ?2 WHERE id = ?1",
                params![id.to_string(), timestamp(Utc::now())],
            )
            .map_err(|e| Error::Internal(format!("Failed to touch document: {}", e)))?;

        Ok(count > 0)
    }

    /// Attach a thumbnail locator; false if the row no longer exists
    pub fn set_thumbnail(&self, id: Uuid, locator: &str) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn
            .execute(
                "UPDATE documents SET thumbnail_locator = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), locator, timestamp(Utc::now())],
            )
            .map_err(|e| Error::Internal(format!("Failed to set thumbnail: {}", e)))?;

        Ok(count > 0)
    }

    pub fn increment_view_count(&self, id: Uuid) -> Result<bool> {
        self.increment_counter(id, "view_count")
    }

    pub fn increment_download_count(&self, id: Uuid) -> Result<bool> {
        self.increment_counter(id, "download_count")
    }

    fn increment_counter(&self, id: Uuid, column: &'static str) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn
            .execute(
                &format!("UPDATE documents SET {col} = {col} + 1 WHERE id = ?1", col = column),
                params![id.to_string()],
            )
            .map_err(|e| Error::Internal(format!("Failed to increment {}: {}", column, e)))?;

        Ok(count > 0)
    }

    /// Merge keys into a document's metadata; a JSON null removes the key
    pub fn update_metadata(
        &self,
        id: Uuid,
        patch: &HashMap<String, serde_json::Value>,
    ) -> Result<Option<Document>> {
        let conn = self.conn.lock();

        let current: Option<String> = conn
            .query_row(
                "SELECT metadata FROM documents WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Internal(format!("Failed to read metadata: {}", e)))?;

        let Some(current) = current else {
            return Ok(None);
        };

        let mut metadata: HashMap<String, serde_json::Value> =
            serde_json::from_str(&current).unwrap_or_default();
        for (key, value) in patch {
            if value.is_null() {
                metadata.remove(key);
            } else {
                metadata.insert(key.clone(), value.clone());
            }
        }

        conn.execute(
            "UPDATE documents SET metadata = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), serde_json::to_string(&metadata)?, timestamp(Utc::now())],
        )
        .map_err(|e| Error::Internal(format!("Failed to update metadata: {}", e)))?;

        conn.query_row(
            &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
            params![id.to_string()],
            row_to_document,
        )
        .optional()
        .map_err(|e| Error::Internal(format!("Failed to get document: {}", e)))
    }

    /// Pending, unindexed documents created before `cutoff` with no attempt since
    pub fn list_stale_pending(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Document>> {
        let conn = self.conn.lock();

        let cutoff = timestamp(cutoff);
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM documents \
                 WHERE status = 'pending' AND is_indexed = 0 AND created_at < ?1 \
                 AND (last_attempt_at IS NULL OR last_attempt_at < ?1) \
                 ORDER BY created_at ASC LIMIT ?2",
                DOCUMENT_COLUMNS
            ))
            .map_err(|e| Error::Internal(format!("Failed to prepare query: {}", e)))?;

        let docs = stmt
            .query_map(params![cutoff, limit as i64], row_to_document)
            .map_err(|e| Error::Internal(format!("Failed to list stale documents: {}", e)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(docs)
    }

    /// Document counts per status
    pub fn count_by_status(&self) -> Result<HashMap<DocumentStatus, usize>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM documents GROUP BY status")
            .map_err(|e| Error::Internal(format!("Failed to prepare query: {}", e)))?;

        let counts = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((status, count))
            })
            .map_err(|e| Error::Internal(format!("Failed to count documents: {}", e)))?
            .filter_map(|r| r.ok())
            .filter_map(|(s, c)| DocumentStatus::parse(&s).map(|s| (s, c as usize)))
            .collect();

        Ok(counts)
    }

    // ==================== Job Operations ====================

    /// Insert or replace a job snapshot
    pub fn save_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                JOB_COLUMNS
            ),
            params![
                job.id.to_string(),
                job.job_type.as_str(),
                job.status.as_str(),
                job.total as i64,
                job.completed as i64,
                job.failed as i64,
                serde_json::to_string(&job.errors)?,
                job.created_by,
                timestamp(job.created_at),
                job.started_at.map(timestamp),
                job.completed_at.map(timestamp),
            ],
        )
        .map_err(|e| Error::Internal(format!("Failed to save job: {}", e)))?;

        Ok(())
    }

    /// Get a persisted job
    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let conn = self.conn.lock();

        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id.to_string()],
            row_to_job,
        )
        .optional()
        .map_err(|e| Error::Internal(format!("Failed to get job: {}", e)))
    }

    /// Drop persisted jobs that finished before `cutoff`
    pub fn delete_jobs_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();

        let count = conn
            .execute(
                "DELETE FROM jobs WHERE completed_at IS NOT NULL AND completed_at < ?1",
                params![timestamp(cutoff)],
            )
            .map_err(|e| Error::Internal(format!("Failed to clean up jobs: {}", e)))?;

        Ok(count)
    }
}

// Fixed-width UTC timestamps so text comparison matches time order
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(2)?;
    let file_type_str: String = row.get(7)?;
    let file_size: i64 = row.get(8)?;
    let view_count: i64 = row.get(14)?;
    let download_count: i64 = row.get(15)?;
    let metadata_json: String = row.get(16)?;
    let index_attempts: i64 = row.get(17)?;
    let last_attempt_at: Option<String> = row.get(19)?;
    let created_at: String = row.get(20)?;
    let updated_at: String = row.get(21)?;

    Ok(Document {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        content_hash: row.get(1)?,
        status: DocumentStatus::parse(&status_str).unwrap_or(DocumentStatus::Pending),
        is_indexed: row.get(3)?,
        storage_locator: row.get(4)?,
        thumbnail_locator: row.get(5)?,
        mime_type: row.get(6)?,
        file_type: FileType::parse(&file_type_str),
        file_size: file_size as u64,
        filename: row.get(9)?,
        title: row.get(10)?,
        description: row.get(11)?,
        uploader_id: row.get(12)?,
        collection_id: row.get(13)?,
        view_count: view_count as u64,
        download_count: download_count as u64,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        index_attempts: index_attempts as u32,
        last_error: row.get(18)?,
        last_attempt_at: last_attempt_at.as_deref().and_then(parse_timestamp),
        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(&updated_at).unwrap_or_else(Utc::now),
    })
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let id_str: String = row.get(0)?;
    let job_type_str: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let total: i64 = row.get(3)?;
    let completed: i64 = row.get(4)?;
    let failed: i64 = row.get(5)?;
    let errors_json: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    let started_at: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;

    Ok(Job {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        job_type: JobType::parse(&job_type_str).unwrap_or(JobType::BulkUpload),
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Failed),
        total: total as usize,
        completed: completed as usize,
        failed: failed as usize,
        errors: serde_json::from_str(&errors_json).unwrap_or_default(),
        created_by: row.get(7)?,
        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        started_at: started_at.as_deref().and_then(parse_timestamp),
        completed_at: completed_at.as_deref().and_then(parse_timestamp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewDocument;

    fn sample(hash: &str) -> Document {
        Document::pending(NewDocument {
            id: Uuid::new_v4(),
            content_hash: hash.to_string(),
            storage_locator: format!("objects/{}", hash),
            mime_type: "text/plain".to_string(),
            file_size: 19,
            filename: "fox.txt".to_string(),
            title: "Fox".to_string(),
            description: Some("a quick one".to_string()),
            uploader_id: "u1".to_string(),
            collection_id: Some("c1".to_string()),
            metadata: HashMap::from([("lang".to_string(), serde_json::json!("en"))]),
        })
    }

    #[test]
    fn test_insert_and_get() {
        let db = DocumentDb::in_memory().unwrap();
        let doc = sample("hash1");
        db.insert_document(&doc).unwrap();

        let stored = db.get_document(doc.id).unwrap().unwrap();
        assert_eq!(stored.content_hash, "hash1");
        assert_eq!(stored.status, DocumentStatus::Pending);
        assert!(!stored.is_indexed);
        assert_eq!(stored.metadata["lang"], serde_json::json!("en"));
        assert_eq!(stored.collection_id.as_deref(), Some("c1"));

        let by_hash = db.find_by_hash("hash1").unwrap().unwrap();
        assert_eq!(by_hash.id, doc.id);
    }

    #[test]
    fn test_unique_hash_is_conflict() {
        let db = DocumentDb::in_memory().unwrap();
        let first = sample("same");
        db.insert_document(&first).unwrap();

        let err = db.insert_document(&sample("same")).unwrap_err();
        match err {
            Error::Conflict { existing_id } => assert_eq!(existing_id, first.id),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_indexing_transitions() {
        let db = DocumentDb::in_memory().unwrap();
        let doc = sample("h");
        db.insert_document(&doc).unwrap();

        db.record_index_attempt(doc.id, "storage down").unwrap();
        let stored = db.get_document(doc.id).unwrap().unwrap();
        assert_eq!(stored.index_attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("storage down"));
        assert!(stored.last_attempt_at.is_some());

        assert!(db.mark_indexed(doc.id).unwrap());
        let stored = db.get_document(doc.id).unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Active);
        assert!(stored.is_indexed);

        // an indexed document is not demoted by a late failure
        assert!(!db.mark_failed(doc.id, "late").unwrap());

        assert!(db.reset_for_reindex(doc.id).unwrap());
        let stored = db.get_document(doc.id).unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Pending);
        assert!(!stored.is_indexed);

        assert!(db.mark_failed(doc.id, "corrupt").unwrap());
        let stored = db.get_document(doc.id).unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
    }

    #[test]
    fn test_counters_and_metadata() {
        let db = DocumentDb::in_memory().unwrap();
        let doc = sample("m");
        db.insert_document(&doc).unwrap();

        db.increment_view_count(doc.id).unwrap();
        db.increment_view_count(doc.id).unwrap();
        db.increment_download_count(doc.id).unwrap();

        let patch = HashMap::from([
            ("lang".to_string(), serde_json::Value::Null),
            ("team".to_string(), serde_json::json!("ops")),
        ]);
        let updated = db.update_metadata(doc.id, &patch).unwrap().unwrap();
        assert_eq!(updated.view_count, 2);
        assert_eq!(updated.download_count, 1);
        assert!(!updated.metadata.contains_key("lang"));
        assert_eq!(updated.metadata["team"], serde_json::json!("ops"));

        assert!(db.update_metadata(Uuid::new_v4(), &patch).unwrap().is_none());
    }

    #[test]
    fn test_list_stale_pending() {
        let db = DocumentDb::in_memory().unwrap();
        let mut old = sample("old");
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        db.insert_document(&old).unwrap();
        db.insert_document(&sample("fresh")).unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(15);
        let stale = db.list_stale_pending(cutoff, 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);

        db.touch_attempt(old.id).unwrap();
        assert!(db.list_stale_pending(cutoff, 10).unwrap().is_empty());
    }

    #[test]
    fn test_job_persistence() {
        let db = DocumentDb::in_memory().unwrap();
        let mut job = Job::new(JobType::BulkDelete, 3, "admin");
        job.status = JobStatus::Completed;
        job.completed = 2;
        job.failed = 1;
        job.errors.push("missing".to_string());
        job.completed_at = Some(Utc::now() - chrono::Duration::days(2));
        db.save_job(&job).unwrap();

        let stored = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.errors, vec!["missing".to_string()]);

        let removed = db.delete_jobs_completed_before(Utc::now() - chrono::Duration::days(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(db.get_job(job.id).unwrap().is_none());
    }
}

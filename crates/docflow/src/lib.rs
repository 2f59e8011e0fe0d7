//! docflow: content-addressed document ingestion
//!
//! Uploads are validated, scanned, deduplicated by SHA-256 and stored once.
//! An at-least-once event channel hands each new document to the indexer,
//! which extracts text (falling back to OCR), writes a full-text index and
//! dead-letters what it cannot process. Bulk jobs fan work out with bounded
//! concurrency.

pub mod config;
pub mod error;
pub mod events;
pub mod extraction;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod search;
pub mod server;
pub mod storage;
pub mod types;

pub use config::DocflowConfig;
pub use error::{Error, Result};
pub use types::{Document, DocumentStatus, FileType, Job, JobStatus, JobType};

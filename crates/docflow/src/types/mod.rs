//! Core types for docflow

pub mod document;
pub mod event;
pub mod job;

pub use document::{Document, DocumentStatus, FileType, NewDocument};
pub use event::{DeadLetter, DeletedEvent, IndexedEvent, IngestionEvent, Topic};
pub use job::{Job, JobStatus, JobType};

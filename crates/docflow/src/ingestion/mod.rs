//! Upload validation, deduplication and document lifecycle

mod coordinator;
mod documents;
mod hasher;
mod locks;

pub use coordinator::{normalize_mime, UploadCoordinator, UploadRequest};
pub use documents::DocumentService;
pub use hasher::content_hash;
pub use locks::{ContentLock, ContentLocks};

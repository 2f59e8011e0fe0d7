//! Collaborators behind trait seams: blob storage, virus scanning, thumbnails
//!
//! Each seam has a production implementation and a lightweight one used for
//! tests or for running with a feature switched off.

pub mod command;
pub mod object_store;
pub mod scanner;
pub mod thumbnail;

pub use object_store::{LocalObjectStore, MemoryObjectStore, ObjectStore, UrlSigner};
pub use scanner::{DisabledScanner, HttpScanner, ScanVerdict, SignatureScanner, VirusScanner};
pub use thumbnail::{CommandThumbnailer, NoopThumbnailer, ThumbnailGenerator};

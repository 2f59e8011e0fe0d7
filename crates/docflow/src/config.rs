//! Configuration for docflow

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable naming the TOML config file
pub const CONFIG_ENV: &str = "DOCFLOW_CONFIG";

/// Main docflow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocflowConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Upload validation configuration
    pub upload: UploadConfig,
    /// Virus scanner configuration
    pub scanner: ScannerConfig,
    /// Object store and metadata database locations
    pub storage: StorageConfig,
    /// Search index configuration
    pub search: SearchConfig,
    /// Event channel configuration
    pub events: EventsConfig,
    /// Indexer retry configuration
    pub indexer: IndexerConfig,
    /// Extraction and OCR configuration
    pub extraction: ExtractionConfig,
    /// Thumbnail generation configuration
    pub thumbnails: ThumbnailConfig,
    /// Batch job configuration
    pub jobs: JobsConfig,
    /// Reconciliation sweep configuration
    pub reconcile: ReconcileConfig,
}

impl DocflowConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Load from `DOCFLOW_CONFIG` if set, defaults otherwise
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Reject settings that would make the pipeline misbehave
    pub fn validate(&self) -> Result<()> {
        if self.upload.max_upload_size == 0 {
            return Err(Error::Config("upload.max_upload_size must be > 0".into()));
        }
        if self.upload.allowed_mime_types.is_empty() {
            return Err(Error::Config("upload.allowed_mime_types is empty".into()));
        }
        if self.events.partitions == 0 {
            return Err(Error::Config("events.partitions must be > 0".into()));
        }
        if self.events.retention == 0 {
            return Err(Error::Config("events.retention must be > 0".into()));
        }
        if self.indexer.max_attempts == 0 {
            return Err(Error::Config("indexer.max_attempts must be > 0".into()));
        }
        if self.jobs.concurrency == 0 {
            return Err(Error::Config("jobs.concurrency must be > 0".into()));
        }
        if self.scanner.kind == ScannerKind::Http && self.scanner.endpoint.is_none() {
            return Err(Error::Config("scanner.kind = \"http\" requires scanner.endpoint".into()));
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
        .join("docflow")
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
        }
    }
}

/// Upload validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum upload size in bytes (default: 100MB)
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,
    /// Accepted mime types, compared after lowercasing and stripping parameters
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

fn default_max_upload_size() -> usize { 100 * 1024 * 1024 } // 100MB

fn default_allowed_mime_types() -> Vec<String> {
    [
        "text/plain",
        "text/markdown",
        "text/html",
        "text/csv",
        "application/pdf",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "image/png",
        "image/jpeg",
        "image/tiff",
        "image/gif",
        "image/webp",
        "image/bmp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_size: default_max_upload_size(),
            allowed_mime_types: default_allowed_mime_types(),
        }
    }
}

/// Which scanner implementation to run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScannerKind {
    /// Built-in byte signature matcher (EICAR + configured signatures)
    #[default]
    Signature,
    /// Remote scanning service over HTTP
    Http,
    /// No scanning; logged at startup and on every upload
    Disabled,
}

/// What to do when the scanner cannot give a verdict
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    /// Fail the upload with a transient error
    #[default]
    Reject,
    /// Accept the upload unscanned, with a warning
    Allow,
}

/// Virus scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub kind: ScannerKind,
    /// Scanning service URL (kind = "http")
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Request timeout for the scanning service
    #[serde(default = "default_scanner_timeout")]
    pub timeout_secs: u64,
    /// Extra hex-encoded byte signatures for the signature scanner
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub on_unavailable: UnavailablePolicy,
}

fn default_scanner_timeout() -> u64 { 30 }

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            kind: ScannerKind::default(),
            endpoint: None,
            timeout_secs: default_scanner_timeout(),
            signatures: Vec::new(),
            on_unavailable: UnavailablePolicy::default(),
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the local object store
    #[serde(default = "default_objects_dir")]
    pub objects_dir: PathBuf,
    /// SQLite metadata database path
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Secret used to sign presigned URLs
    #[serde(default = "default_presign_secret")]
    pub presign_secret: String,
    /// Base URL prefixed to presigned paths
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_objects_dir() -> PathBuf { default_data_dir().join("objects") }
fn default_database_path() -> PathBuf { default_data_dir().join("docflow.db") }
fn default_presign_secret() -> String { "change-me".to_string() }
fn default_public_base_url() -> String { "http://localhost:8080/blobs".to_string() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            objects_dir: default_objects_dir(),
            database_path: default_database_path(),
            presign_secret: default_presign_secret(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Search index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// SQLite FTS index path
    #[serde(default = "default_search_path")]
    pub index_path: PathBuf,
    /// BM25 weight of the title column relative to content
    #[serde(default = "default_title_boost")]
    pub title_boost: f64,
    /// Largest page size a query may request
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

fn default_search_path() -> PathBuf { default_data_dir().join("search.db") }
fn default_title_boost() -> f64 { 5.0 }
fn default_max_page_size() -> usize { 100 }

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            index_path: default_search_path(),
            title_boost: default_title_boost(),
            max_page_size: default_max_page_size(),
        }
    }
}

/// Event channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Partitions per topic
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// Consumer group used by the indexer
    #[serde(default = "default_indexer_group")]
    pub indexer_group: String,
    /// Messages kept per partition before the oldest are dropped
    #[serde(default = "default_event_retention")]
    pub retention: usize,
}

fn default_partitions() -> usize { 4 }
fn default_indexer_group() -> String { "indexer".to_string() }
fn default_event_retention() -> usize { crate::events::DEFAULT_RETENTION }

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            indexer_group: default_indexer_group(),
            retention: default_event_retention(),
        }
    }
}

/// Indexer retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Attempts per event before dead-lettering (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds, doubled each attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on a single retry delay in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_max_attempts() -> u32 { 5 }
fn default_backoff_base_ms() -> u64 { 1_000 }
fn default_backoff_cap_ms() -> u64 { 60_000 }

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

/// Extraction and OCR configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Timeout for a native extractor (default: 120s)
    #[serde(default = "default_extraction_timeout")]
    pub timeout_secs: u64,
    /// Timeout for an OCR run (default: 300s)
    #[serde(default = "default_ocr_timeout")]
    pub ocr_timeout_secs: u64,
    /// Enable the tesseract OCR engine
    #[serde(default = "default_ocr_enabled")]
    pub ocr_enabled: bool,
    /// Tesseract language codes
    #[serde(default = "default_ocr_languages")]
    pub ocr_languages: String,
    /// Rasterisation DPI for page-oriented OCR
    #[serde(default = "default_ocr_dpi")]
    pub ocr_dpi: u32,
}

fn default_extraction_timeout() -> u64 { 120 }
fn default_ocr_timeout() -> u64 { 300 }
fn default_ocr_enabled() -> bool { true }
fn default_ocr_languages() -> String { "eng".to_string() }
fn default_ocr_dpi() -> u32 { 300 }

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_extraction_timeout(),
            ocr_timeout_secs: default_ocr_timeout(),
            ocr_enabled: default_ocr_enabled(),
            ocr_languages: default_ocr_languages(),
            ocr_dpi: default_ocr_dpi(),
        }
    }
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }
}

/// Thumbnail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumbnails_enabled")]
    pub enabled: bool,
    /// Longest edge in pixels
    #[serde(default = "default_thumbnail_size")]
    pub size: u32,
    #[serde(default = "default_thumbnail_timeout")]
    pub timeout_secs: u64,
}

fn default_thumbnails_enabled() -> bool { true }
fn default_thumbnail_size() -> u32 { 256 }
fn default_thumbnail_timeout() -> u64 { 30 }

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            enabled: default_thumbnails_enabled(),
            size: default_thumbnail_size(),
            timeout_secs: default_thumbnail_timeout(),
        }
    }
}

/// Batch job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Concurrent workers per job (default: 5)
    #[serde(default = "default_job_concurrency")]
    pub concurrency: usize,
    /// Timeout for a single item (default: 300s = 5 minutes)
    #[serde(default = "default_item_timeout")]
    pub item_timeout_secs: u64,
    /// Finished jobs older than this are reaped (default: 24h)
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// Persisted job outcomes older than this are purged (default: 7 days)
    #[serde(default = "default_history_retention")]
    pub history_retention_secs: u64,
    /// Reaper interval (default: 10 minutes)
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

fn default_job_concurrency() -> usize { 5 }
fn default_item_timeout() -> u64 { 300 }
fn default_retention() -> u64 { 24 * 60 * 60 }
fn default_history_retention() -> u64 { 7 * 24 * 60 * 60 }
fn default_reaper_interval() -> u64 { 10 * 60 }

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_job_concurrency(),
            item_timeout_secs: default_item_timeout(),
            retention_secs: default_retention(),
            history_retention_secs: default_history_retention(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

/// Reconciliation sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_enabled")]
    pub enabled: bool,
    /// Pending documents untouched for this long are re-emitted (default: 15 minutes)
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    /// Sweep interval (default: 5 minutes)
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    /// Maximum documents re-emitted per sweep
    #[serde(default = "default_reconcile_batch")]
    pub batch_size: usize,
}

fn default_reconcile_enabled() -> bool { true }
fn default_stale_after() -> u64 { 15 * 60 }
fn default_reconcile_interval() -> u64 { 5 * 60 }
fn default_reconcile_batch() -> usize { 500 }

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconcile_enabled(),
            stale_after_secs: default_stale_after(),
            interval_secs: default_reconcile_interval(),
            batch_size: default_reconcile_batch(),
        }
    }
}

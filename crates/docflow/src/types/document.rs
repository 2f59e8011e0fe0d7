//! Document records and their lifecycle status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a stored document
///
/// `Pending` on upload, `Active` once indexed, `Failed` when indexing was
/// dead-lettered. Only an explicit reindex moves a document back to `Pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Active,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Supported file types, derived from the normalised mime type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// Plain text file
    Txt,
    /// Markdown file
    Markdown,
    /// HTML document
    Html,
    /// CSV file
    Csv,
    /// PDF document
    Pdf,
    /// Microsoft Word document (.docx)
    Docx,
    /// Microsoft PowerPoint presentation (.pptx)
    Pptx,
    /// Excel spreadsheet (.xlsx)
    Xlsx,
    /// Image (OCR only)
    Image,
    /// Unknown file type
    Unknown,
}

impl FileType {
    /// Detect file type from a normalised mime type
    pub fn from_mime(mime: &str) -> Self {
        match mime {
            "text/plain" => Self::Txt,
            "text/markdown" | "text/x-markdown" => Self::Markdown,
            "text/html" | "application/xhtml+xml" => Self::Html,
            "text/csv" => Self::Csv,
            "application/pdf" => Self::Pdf,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Self::Docx,
            "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
                Self::Pptx
            }
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Self::Xlsx,
            m if m.starts_with("image/") => Self::Image,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Txt => "txt",
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Csv => "csv",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Pptx => "pptx",
            Self::Xlsx => "xlsx",
            Self::Image => "image",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "txt" => Self::Txt,
            "markdown" => Self::Markdown,
            "html" => Self::Html,
            "csv" => Self::Csv,
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            "pptx" => Self::Pptx,
            "xlsx" => Self::Xlsx,
            "image" => Self::Image,
            _ => Self::Unknown,
        }
    }

    /// Get display name
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Txt => "Text File",
            Self::Markdown => "Markdown",
            Self::Html => "HTML",
            Self::Csv => "CSV",
            Self::Pdf => "PDF",
            Self::Docx => "Word Document (.docx)",
            Self::Pptx => "PowerPoint (.pptx)",
            Self::Xlsx => "Excel Spreadsheet (.xlsx)",
            Self::Image => "Image",
            Self::Unknown => "Unknown",
        }
    }
}

/// A stored document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique document ID, assigned at creation
    pub id: Uuid,
    /// Lowercase hex SHA-256 of the raw bytes
    pub content_hash: String,
    pub status: DocumentStatus,
    /// Set only by the indexer
    pub is_indexed: bool,
    /// Object store path of the raw bytes
    pub storage_locator: String,
    pub thumbnail_locator: Option<String>,
    pub mime_type: String,
    pub file_type: FileType,
    pub file_size: u64,
    /// Original filename as uploaded
    pub filename: String,
    pub title: String,
    pub description: Option<String>,
    pub uploader_id: String,
    pub collection_id: Option<String>,
    pub view_count: u64,
    pub download_count: u64,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Indexing attempts recorded against this document
    pub index_attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the uploader for a new document
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: Uuid,
    pub content_hash: String,
    pub storage_locator: String,
    pub mime_type: String,
    pub file_size: u64,
    pub filename: String,
    pub title: String,
    pub description: Option<String>,
    pub uploader_id: String,
    pub collection_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Document {
    /// Build a pending, unindexed document
    pub fn pending(new: NewDocument) -> Self {
        let now = Utc::now();
        Self {
            id: new.id,
            file_type: FileType::from_mime(&new.mime_type),
            content_hash: new.content_hash,
            status: DocumentStatus::Pending,
            is_indexed: false,
            storage_locator: new.storage_locator,
            thumbnail_locator: None,
            mime_type: new.mime_type,
            file_size: new.file_size,
            filename: new.filename,
            title: new.title,
            description: new.description,
            uploader_id: new.uploader_id,
            collection_id: new.collection_id,
            view_count: 0,
            download_count: 0,
            metadata: new.metadata,
            index_attempts: 0,
            last_error: None,
            last_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

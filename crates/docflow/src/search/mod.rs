//! Full-text search over indexed documents

mod fts;

pub use fts::FtsSearchEngine;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// What the indexer writes for one document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchDocument {
    pub title: String,
    pub content: String,
    pub file_type: String,
    pub status: String,
    pub collection_id: Option<String>,
    pub uploader_id: String,
    pub created_at: DateTime<Utc>,
}

/// A query; `page` is 1-based
#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    #[serde(alias = "q")]
    pub text: String,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page() -> usize { 1 }
fn default_page_size() -> usize { 20 }

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            page: default_page(),
            page_size: default_page_size(),
        }
    }

    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub document_id: Uuid,
    pub title: String,
    pub file_type: String,
    pub collection_id: Option<String>,
    /// Higher is more relevant; always positive for a hit
    pub score: f64,
    pub snippet: String,
}

/// Per-value document count for one facet field
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FacetBucket {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Facets {
    pub file_type: Vec<FacetBucket>,
    pub status: Vec<FacetBucket>,
    pub collection_id: Vec<FacetBucket>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    /// Matches across all pages
    pub total: usize,
    pub facets: Facets,
}

/// Inverted-index store keyed by document id
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Insert or replace the entry for `id`
    async fn upsert(&self, id: Uuid, document: &SearchDocument) -> Result<()>;

    /// Remove the entry for `id`; returns whether one existed
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Fuzzy multi-field query with title boost and facet counts
    async fn query(&self, query: &SearchQuery) -> Result<SearchResults>;

    /// Number of indexed documents
    async fn count(&self) -> Result<usize>;

    fn name(&self) -> &str;
}

//! SQLite FTS5 search engine
//!
//! Documents live in `search_docs`; `search_fts` is an external-content FTS5
//! table kept in sync by triggers. Fuzzy matching expands each query term with
//! indexed terms within a small edit distance, read from an `fts5vocab` table.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use super::{FacetBucket, Facets, SearchDocument, SearchEngine, SearchHit, SearchQuery, SearchResults};
use crate::config::SearchConfig;
use crate::error::{Error, Result};

/// Indexed terms considered per query term
const MAX_VARIANTS: usize = 8;

pub struct FtsSearchEngine {
    conn: Arc<Mutex<Connection>>,
    title_boost: f64,
    max_page_size: usize,
}

impl FtsSearchEngine {
    /// Open or create the index at `path`
    pub fn new<P: AsRef<Path>>(path: P, config: &SearchConfig) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::Internal(format!("Failed to open search index: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(|e| Error::Internal(format!("Failed to set pragmas: {}", e)))?;
        Self::with_connection(conn, config)
    }

    pub fn in_memory(config: &SearchConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("Failed to open in-memory index: {}", e)))?;
        Self::with_connection(conn, config)
    }

    fn with_connection(conn: Connection, config: &SearchConfig) -> Result<Self> {
        let engine = Self {
            conn: Arc::new(Mutex::new(conn)),
            title_boost: config.title_boost,
            max_page_size: config.max_page_size.max(1),
        };
        engine.migrate()?;
        Ok(engine)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS search_docs (
                document_id TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                file_type TEXT NOT NULL,
                status TEXT NOT NULL,
                collection_id TEXT,
                uploader_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS search_fts USING fts5(
                title,
                content,
                content='search_docs',
                content_rowid='rowid',
                tokenize='unicode61 remove_diacritics 2'
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS search_vocab USING fts5vocab(search_fts, 'row');

            CREATE TRIGGER IF NOT EXISTS search_docs_ai AFTER INSERT ON search_docs BEGIN
                INSERT INTO search_fts(rowid, title, content)
                VALUES (NEW.rowid, NEW.title, NEW.content);
            END;

            CREATE TRIGGER IF NOT EXISTS search_docs_ad AFTER DELETE ON search_docs BEGIN
                INSERT INTO search_fts(search_fts, rowid, title, content)
                VALUES ('delete', OLD.rowid, OLD.title, OLD.content);
            END;

            CREATE TRIGGER IF NOT EXISTS search_docs_au AFTER UPDATE ON search_docs BEGIN
                INSERT INTO search_fts(search_fts, rowid, title, content)
                VALUES ('delete', OLD.rowid, OLD.title, OLD.content);
                INSERT INTO search_fts(rowid, title, content)
                VALUES (NEW.rowid, NEW.title, NEW.content);
            END;
        "#)
        .map_err(|e| Error::Internal(format!("Failed to run search migrations: {}", e)))?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| Error::Internal(format!("Search task failed: {}", e)))?
    }
}

/// Lowercased alphanumeric terms, deduplicated, in first-seen order
fn query_terms(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.unicode_words()
        .map(|t| t.to_lowercase())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Edits tolerated for a term of this many characters
fn max_edits(len: usize) -> usize {
    match len {
        0..=3 => 0,
        4..=7 => 1,
        _ => 2,
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            row[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

fn quote(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Indexed terms within edit distance of `term`, nearest first
fn fuzzy_variants(conn: &Connection, term: &str) -> Result<Vec<String>> {
    let edits = max_edits(term.chars().count());
    if edits == 0 {
        return Ok(Vec::new());
    }
    let len = term.chars().count() as i64;

    let mut stmt = conn.prepare_cached(
        "SELECT term FROM search_vocab WHERE length(term) BETWEEN ?1 AND ?2",
    )?;
    let candidates = stmt
        .query_map(params![len - edits as i64, len + edits as i64], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok());

    let mut variants: Vec<(usize, String)> = candidates
        .filter(|candidate| candidate != term)
        .filter_map(|candidate| {
            let distance = levenshtein(term, &candidate);
            (distance <= edits).then_some((distance, candidate))
        })
        .collect();
    variants.sort();
    variants.truncate(MAX_VARIANTS);
    Ok(variants.into_iter().map(|(_, v)| v).collect())
}

/// FTS5 MATCH expression: every term, its prefix and its fuzzy variants, OR-ed
fn match_expression(conn: &Connection, terms: &[String]) -> Result<String> {
    let mut clauses = Vec::new();
    for term in terms {
        clauses.push(quote(term));
        clauses.push(format!("{}*", quote(term)));
        for variant in fuzzy_variants(conn, term)? {
            clauses.push(quote(&variant));
        }
    }
    Ok(clauses.join(" OR "))
}

fn facet(conn: &Connection, column: &str, expression: &str) -> Result<Vec<FacetBucket>> {
    // column is one of a fixed set of names, never user input
    let sql = format!(
        "SELECT d.{column}, COUNT(*) AS n
         FROM search_fts JOIN search_docs d ON d.rowid = search_fts.rowid
         WHERE search_fts MATCH ?1 AND d.{column} IS NOT NULL
         GROUP BY d.{column}
         ORDER BY n DESC, d.{column}"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let buckets = stmt
        .query_map(params![expression], |row| {
            Ok(FacetBucket {
                value: row.get(0)?,
                count: row.get::<_, i64>(1)? as usize,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(buckets)
}

#[async_trait]
impl SearchEngine for FtsSearchEngine {
    async fn upsert(&self, id: Uuid, document: &SearchDocument) -> Result<()> {
        let document = document.clone();
        self.blocking(move |conn| {
            conn.execute(
                r#"
                INSERT INTO search_docs
                    (document_id, title, content, file_type, status, collection_id, uploader_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(document_id) DO UPDATE SET
                    title = excluded.title,
                    content = excluded.content,
                    file_type = excluded.file_type,
                    status = excluded.status,
                    collection_id = excluded.collection_id,
                    uploader_id = excluded.uploader_id,
                    created_at = excluded.created_at
                "#,
                params![
                    id.to_string(),
                    document.title,
                    document.content,
                    document.file_type,
                    document.status,
                    document.collection_id,
                    document.uploader_id,
                    document.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(document_id = %id, "Upserted search entry");
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM search_docs WHERE document_id = ?1",
                params![id.to_string()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn query(&self, query: &SearchQuery) -> Result<SearchResults> {
        let terms = query_terms(&query.text);
        if terms.is_empty() {
            return Ok(SearchResults::default());
        }

        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, self.max_page_size);
        let offset = (page - 1)
            .checked_mul(page_size)
            .and_then(|offset| i64::try_from(offset).ok())
            .ok_or_else(|| Error::validation(format!("Page {} is out of range", page)))?;
        let title_boost = self.title_boost;

        self.blocking(move |conn| {
            let expression = match_expression(conn, &terms)?;

            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM search_fts WHERE search_fts MATCH ?1",
                params![expression],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare_cached(
                r#"
                SELECT d.document_id, d.title, d.file_type, d.collection_id,
                       bm25(search_fts, ?2, 1.0) AS rank,
                       snippet(search_fts, 1, '<b>', '</b>', '...', 16)
                FROM search_fts
                JOIN search_docs d ON d.rowid = search_fts.rowid
                WHERE search_fts MATCH ?1
                ORDER BY rank
                LIMIT ?3 OFFSET ?4
                "#,
            )?;
            let rows = stmt.query_map(
                params![expression, title_boost, page_size as i64, offset],
                |row| {
                    let id: String = row.get(0)?;
                    let title: String = row.get(1)?;
                    let file_type: String = row.get(2)?;
                    let collection_id: Option<String> = row.get(3)?;
                    let rank: f64 = row.get(4)?;
                    let snippet: String = row.get(5)?;
                    Ok((id, title, file_type, collection_id, rank, snippet))
                },
            )?;

            let mut hits = Vec::new();
            for row in rows {
                let (id, title, file_type, collection_id, rank, snippet) = row?;
                let Ok(document_id) = Uuid::parse_str(&id) else {
                    tracing::warn!(id = %id, "Skipping search entry with malformed id");
                    continue;
                };
                hits.push(SearchHit {
                    document_id,
                    title,
                    file_type,
                    collection_id,
                    // bm25 is negative, lower is better
                    score: -rank,
                    snippet,
                });
            }

            let facets = Facets {
                file_type: facet(conn, "file_type", &expression)?,
                status: facet(conn, "status", &expression)?,
                collection_id: facet(conn, "collection_id", &expression)?,
            };

            Ok(SearchResults {
                hits,
                total: total as usize,
                facets,
            })
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.blocking(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM search_docs", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite-fts5"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(title: &str, content: &str, file_type: &str, collection: Option<&str>) -> SearchDocument {
        SearchDocument {
            title: title.to_string(),
            content: content.to_string(),
            file_type: file_type.to_string(),
            status: "active".to_string(),
            collection_id: collection.map(str::to_string),
            uploader_id: "u1".to_string(),
            created_at: Utc::now(),
        }
    }

    fn engine() -> FtsSearchEngine {
        FtsSearchEngine::in_memory(&SearchConfig::default()).unwrap()
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("quick", "quick"), 0);
        assert_eq!(levenshtein("quick", "quik"), 1);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(query_terms("Quick, quick FOX!"), vec!["quick", "fox"]);
        assert!(query_terms("  ..  ").is_empty());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let engine = engine();
        let id = Uuid::new_v4();
        let d = doc("Fox", "The quick brown fox", "txt", None);
        engine.upsert(id, &d).await.unwrap();
        engine.upsert(id, &d).await.unwrap();
        assert_eq!(engine.count().await.unwrap(), 1);

        // replaced content is what matches
        engine.upsert(id, &doc("Fox", "a lazy dog", "txt", None)).await.unwrap();
        assert_eq!(engine.query(&SearchQuery::new("brown")).await.unwrap().total, 0);
        assert_eq!(engine.query(&SearchQuery::new("lazy")).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_fuzzy_match() {
        let engine = engine();
        let id = Uuid::new_v4();
        engine
            .upsert(id, &doc("Report", "quarterly revenue summary", "pdf", None))
            .await
            .unwrap();

        let results = engine.query(&SearchQuery::new("revenu quartely")).await.unwrap();
        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.hits[0].document_id, id);
        assert!(results.hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_title_boost_ranks_title_match_first() {
        let engine = engine();
        let in_title = Uuid::new_v4();
        let in_body = Uuid::new_v4();
        engine
            .upsert(in_body, &doc("Notes", "meeting about budget planning", "txt", None))
            .await
            .unwrap();
        engine
            .upsert(in_title, &doc("Budget", "meeting about planning", "txt", None))
            .await
            .unwrap();

        let results = engine.query(&SearchQuery::new("budget")).await.unwrap();
        assert_eq!(results.total, 2);
        assert_eq!(results.hits[0].document_id, in_title);
    }

    #[tokio::test]
    async fn test_facets_and_paging() {
        let engine = engine();
        for (i, (file_type, collection)) in [("pdf", Some("c1")), ("pdf", Some("c2")), ("txt", None)]
            .into_iter()
            .enumerate()
        {
            engine
                .upsert(Uuid::new_v4(), &doc(&format!("Doc {}", i), "shared invoice text", file_type, collection))
                .await
                .unwrap();
        }

        let results = engine
            .query(&SearchQuery::new("invoice").with_page(2, 2))
            .await
            .unwrap();
        assert_eq!(results.total, 3);
        assert_eq!(results.hits.len(), 1);
        assert_eq!(
            results.facets.file_type,
            vec![
                FacetBucket { value: "pdf".into(), count: 2 },
                FacetBucket { value: "txt".into(), count: 1 },
            ]
        );
        assert_eq!(results.facets.status, vec![FacetBucket { value: "active".into(), count: 3 }]);
        assert_eq!(results.facets.collection_id.len(), 2);
    }

    #[tokio::test]
    async fn test_page_beyond_range_is_rejected() {
        let engine = engine();
        engine.upsert(Uuid::new_v4(), &doc("Fox", "quick fox", "txt", None)).await.unwrap();

        let result = engine.query(&SearchQuery::new("fox").with_page(usize::MAX, 20)).await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let far = engine.query(&SearchQuery::new("fox").with_page(1_000, 20)).await.unwrap();
        assert_eq!(far.total, 1);
        assert!(far.hits.is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_empty_query() {
        let engine = engine();
        let id = Uuid::new_v4();
        engine.upsert(id, &doc("Fox", "quick fox", "txt", None)).await.unwrap();
        assert!(engine.delete(id).await.unwrap());
        assert!(!engine.delete(id).await.unwrap());
        assert_eq!(engine.query(&SearchQuery::new("fox")).await.unwrap().total, 0);
        assert_eq!(engine.query(&SearchQuery::new("")).await.unwrap(), SearchResults::default());
    }
}

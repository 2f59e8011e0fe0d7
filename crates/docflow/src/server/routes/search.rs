//! Search endpoint

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Serialize;

use crate::error::Result;
use crate::search::{Facets, SearchHit, SearchQuery};
use crate::server::state::AppState;

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub hits: Vec<SearchHit>,
    pub facets: Facets,
}

/// GET /api/search?q=&page=&page_size=
pub async fn search(State(state): State<AppState>, Query(mut query): Query<SearchQuery>) -> Result<Json<SearchResponse>> {
    query.page = query.page.max(1);
    query.page_size = query.page_size.clamp(1, state.config().search.max_page_size);

    let results = state.search().query(&query).await?;
    tracing::debug!(query = %query.text, total = results.total, "Search served");

    Ok(Json(SearchResponse {
        query: query.text,
        page: query.page,
        page_size: query.page_size,
        total: results.total,
        hits: results.hits,
        facets: results.facets,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocflowConfig;
    use crate::ingestion::UploadRequest;
    use crate::server::state::tests::memory_state;

    #[tokio::test]
    async fn test_search_after_indexing() {
        let state = memory_state(DocflowConfig::default());
        state
            .coordinator()
            .upload(UploadRequest::new("fox.txt", "text/plain", "The quick brown fox"))
            .await
            .unwrap();

        // the uploaded event is emitted in the background
        while state.bus().message_count("uploaded") == 0 {
            tokio::task::yield_now().await;
        }
        state.indexer().drain().await.unwrap();

        let query = SearchQuery::new("quick fox").with_page(0, 10_000);
        let Json(response) = search(State(state.clone()), Query(query)).await.unwrap();
        assert_eq!(response.page, 1);
        assert_eq!(response.page_size, 100);
        assert_eq!(response.total, 1);
        assert!(response.hits[0].score > 0.0);

        let query = SearchQuery::new("quick fox").with_page(usize::MAX, 20);
        assert!(matches!(
            search(State(state), Query(query)).await,
            Err(crate::error::Error::Validation(_))
        ));
    }
}

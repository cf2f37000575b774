use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument};

use minbar_core::domain::{validate_query, Chunk, SearchQuery, TOP_K_DOCUMENTS};
use minbar_core::errors::{MinbarError, Result};
use minbar_core::fusion::rr_fusion;
use minbar_core::ports::{Embedder, Reranker, Searcher};
use minbar_telemetry::MetricsRecorder;

use crate::text;

/// Initial candidate pool across both retrieval arms, split evenly.
pub const CANDIDATE_POOL: usize = 200;

/// Hybrid retrieval: parallel semantic and lexical search per sub-query,
/// reciprocal-rank fusion, first-wins dedup, then a cross-encoder rerank
/// against the raw query.
pub struct SearchSvc {
    embedder: Arc<dyn Embedder>,
    searcher: Arc<dyn Searcher>,
    reranker: Arc<dyn Reranker>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SearchSvc {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        searcher: Arc<dyn Searcher>,
        reranker: Arc<dyn Reranker>,
    ) -> Self {
        Self {
            embedder,
            searcher,
            reranker,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[instrument(skip_all, fields(sub_queries = request.sub_queries.len()))]
    pub async fn search(&self, request: &SearchQuery) -> Result<Vec<Chunk>> {
        let started = Instant::now();
        let sub_queries = validate_query(request)?;

        let texts: Vec<String> = sub_queries.iter().map(|s| s.text.clone()).collect();
        let labels: Vec<Vec<i64>> = sub_queries.iter().map(|s| s.labels.clone()).collect();
        let lexical_queries: Vec<String> = texts
            .iter()
            .map(|t| text::clean_and_filter_stopwords(t))
            .collect();

        let per_arm = CANDIDATE_POOL / 2;
        let semantic = async {
            let embeddings = self.embedder.embed_queries(&texts).await?;
            if embeddings.len() != texts.len() {
                return Err(MinbarError::internal(
                    "embedding batch is not 1:1 with sub-queries",
                ));
            }
            self.searcher
                .parallel_semantic_search(&embeddings, &labels, per_arm)
                .await
        };
        let lexical = self
            .searcher
            .parallel_lexical_search(&lexical_queries, &labels, per_arm);
        let (semantic, lexical) = tokio::try_join!(semantic, lexical)?;

        let mut seen = HashSet::new();
        let mut candidate_ids = Vec::new();
        for (sem, lex) in semantic.iter().zip(lexical.iter()) {
            let sem_ids: Vec<u32> = sem.iter().map(|r| r.chunk_id).collect();
            let lex_ids: Vec<u32> = lex.iter().map(|r| r.chunk_id).collect();
            for rank in rr_fusion(&sem_ids, &lex_ids) {
                if seen.insert(rank.chunk_id) {
                    candidate_ids.push(rank.chunk_id);
                }
            }
        }
        debug!(candidates = candidate_ids.len(), "fused candidate set");
        if candidate_ids.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = self.searcher.fetch_chunks(&candidate_ids).await?;
        let docs: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let ranked = self
            .reranker
            .rerank(&request.query, &docs, TOP_K_DOCUMENTS)
            .await?;
        let results: Vec<Chunk> = ranked
            .into_iter()
            .filter_map(|(idx, _)| chunks.get(idx).cloned())
            .collect();

        if let Some(metrics) = &self.metrics {
            metrics.histogram_observe(
                "search_total_ms",
                &[],
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
        Ok(results)
    }
}

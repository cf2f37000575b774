use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;

use crate::domain::{Chunk, Rank};
use crate::errors::{MinbarError, Result};

/// Batched query embedding. Output is 1:1 with input.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_queries(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Cross-encoder reranking of candidate documents against the raw query.
/// Returns (input index, score) pairs, best first.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, docs: &[String], top_k: usize) -> Result<Vec<(usize, f64)>>;
}

/// Vector and keyword index access. The parallel variants fan one task out
/// per query and split the overall candidate budget evenly.
#[async_trait]
pub trait Searcher: Send + Sync {
    async fn semantic_search(&self, embedding: &[f32], labels: &[i64], k: usize)
        -> Result<Vec<Rank>>;

    async fn lexical_search(&self, query: &str, labels: &[i64], k: usize) -> Result<Vec<Rank>>;

    /// Resolve chunk ids to full chunks, in input order.
    async fn fetch_chunks(&self, ids: &[u32]) -> Result<Vec<Chunk>>;

    async fn parallel_semantic_search(
        &self,
        embeddings: &[Vec<f32>],
        labels: &[Vec<i64>],
        total_k: usize,
    ) -> Result<Vec<Vec<Rank>>> {
        if embeddings.len() != labels.len() {
            return Err(MinbarError::internal(
                "semantic fan-out requires one label set per embedding",
            ));
        }
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }
        let per_query = (total_k / embeddings.len()).max(1);
        try_join_all(
            embeddings
                .iter()
                .zip(labels.iter())
                .map(|(e, l)| self.semantic_search(e, l, per_query)),
        )
        .await
    }

    async fn parallel_lexical_search(
        &self,
        queries: &[String],
        labels: &[Vec<i64>],
        total_k: usize,
    ) -> Result<Vec<Vec<Rank>>> {
        if queries.len() != labels.len() {
            return Err(MinbarError::internal(
                "lexical fan-out requires one label set per query",
            ));
        }
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let per_query = (total_k / queries.len()).max(1);
        try_join_all(
            queries
                .iter()
                .zip(labels.iter())
                .map(|(q, l)| self.lexical_search(q, l, per_query)),
        )
        .await
    }
}

/// Byte-valued cache with per-entry TTL. No client-side locking;
/// concurrent writers to one key are last-write-wins.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
}

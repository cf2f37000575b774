//! Wiring seams for the external providers. Deployments install real
//! embedding, index, rerank, and model clients here; until then every
//! call answers unavailable so the rest of the stack stays honest.

use async_trait::async_trait;

use minbar_core::domain::{Chunk, Rank};
use minbar_core::errors::{MinbarError, Result};
use minbar_core::gateway::{Generation, GenerationConfig, LlmGateway, LlmStream};
use minbar_core::ports::{Embedder, Reranker, Searcher};
use minbar_core::window::Content;

pub struct Unconfigured;

fn unavailable(what: &str) -> MinbarError {
    MinbarError::unavailable(format!("no {what} provider configured"))
}

#[async_trait]
impl Embedder for Unconfigured {
    async fn embed_queries(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(unavailable("embedding"))
    }
}

#[async_trait]
impl Reranker for Unconfigured {
    async fn rerank(
        &self,
        _query: &str,
        _docs: &[String],
        _top_k: usize,
    ) -> Result<Vec<(usize, f64)>> {
        Err(unavailable("rerank"))
    }
}

#[async_trait]
impl Searcher for Unconfigured {
    async fn semantic_search(
        &self,
        _embedding: &[f32],
        _labels: &[i64],
        _k: usize,
    ) -> Result<Vec<Rank>> {
        Err(unavailable("vector index"))
    }

    async fn lexical_search(&self, _query: &str, _labels: &[i64], _k: usize) -> Result<Vec<Rank>> {
        Err(unavailable("keyword index"))
    }

    async fn fetch_chunks(&self, _ids: &[u32]) -> Result<Vec<Chunk>> {
        Err(unavailable("chunk store"))
    }
}

#[async_trait]
impl LlmGateway for Unconfigured {
    async fn generate(
        &self,
        _model: &str,
        _contents: &[Content],
        _config: &GenerationConfig,
    ) -> Result<Generation> {
        Err(unavailable("model"))
    }

    async fn stream(
        &self,
        _model: &str,
        _contents: &[Content],
        _config: &GenerationConfig,
    ) -> Result<LlmStream> {
        Err(unavailable("model"))
    }

    async fn count_tokens(
        &self,
        _model: &str,
        _contents: &[Content],
        _config: &GenerationConfig,
    ) -> Result<u64> {
        Err(unavailable("model"))
    }
}

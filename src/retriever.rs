//! Retrievers scoped to one PDF.

use anyhow::Result;
use std::sync::Arc;

use crate::context;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::models::SourceDocument;
use crate::traits::{KeywordIndex, Retriever, VectorIndex};

/// Embeds the question and returns the `k` nearest chunks.
pub struct VectorRetriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    pdf_id: String,
    k: usize,
}

impl VectorRetriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        pdf_id: impl Into<String>,
        k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            pdf_id: pdf_id.into(),
            k,
        }
    }
}

impl Retriever for VectorRetriever {
    fn retrieve(&self, query: &str) -> Result<Vec<SourceDocument>> {
        let ctx = context::current()?;
        let vector = embed_query(self.embedder.as_ref(), query)?;
        let docs = ctx.block_on(self.index.query(&self.pdf_id, &vector, self.k))?;
        tracing::debug!(pdf_id = %self.pdf_id, k = self.k, hits = docs.len(), "vector retrieval");
        Ok(docs)
    }
}

/// Full-text retrieval, used when no embedding provider is configured.
pub struct KeywordRetriever {
    index: Arc<dyn KeywordIndex>,
    pdf_id: String,
    k: usize,
}

impl KeywordRetriever {
    pub fn new(index: Arc<dyn KeywordIndex>, pdf_id: impl Into<String>, k: usize) -> Self {
        Self {
            index,
            pdf_id: pdf_id.into(),
            k,
        }
    }
}

impl Retriever for KeywordRetriever {
    fn retrieve(&self, query: &str) -> Result<Vec<SourceDocument>> {
        let ctx = context::current()?;
        let docs = ctx.block_on(self.index.search(&self.pdf_id, query, self.k))?;
        tracing::debug!(pdf_id = %self.pdf_id, k = self.k, hits = docs.len(), "keyword retrieval");
        Ok(docs)
    }
}

//! PDF indexing.
//!
//! Turns an uploaded PDF into searchable chunks:
//! extraction → chunking → embedding (when configured) → storage.
//! Embedding runs before anything is written, and a failure while adding
//! vectors removes the stored PDF again, so a failed upload leaves no
//! partial PDF behind.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, Config};
use crate::embedding::EmbeddingProvider;
use crate::extract::extract_pdf_text;
use crate::models::{Chunk, Pdf};
use crate::store::SqliteStore;
use crate::traits::VectorIndex;

/// Summary returned after indexing one PDF.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedPdf {
    pub id: String,
    pub name: String,
    pub chunks: usize,
    pub embedded: usize,
}

pub struct Indexer {
    store: SqliteStore,
    index: Arc<dyn VectorIndex>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    chunking: ChunkingConfig,
    batch_size: usize,
}

impl Indexer {
    pub fn new(
        config: &Config,
        store: SqliteStore,
        index: Arc<dyn VectorIndex>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            chunking: config.chunking.clone(),
            batch_size: config.embedding.batch_size.max(1),
        }
    }

    /// Extracts the text of `bytes` and indexes it under a new PDF id.
    ///
    /// Extraction failures surface as [`ExtractError`](crate::extract::ExtractError)
    /// inside the returned error.
    pub async fn index_pdf(&self, name: &str, bytes: Vec<u8>) -> Result<IndexedPdf> {
        let text = tokio::task::spawn_blocking(move || extract_pdf_text(&bytes))
            .await
            .context("PDF extraction task failed")??;
        self.index_text(name, &text).await
    }

    /// Indexes already extracted text under a new PDF id.
    pub async fn index_text(&self, name: &str, text: &str) -> Result<IndexedPdf> {
        let pdf = Pdf {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let chunks = chunk_text(
            &pdf.id,
            text,
            self.chunking.chunk_size,
            self.chunking.chunk_overlap,
        );

        let vectors = match &self.embedder {
            Some(embedder) => Some(self.embed_chunks(embedder.clone(), &chunks).await?),
            None => None,
        };

        self.store.insert_pdf(&pdf, &chunks).await?;

        let mut embedded = 0;
        if let (Some(embedder), Some(vectors)) = (&self.embedder, vectors) {
            if let Err(e) = self.index.add(&chunks, &vectors, embedder.model_name()).await {
                tracing::warn!(pdf_id = %pdf.id, error = %e, "vector insert failed, removing pdf");
                self.store.delete_pdf(&pdf.id).await?;
                return Err(e.context("failed to store chunk vectors"));
            }
            embedded = vectors.len();
        }

        tracing::info!(
            pdf_id = %pdf.id,
            name = %pdf.name,
            chunks = chunks.len(),
            embedded,
            "indexed pdf"
        );

        Ok(IndexedPdf {
            id: pdf.id,
            name: pdf.name,
            chunks: chunks.len(),
            embedded,
        })
    }

    async fn embed_chunks(
        &self,
        embedder: Arc<dyn EmbeddingProvider>,
        chunks: &[Chunk],
    ) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let provider = embedder.clone();
            let batch_vectors = tokio::task::spawn_blocking(move || provider.embed(&texts))
                .await
                .context("embedding task failed")??;

            if batch_vectors.len() != batch.len() {
                anyhow::bail!(
                    "embedding provider returned {} vectors for {} chunks",
                    batch_vectors.len(),
                    batch.len()
                );
            }
            if let Some(bad) = batch_vectors.iter().find(|v| v.len() != embedder.dims()) {
                anyhow::bail!(
                    "{} returned a {}-dimensional vector, expected {}",
                    embedder.model_name(),
                    bad.len(),
                    embedder.dims()
                );
            }
            vectors.extend(batch_vectors);
        }

        Ok(vectors)
    }
}

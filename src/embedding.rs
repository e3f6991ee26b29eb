//! Text embeddings for chunk and question vectors.
//!
//! [`HttpEmbedder`] talks to one of two backends:
//! - **OpenAI**: `POST https://api.openai.com/v1/embeddings`, needs `OPENAI_API_KEY`.
//! - **Ollama**: `POST {url}/api/embed`, default url `http://localhost:11434`.
//!
//! Embedding is blocking. Question vectors are computed on the chat worker
//! thread; the indexer calls [`EmbeddingProvider::embed`] from
//! `spawn_blocking`. Transient HTTP failures are retried, see
//! [`send_with_retry`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::http::{send_with_retry, LazyClient};

/// A backend that turns text into embedding vectors.
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier stored next to every vector.
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// One vector per input, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embeds a single question.
pub fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    provider
        .embed(&[text.to_string()])?
        .pop()
        .context("embedding backend returned no vector")
}

/// Builds the configured provider, or `None` when `provider = "disabled"`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    let backend = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "openai" => Backend::OpenAI {
            api_key: std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY environment variable not set")?,
        },
        "ollama" => Backend::Ollama {
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
        },
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(Some(Arc::new(HttpEmbedder::new(config, backend)?)))
}

enum Backend {
    OpenAI { api_key: String },
    Ollama { url: String },
}

impl Backend {
    fn service(&self) -> &'static str {
        match self {
            Backend::OpenAI { .. } => "OpenAI",
            Backend::Ollama { .. } => "Ollama",
        }
    }
}

pub struct HttpEmbedder {
    backend: Backend,
    model: String,
    dims: usize,
    client: LazyClient,
    max_retries: u32,
}

impl HttpEmbedder {
    fn new(config: &EmbeddingConfig, backend: Backend) -> Result<Self> {
        let model = config
            .model
            .clone()
            .with_context(|| format!("embedding.model required for {}", backend.service()))?;
        let dims = config
            .dims
            .with_context(|| format!("embedding.dims required for {}", backend.service()))?;

        Ok(Self {
            backend,
            model,
            dims,
            client: LazyClient::new(config.timeout_secs),
            max_retries: config.max_retries,
        })
    }
}

impl EmbeddingProvider for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client.get()?;
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let service = self.backend.service();

        let vectors = match &self.backend {
            Backend::OpenAI { api_key } => {
                let response = send_with_retry(service, self.max_retries, || {
                    client
                        .post("https://api.openai.com/v1/embeddings")
                        .bearer_auth(api_key)
                        .json(&body)
                })?;
                response.json::<OpenAIEmbeddings>()?.into_vectors()
            }
            Backend::Ollama { url } => {
                let endpoint = format!("{}/api/embed", url.trim_end_matches('/'));
                let response =
                    send_with_retry(service, self.max_retries, || client.post(&endpoint).json(&body))?;
                response.json::<OllamaEmbeddings>()?.embeddings
            }
        };

        check_shape(vectors, texts.len(), self.dims)
    }
}

#[derive(Deserialize)]
struct OpenAIEmbeddings {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAIEmbeddings {
    /// Vectors in input order; the API does not promise `data` is sorted.
    fn into_vectors(mut self) -> Vec<Vec<f32>> {
        self.data.sort_by_key(|d| d.index);
        self.data.into_iter().map(|d| d.embedding).collect()
    }
}

#[derive(Deserialize)]
struct OllamaEmbeddings {
    embeddings: Vec<Vec<f32>>,
}

fn check_shape(vectors: Vec<Vec<f32>>, expected: usize, dims: usize) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        bail!("expected {} embeddings, got {}", expected, vectors.len());
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        bail!(
            "embedding has {} dimensions, embedding.dims is {}",
            bad.len(),
            dims
        );
    }
    Ok(vectors)
}

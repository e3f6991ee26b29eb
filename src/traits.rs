//! Collaborator traits for the chat pipeline.
//!
//! The pipeline is assembled from three pluggable pieces plus the stores
//! they read from:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        ConversationalRetrievalPipeline       │
//! │  ┌───────────┐ ┌───────────┐ ┌────────────┐  │
//! │  │ Retriever │ │ ChatModel │ │   Memory   │  │
//! │  └─────┬─────┘ └───────────┘ └─────┬──────┘  │
//! └────────┼───────────────────────────┼─────────┘
//!          ▼                           ▼
//!     VectorIndex                 MessageStore
//! ```
//!
//! Storage traits are async and backed by SQLite in production. The pipeline
//! pieces ([`Retriever`], [`ChatModel`], [`Memory`], [`Pipeline`]) are
//! blocking: they run on the per-request worker thread and reach async
//! storage through the installed [`RequestContext`](crate::context::RequestContext).

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::{
    ChatInput, Chunk, ComponentType, FinalResult, Message, PromptMessage, Role, SourceDocument,
};
use crate::stream::GenerationListener;

// ═══════════════════════════════════════════════════════════════════════
// Storage traits
// ═══════════════════════════════════════════════════════════════════════

/// Durable, ordered conversation history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message and returns the stored record.
    async fn append(&self, conversation_id: &str, role: Role, content: &str) -> Result<Message>;

    /// Returns every message of the conversation in insertion order.
    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>>;
}

/// Remembers which retriever, model and memory a conversation uses so that
/// follow-up questions get a consistent pipeline.
#[async_trait]
pub trait ComponentRegistry: Send + Sync {
    /// The name chosen earlier for `component`, if any.
    async fn get_previous_choice(
        &self,
        conversation_id: &str,
        component: ComponentType,
    ) -> Result<Option<String>>;

    /// Pins all three component names for the conversation.
    async fn set_choice(
        &self,
        conversation_id: &str,
        llm: &str,
        retriever: &str,
        memory: &str,
    ) -> Result<()>;
}

/// Nearest-neighbour search over chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Stores one vector per chunk. `chunks` and `vectors` are parallel.
    async fn add(&self, chunks: &[Chunk], vectors: &[Vec<f32>], model: &str) -> Result<()>;

    /// Returns the `k` chunks of `pdf_id` most similar to `vector`, best first.
    async fn query(&self, pdf_id: &str, vector: &[f32], k: usize) -> Result<Vec<SourceDocument>>;
}

/// Full-text search over chunk text, for deployments without embeddings.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// Returns up to `k` chunks of `pdf_id` matching `query`, best first.
    async fn search(&self, pdf_id: &str, query: &str, k: usize) -> Result<Vec<SourceDocument>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Pipeline pieces
// ═══════════════════════════════════════════════════════════════════════

/// Finds the chunks relevant to a question.
pub trait Retriever: Send + Sync {
    fn retrieve(&self, query: &str) -> Result<Vec<SourceDocument>>;
}

/// A chat completion backend.
///
/// Implementations only produce tokens; run lifecycle callbacks are issued
/// by [`invoke_model`](crate::llm::invoke_model) around each call.
pub trait ChatModel: Send + Sync {
    /// Model identifier, e.g. `"gpt-4o-mini"`.
    fn name(&self) -> &str;

    /// Serialized invocation settings handed to `on_run_start`.
    ///
    /// The conventional shape is `{"name": .., "kwargs": {"streaming": bool, ..}}`.
    fn run_config(&self) -> Value;

    /// Generates a completion. Streaming models report each fragment through
    /// `listener.on_token` as it arrives and should stop early once
    /// `listener.is_cancelled()` turns true.
    fn generate(
        &self,
        messages: &[PromptMessage],
        listener: &mut dyn GenerationListener,
    ) -> Result<String>;
}

/// Supplies prior turns of the conversation.
pub trait Memory: Send + Sync {
    fn load_history(&self) -> Result<Vec<Message>>;
}

/// A complete, blocking chat pipeline.
pub trait Pipeline: Send + Sync {
    fn run(&self, input: &ChatInput, listener: &mut dyn GenerationListener) -> Result<FinalResult>;
}

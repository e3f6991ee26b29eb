//! # PDF Chat
//!
//! Upload a PDF, then hold a conversation about it.
//!
//! Uploaded PDFs are extracted, chunked and (optionally) embedded into
//! SQLite. Each conversation is answered by a retrieval pipeline assembled
//! from a retriever, a chat model and a memory. Answers can be returned
//! whole or streamed token by token over server-sent events.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │  Upload  │──▶│ Extract+Chunk│──▶│  SQLite    │
//! │  (PDF)   │   │   +Embed     │   │ FTS5+Vec   │
//! └──────────┘   └──────────────┘   └─────┬─────┘
//!                                         │ retrieve
//!                 ┌───────────────────────┤
//!                 ▼                       ▼
//!           ┌───────────┐          ┌────────────┐
//!           │ Pipeline  │─tokens──▶│ TokenStream │──▶ SSE / stdout
//!           │ (worker)  │  relay   └────────────┘
//!           └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pdfchat init
//! pdfchat index ./paper.pdf
//! pdfchat conversation new --pdf <pdf-id>
//! pdfchat ask <conversation-id> "What is the main result?"
//! pdfchat serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | PDF text extraction |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`ingest`] | Upload indexing |
//! | [`store`] | PDFs, conversations and messages |
//! | [`vector_store`] | Vector and full-text chunk search |
//! | [`llm`] | Chat model backends |
//! | [`chat`] | Pipeline assembly |
//! | [`stream`] | Token streaming |
//! | [`server`] | HTTP API |

pub mod chat;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod retriever;
pub mod server;
pub mod store;
pub mod stream;
pub mod traits;
pub mod vector_store;

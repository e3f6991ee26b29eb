//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/pdfs?name=<n>` | Upload raw PDF bytes and index them |
//! | `GET`  | `/api/pdfs` | List PDFs |
//! | `GET`  | `/api/conversations?pdf_id=<id>` | List conversations of a PDF |
//! | `POST` | `/api/conversations?pdf_id=<id>` | Start a conversation |
//! | `GET`  | `/api/conversations/{id}/messages` | Conversation history |
//! | `POST` | `/api/conversations/{id}/messages?stream=<bool>` | Ask a question |
//!
//! # Streaming answers
//!
//! With `stream=true` the answer is sent as server-sent events:
//!
//! ```text
//! data: {"token":"The"}
//! data: {"token":" answer"}
//! data: [DONE]
//! ```
//!
//! If generation fails, a single `data: {"error":"..."}` event ends the
//! stream and no `[DONE]` follows. The question and the assembled answer are
//! stored only after a successful run.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "input must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::chat::{answer_blocking, ChatAssembler};
use crate::config::Config;
use crate::context::RequestContext;
use crate::db;
use crate::embedding;
use crate::extract::{ExtractError, MAX_PDF_BYTES};
use crate::ingest::{IndexedPdf, Indexer};
use crate::migrate;
use crate::models::{ChatArgs, ChatInput, Conversation, Message, Pdf};
use crate::store::SqliteStore;
use crate::stream;
use crate::traits::{MessageStore, Pipeline};
use crate::vector_store::SqliteVectorIndex;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub(crate) store: SqliteStore,
    pub(crate) assembler: Arc<ChatAssembler>,
    pub(crate) indexer: Arc<Indexer>,
}

impl AppState {
    pub fn new(store: SqliteStore, assembler: ChatAssembler, indexer: Indexer) -> Self {
        Self {
            store,
            assembler: Arc::new(assembler),
            indexer: Arc::new(indexer),
        }
    }

    /// Opens the database, applies migrations and wires the configured
    /// embedding provider and chat models.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;

        let store = SqliteStore::new(pool.clone());
        let index = Arc::new(SqliteVectorIndex::new(pool));
        let embedder = embedding::create_provider(&config.embedding)?;

        let assembler =
            ChatAssembler::from_config(config, Arc::new(store.clone()), index.clone(), embedder.clone())?;
        let indexer = Indexer::new(config, store.clone(), index, embedder);

        Ok(Self::new(store, assembler, indexer))
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/api/pdfs",
            get(handle_list_pdfs)
                .post(handle_upload_pdf)
                .layer(DefaultBodyLimit::max(MAX_PDF_BYTES)),
        )
        .route(
            "/api/conversations",
            get(handle_list_conversations).post(handle_create_conversation),
        )
        .route(
            "/api/conversations/{id}/messages",
            get(handle_list_messages).post(handle_create_message),
        )
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "pdf chat server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /api/pdfs ============

#[derive(Deserialize)]
struct UploadParams {
    name: Option<String>,
}

async fn handle_upload_pdf(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<IndexedPdf>, AppError> {
    if body.is_empty() {
        return Err(bad_request("request body must contain the PDF bytes"));
    }
    let name = params
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "upload.pdf".to_string());

    state
        .indexer
        .index_pdf(&name, body.to_vec())
        .await
        .map(Json)
        .map_err(|e| match e.downcast_ref::<ExtractError>() {
            Some(extract) => bad_request(extract.to_string()),
            None => internal(e),
        })
}

async fn handle_list_pdfs(State(state): State<AppState>) -> Result<Json<Vec<Pdf>>, AppError> {
    state.store.list_pdfs().await.map(Json).map_err(internal)
}

// ============ /api/conversations ============

#[derive(Deserialize)]
struct PdfParams {
    pdf_id: Option<String>,
}

async fn require_pdf(state: &AppState, params: PdfParams) -> Result<Pdf, AppError> {
    let pdf_id = params
        .pdf_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| bad_request("pdf_id query parameter is required"))?;
    state
        .store
        .get_pdf(&pdf_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("pdf not found: {}", pdf_id)))
}

async fn handle_list_conversations(
    State(state): State<AppState>,
    Query(params): Query<PdfParams>,
) -> Result<Json<Vec<Conversation>>, AppError> {
    let pdf = require_pdf(&state, params).await?;
    state
        .store
        .list_conversations(&pdf.id)
        .await
        .map(Json)
        .map_err(internal)
}

async fn handle_create_conversation(
    State(state): State<AppState>,
    Query(params): Query<PdfParams>,
) -> Result<Json<Conversation>, AppError> {
    let pdf = require_pdf(&state, params).await?;
    state
        .store
        .create_conversation(&pdf.id)
        .await
        .map(Json)
        .map_err(internal)
}

// ============ /api/conversations/{id}/messages ============

async fn require_conversation(state: &AppState, id: &str) -> Result<Conversation, AppError> {
    state
        .store
        .get_conversation(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("conversation not found: {}", id)))
}

async fn handle_list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, AppError> {
    let conversation = require_conversation(&state, &id).await?;
    state
        .store
        .list(&conversation.id)
        .await
        .map(Json)
        .map_err(internal)
}

#[derive(Deserialize)]
struct MessageParams {
    stream: Option<String>,
}

#[derive(Deserialize)]
struct MessageBody {
    input: String,
}

#[derive(Serialize)]
struct AssistantReply {
    role: String,
    content: String,
}

async fn handle_create_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<MessageParams>,
    Json(body): Json<MessageBody>,
) -> Result<Response, AppError> {
    let input = body.input.trim().to_string();
    if input.is_empty() {
        return Err(bad_request("input must not be empty"));
    }
    let streaming = params
        .stream
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("true"));

    let conversation = require_conversation(&state, &id).await?;
    let args = ChatArgs {
        conversation_id: conversation.id.clone(),
        pdf_id: conversation.pdf_id.clone(),
        streaming,
    };
    let pipeline = state.assembler.build_chat(&args).await.map_err(internal)?;

    let span = tracing::info_span!("chat", conversation_id = %conversation.id, streaming);
    let messages: Arc<dyn MessageStore> = Arc::new(state.store.clone());
    let context = span
        .in_scope(|| RequestContext::capture(&conversation.id, &conversation.pdf_id, messages))
        .map_err(internal)?;

    if streaming {
        stream_reply(state.store.clone(), pipeline, context, input)
    } else {
        blocking_reply(&state.store, pipeline, context, input).await
    }
}

fn stream_reply(
    store: SqliteStore,
    pipeline: Arc<dyn Pipeline>,
    context: RequestContext,
    input: String,
) -> Result<Response, AppError> {
    let conversation_id = context.conversation_id.clone();
    let mut tokens = stream::stream(pipeline, ChatInput::new(input.clone()), Some(Arc::new(context)))
        .map_err(internal)?;

    let events = async_stream::stream! {
        let mut answer = String::new();
        while let Some(token) = tokens.next_token().await {
            answer.push_str(&token);
            yield Ok::<Event, Infallible>(json_event(serde_json::json!({ "token": token })));
        }

        let failure = tokens.error().map(|e| e.to_string());
        if let Some(message) = failure {
            tracing::error!(%conversation_id, error = %message, "streamed answer failed");
            yield Ok(json_event(serde_json::json!({ "error": message })));
        } else if answer.is_empty() {
            tracing::warn!(%conversation_id, "pipeline produced no answer");
            yield Ok(json_event(serde_json::json!({ "error": "no answer was generated" })));
        } else {
            tracing::debug!(
                %conversation_id,
                run_id = %tokens.run_id(),
                tokens = tokens.observed_tokens(),
                answer_len = answer.len(),
                "stream complete"
            );
            persist_exchange(&store, &conversation_id, &input, &answer).await;
            yield Ok(Event::default().data("[DONE]"));
        }
    };

    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

async fn blocking_reply(
    store: &SqliteStore,
    pipeline: Arc<dyn Pipeline>,
    context: RequestContext,
    input: String,
) -> Result<Response, AppError> {
    let conversation_id = context.conversation_id.clone();
    let result = answer_blocking(pipeline, ChatInput::new(input.clone()), context)
        .await
        .map_err(internal)?;

    persist_exchange(store, &conversation_id, &input, &result.answer).await;

    Ok(Json(AssistantReply {
        role: "assistant".to_string(),
        content: result.answer,
    })
    .into_response())
}

fn json_event(value: serde_json::Value) -> Event {
    Event::default().data(value.to_string())
}

/// Stores the question and the answer. Failures are logged, never returned:
/// the reply has already been produced.
async fn persist_exchange(store: &SqliteStore, conversation_id: &str, input: &str, answer: &str) {
    if let Err(e) = store.append_exchange(conversation_id, input, answer).await {
        tracing::error!(%conversation_id, error = %e, "failed to store conversation messages");
    }
}

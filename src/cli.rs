//! Command implementations for the `pdfchat` binary.
//!
//! Each command opens the configured database through [`AppState`] so the
//! CLI and the HTTP server share one wiring of stores, embedder and chat
//! models.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::chat::answer_blocking;
use crate::config::Config;
use crate::context::RequestContext;
use crate::models::{ChatArgs, ChatInput};
use crate::server::AppState;
use crate::stream;
use crate::traits::MessageStore;

/// Log verbosity accepted by `--log-level`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

/// Installs the global tracing subscriber. Logs go to stderr so streamed
/// answers on stdout stay clean.
pub fn init_tracing(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::from(level))
        .with_writer(std::io::stderr)
        .init();
}

pub async fn run_index(config: &Config, path: &Path, name: Option<String>) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let name = name.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string())
    });

    let state = AppState::from_config(config).await?;
    let indexed = state.indexer.index_pdf(&name, bytes).await?;

    println!("Indexed {}", indexed.name);
    println!("  id:       {}", indexed.id);
    println!("  chunks:   {}", indexed.chunks);
    println!("  embedded: {}", indexed.embedded);
    Ok(())
}

pub async fn run_list_pdfs(config: &Config) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let pdfs = state.store.list_pdfs().await?;
    if pdfs.is_empty() {
        println!("No PDFs indexed.");
        return Ok(());
    }
    for pdf in pdfs {
        println!("{}  {}  {}", pdf.id, format_ts_iso(pdf.created_at), pdf.name);
    }
    Ok(())
}

pub async fn run_new_conversation(config: &Config, pdf_id: &str) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let conversation = state.store.create_conversation(pdf_id).await?;
    println!("{}", conversation.id);
    Ok(())
}

/// Asks one question in an existing conversation and stores the exchange.
///
/// When `streaming` is set, tokens are printed as the model produces them.
pub async fn run_ask(
    config: &Config,
    conversation_id: &str,
    question: &str,
    streaming: bool,
) -> Result<()> {
    let question = question.trim();
    if question.is_empty() {
        bail!("question must not be empty");
    }

    let state = AppState::from_config(config).await?;
    let conversation = state
        .store
        .get_conversation(conversation_id)
        .await?
        .with_context(|| format!("conversation not found: {}", conversation_id))?;

    let args = ChatArgs {
        conversation_id: conversation.id.clone(),
        pdf_id: conversation.pdf_id.clone(),
        streaming,
    };
    let pipeline = state.assembler.build_chat(&args).await?;
    let messages: Arc<dyn MessageStore> = Arc::new(state.store.clone());
    let context = RequestContext::capture(&conversation.id, &conversation.pdf_id, messages)?;

    let answer = if streaming {
        let mut tokens = stream::stream(pipeline, ChatInput::new(question), Some(Arc::new(context)))?;
        let mut answer = String::new();
        let mut stdout = std::io::stdout();
        while let Some(token) = tokens.next_token().await {
            print!("{}", token);
            stdout.flush()?;
            answer.push_str(&token);
        }
        println!();

        if let Some(err) = tokens.error() {
            bail!("generation failed: {}", err);
        }
        println!("({} tokens)", tokens.observed_tokens());
        answer
    } else {
        let result = answer_blocking(pipeline, ChatInput::new(question), context).await?;
        println!("{}", result.answer);
        result.answer
    };

    if answer.is_empty() {
        bail!("no answer was generated");
    }
    state
        .store
        .append_exchange(&conversation.id, question, &answer)
        .await
}

pub async fn run_history(config: &Config, conversation_id: &str) -> Result<()> {
    let state = AppState::from_config(config).await?;
    if state.store.get_conversation(conversation_id).await?.is_none() {
        bail!("conversation not found: {}", conversation_id);
    }

    for message in state.store.list(conversation_id).await? {
        println!("[{}] {}", message.role, message.content);
    }
    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_log_level_maps_to_filter() {
        assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::WARN);
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
    }

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
    }
}

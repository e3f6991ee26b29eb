//! Lifecycle callbacks issued by the pipeline while it generates.

use serde_json::Value;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

use super::relay::{RelayItem, RelaySender, RunId};

/// Callbacks invoked on the generation thread.
///
/// Every run that starts is closed by exactly one of
/// [`on_run_end`](Self::on_run_end) or [`on_run_error`](Self::on_run_error).
pub trait GenerationListener: Send {
    fn on_run_start(&mut self, _run_id: RunId, _config: &Value) {}
    fn on_token(&mut self, _token: &str) {}
    fn on_run_end(&mut self, _run_id: RunId) {}
    fn on_run_error(&mut self, _run_id: RunId, _error: &anyhow::Error) {}

    /// True once the consumer has given up on the output.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Listener for callers that only want the final result.
#[derive(Debug, Default)]
pub struct NoopListener;

impl GenerationListener for NoopListener {}

/// Reads `kwargs.streaming` from a run configuration. Anything other than an
/// explicit boolean counts as streaming so that output is never dropped.
pub fn is_streaming_config(config: &Value) -> bool {
    match config.get("kwargs").and_then(|k| k.get("streaming")) {
        Some(Value::Bool(flag)) => *flag,
        _ => true,
    }
}

/// Per-request listener that forwards tokens and terminal markers onto a relay.
pub struct RelayListener {
    sender: RelaySender,
    streaming_runs: HashSet<RunId>,
    cancel: CancellationToken,
}

impl RelayListener {
    pub fn new(sender: RelaySender, cancel: CancellationToken) -> Self {
        Self {
            sender,
            streaming_runs: HashSet::new(),
            cancel,
        }
    }

    /// Whether `run_id` is a live run configured for incremental output.
    pub fn is_streaming(&self, run_id: RunId) -> bool {
        self.streaming_runs.contains(&run_id)
    }

    fn close_run(&mut self, run_id: RunId) {
        let was_streaming = self.streaming_runs.remove(&run_id);
        tracing::debug!(%run_id, was_streaming, "generation run closed");
        self.sender.push(RelayItem::End(run_id));
    }
}

impl GenerationListener for RelayListener {
    fn on_run_start(&mut self, run_id: RunId, config: &Value) {
        let streaming = is_streaming_config(config);
        if streaming {
            self.streaming_runs.insert(run_id);
        }
        tracing::debug!(%run_id, streaming, "generation run started");
    }

    fn on_token(&mut self, token: &str) {
        self.sender.push(RelayItem::Token(token.to_string()));
    }

    fn on_run_end(&mut self, run_id: RunId) {
        self.close_run(run_id);
    }

    fn on_run_error(&mut self, run_id: RunId, error: &anyhow::Error) {
        tracing::warn!(%run_id, error = %error, "generation run failed");
        self.close_run(run_id);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

//! Exposes a background pipeline run as a lazy sequence of tokens.

use anyhow::Context;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::context::RequestContext;
use crate::models::{ChatInput, FinalResult};
use crate::traits::Pipeline;

use super::listener::RelayListener;
use super::relay::{relay, RelayItem, RelayReceiver, RunId};
use super::task::{BackgroundTask, TaskOutcome};

/// Starts `pipeline` on a worker thread and returns the stream of its tokens.
///
/// Fails only if the worker thread cannot be spawned. Pipeline errors never
/// surface as stream items: the stream ends and [`TokenStream::error`]
/// reports the failure.
pub fn stream(
    pipeline: Arc<dyn Pipeline>,
    input: ChatInput,
    context: Option<Arc<RequestContext>>,
) -> anyhow::Result<TokenStream> {
    let (sender, receiver) = relay();
    let cancel = CancellationToken::new();
    let listener = RelayListener::new(sender.clone(), cancel.clone());
    let run_id = RunId::new();

    let task = BackgroundTask::spawn(pipeline, input, listener, sender, run_id, context)
        .context("failed to spawn chat worker thread")?;

    Ok(TokenStream {
        receiver,
        run_id,
        task: Some(task),
        cancel,
        phase: Phase::Draining,
        observed: 0,
        outcome: None,
    })
}

enum Phase {
    Draining,
    Fallback(VecDeque<String>),
    Finished,
}

enum Step {
    Yield(String),
    Skip,
    Drained,
}

/// One-shot token sequence for a single pipeline run.
///
/// Consume it either as a blocking [`Iterator`] or with
/// [`next_token`](Self::next_token) from async code; do not mix the two.
/// Dropping it before exhaustion cancels the run and detaches the worker.
pub struct TokenStream {
    receiver: RelayReceiver,
    run_id: RunId,
    task: Option<BackgroundTask>,
    cancel: CancellationToken,
    phase: Phase,
    observed: usize,
    outcome: Option<TaskOutcome>,
}

impl TokenStream {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Number of tokens relayed by the pipeline (fallback fragments excluded).
    pub fn observed_tokens(&self) -> usize {
        self.observed
    }

    pub fn final_result(&self) -> Option<&FinalResult> {
        self.outcome.as_ref().and_then(TaskOutcome::result)
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.outcome.as_ref().and_then(TaskOutcome::error)
    }

    /// Async counterpart of [`Iterator::next`].
    pub async fn next_token(&mut self) -> Option<String> {
        loop {
            match self.phase {
                Phase::Draining => {
                    let item = self.receiver.pop_async().await;
                    match self.classify(item) {
                        Step::Yield(token) => return Some(token),
                        Step::Skip => continue,
                        Step::Drained => {
                            let outcome = match self.task.take() {
                                Some(task) => tokio::task::spawn_blocking(move || task.join())
                                    .await
                                    .unwrap_or_else(|e| {
                                        TaskOutcome::Failed(anyhow::anyhow!(
                                            "failed to join chat worker: {}",
                                            e
                                        ))
                                    }),
                                None => already_joined(),
                            };
                            self.finish(outcome);
                        }
                    }
                }
                Phase::Fallback(ref mut queue) => {
                    if let Some(token) = queue.pop_front() {
                        return Some(token);
                    }
                    self.phase = Phase::Finished;
                }
                Phase::Finished => return None,
            }
        }
    }

    fn classify(&mut self, item: Option<RelayItem>) -> Step {
        match item {
            Some(RelayItem::Token(token)) => {
                self.observed += 1;
                Step::Yield(token)
            }
            Some(RelayItem::End(id)) if id == self.run_id => Step::Drained,
            Some(RelayItem::End(id)) => {
                tracing::debug!(run_id = %self.run_id, inner = %id, "inner run ended");
                Step::Skip
            }
            // Every sender is gone; the worker's guard has already run.
            None => Step::Drained,
        }
    }

    fn finish(&mut self, outcome: TaskOutcome) {
        let fallback = match outcome.result() {
            Some(result) if self.observed == 0 && !result.answer.is_empty() => {
                tracing::info!(
                    run_id = %self.run_id,
                    "no tokens were streamed; replaying final answer"
                );
                split_preserving_whitespace(&result.answer)
            }
            _ => Vec::new(),
        };

        self.outcome = Some(outcome);
        self.phase = if fallback.is_empty() {
            Phase::Finished
        } else {
            Phase::Fallback(fallback.into())
        };
    }
}

impl Iterator for TokenStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            match self.phase {
                Phase::Draining => {
                    let item = self.receiver.pop();
                    match self.classify(item) {
                        Step::Yield(token) => return Some(token),
                        Step::Skip => continue,
                        Step::Drained => {
                            let outcome = match self.task.take() {
                                Some(task) => task.join(),
                                None => already_joined(),
                            };
                            self.finish(outcome);
                        }
                    }
                }
                Phase::Fallback(ref mut queue) => {
                    if let Some(token) = queue.pop_front() {
                        return Some(token);
                    }
                    self.phase = Phase::Finished;
                }
                Phase::Finished => return None,
            }
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if matches!(self.phase, Phase::Draining) {
            tracing::debug!(run_id = %self.run_id, "token stream abandoned; cancelling run");
            self.cancel.cancel();
        }
    }
}

fn already_joined() -> TaskOutcome {
    TaskOutcome::Failed(anyhow::anyhow!("chat worker already joined"))
}

/// Splits `text` into word fragments, each carrying the whitespace that
/// precedes it, so that concatenating the fragments reproduces `text`.
pub fn split_preserving_whitespace(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut prev_ws = true;

    for (i, c) in text.char_indices() {
        let ws = c.is_whitespace();
        if ws && !prev_ws && i > start {
            out.push(text[start..i].to_string());
            start = i;
        }
        prev_ws = ws;
    }
    if start < text.len() {
        out.push(text[start..].to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::GenerationListener;

    #[test]
    fn test_split_preserving_whitespace() {
        assert_eq!(
            split_preserving_whitespace("Hello there friend"),
            vec!["Hello", " there", " friend"]
        );
        assert!(split_preserving_whitespace("").is_empty());
    }

    #[test]
    fn test_split_reassembles_exactly() {
        for text in [
            "  leading",
            "trailing  ",
            "a  b\n\nc\td",
            "one",
            "   ",
            "ünï cödé  text",
        ] {
            assert_eq!(split_preserving_whitespace(text).concat(), text, "{:?}", text);
        }
    }

    struct Silent(&'static str);

    impl Pipeline for Silent {
        fn run(
            &self,
            _: &ChatInput,
            _: &mut dyn GenerationListener,
        ) -> anyhow::Result<FinalResult> {
            Ok(FinalResult {
                answer: self.0.to_string(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_fallback_counts_no_observed_tokens() {
        let mut tokens = stream(Arc::new(Silent("Hello there friend")), ChatInput::new("q"), None)
            .unwrap();
        let fragments: Vec<String> = tokens.by_ref().collect();
        assert_eq!(fragments.concat(), "Hello there friend");
        assert_eq!(tokens.observed_tokens(), 0);
        assert!(tokens.final_result().is_some());
        assert!(tokens.next().is_none());
    }

    #[test]
    fn test_empty_answer_yields_nothing() {
        let mut tokens = stream(Arc::new(Silent("")), ChatInput::new("q"), None).unwrap();
        assert!(tokens.next().is_none());
        assert_eq!(tokens.final_result().unwrap().answer, "");
    }
}

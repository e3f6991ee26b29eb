//! End-to-end behaviour of the token stream against scripted pipelines.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pdf_chat::context::{self, RequestContext};
use pdf_chat::llm::invoke_model;
use pdf_chat::models::{ChatInput, FinalResult, Message, PromptMessage, Role};
use pdf_chat::stream::{self, GenerationListener};
use pdf_chat::traits::{ChatModel, MessageStore, Pipeline};

/// A model that replays fixed tokens, optionally failing afterwards.
struct Scripted {
    tokens: Vec<&'static str>,
    streaming: bool,
    fail: bool,
}

impl Scripted {
    fn streaming(tokens: &[&'static str]) -> Self {
        Self {
            tokens: tokens.to_vec(),
            streaming: true,
            fail: false,
        }
    }

    fn silent(answer: &'static str) -> Self {
        Self {
            tokens: vec![answer],
            streaming: false,
            fail: false,
        }
    }
}

impl ChatModel for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run_config(&self) -> Value {
        json!({ "name": "scripted", "kwargs": { "streaming": self.streaming } })
    }

    fn generate(&self, _: &[PromptMessage], listener: &mut dyn GenerationListener) -> Result<String> {
        let mut text = String::new();
        for token in &self.tokens {
            if self.streaming {
                listener.on_token(token);
            }
            text.push_str(token);
        }
        if self.fail {
            bail!("model connection reset");
        }
        Ok(text)
    }
}

/// Runs each model in turn as its own sub-run; the last one's text is the answer.
struct Chain(Vec<Scripted>);

impl Pipeline for Chain {
    fn run(&self, _: &ChatInput, listener: &mut dyn GenerationListener) -> Result<FinalResult> {
        let mut answer = String::new();
        for model in &self.0 {
            answer = invoke_model(model, &[PromptMessage::user("q")], listener)?;
        }
        Ok(FinalResult {
            answer,
            ..Default::default()
        })
    }
}

struct Throws;

impl Pipeline for Throws {
    fn run(&self, _: &ChatInput, _: &mut dyn GenerationListener) -> Result<FinalResult> {
        bail!("retriever unavailable")
    }
}

fn collect(pipeline: impl Pipeline + 'static) -> (Vec<String>, stream::TokenStream) {
    let mut tokens = stream::stream(Arc::new(pipeline), ChatInput::new("q"), None).unwrap();
    let collected: Vec<String> = tokens.by_ref().collect();
    (collected, tokens)
}

#[test]
fn tokens_arrive_in_order() {
    let (tokens, stream) = collect(Chain(vec![Scripted::streaming(&["The", " quick", " fox"])]));
    assert_eq!(tokens, vec!["The", " quick", " fox"]);
    assert_eq!(stream.observed_tokens(), 3);
    assert_eq!(stream.final_result().unwrap().answer, "The quick fox");
}

#[test]
fn final_answer_replayed_when_nothing_streamed() {
    let (tokens, stream) = collect(Chain(vec![Scripted::silent("Hello there friend")]));
    assert_eq!(tokens, vec!["Hello", " there", " friend"]);
    assert_eq!(stream.observed_tokens(), 0);
    assert_eq!(tokens.concat(), "Hello there friend");
}

#[test]
fn inner_run_markers_do_not_end_iteration() {
    let (tokens, mut stream) = collect(Chain(vec![
        Scripted::silent("standalone question"),
        Scripted::streaming(&["First", " answer"]),
        Scripted::streaming(&[" and", " more"]),
    ]));
    assert_eq!(tokens, vec!["First", " answer", " and", " more"]);
    assert!(stream.error().is_none());
    assert_eq!(stream.next(), None);
}

#[test]
fn failing_second_sub_run_still_terminates() {
    let (tokens, stream) = collect(Chain(vec![
        Scripted::silent("standalone question"),
        Scripted {
            tokens: vec!["partial"],
            streaming: true,
            fail: true,
        },
    ]));
    assert_eq!(tokens, vec!["partial"]);
    let err = stream.error().expect("run should have failed");
    assert!(err.to_string().contains("connection reset"));
}

#[test]
fn throwing_pipeline_yields_nothing() {
    let (tokens, stream) = collect(Throws);
    assert!(tokens.is_empty());
    assert!(stream.error().is_some());
    assert!(stream.final_result().is_none());
}

#[test]
fn empty_answer_yields_nothing() {
    let (tokens, stream) = collect(Chain(vec![Scripted::silent("")]));
    assert!(tokens.is_empty());
    assert!(stream.error().is_none());
}

/// Emits tokens until the consumer goes away.
struct Endless {
    saw_cancel: Arc<AtomicBool>,
}

impl Pipeline for Endless {
    fn run(&self, _: &ChatInput, listener: &mut dyn GenerationListener) -> Result<FinalResult> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if listener.is_cancelled() {
                self.saw_cancel.store(true, Ordering::SeqCst);
                bail!("cancelled");
            }
            listener.on_token("tick ");
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(FinalResult::default())
    }
}

#[test]
fn dropping_the_stream_cancels_the_run() {
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let mut tokens = stream::stream(
        Arc::new(Endless {
            saw_cancel: saw_cancel.clone(),
        }),
        ChatInput::new("q"),
        None,
    )
    .unwrap();

    assert_eq!(tokens.next().as_deref(), Some("tick "));
    drop(tokens);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !saw_cancel.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(saw_cancel.load(Ordering::SeqCst));
}

struct Recorded(Mutex<Vec<Message>>);

#[async_trait]
impl MessageStore for Recorded {
    async fn append(&self, conversation_id: &str, role: Role, content: &str) -> Result<Message> {
        let message = Message {
            id: format!("m{}", self.0.lock().unwrap().len()),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: 0,
        };
        self.0.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn list(&self, _: &str) -> Result<Vec<Message>> {
        Ok(self.0.lock().unwrap().clone())
    }
}

/// Reports what the worker thread can see of the request.
struct Introspect;

impl Pipeline for Introspect {
    fn run(&self, _: &ChatInput, listener: &mut dyn GenerationListener) -> Result<FinalResult> {
        let ctx = context::current()?;
        let history = ctx.block_on(ctx.messages.list(&ctx.conversation_id))?;
        listener.on_token(&ctx.conversation_id);
        listener.on_token(&format!(" {}", history.len()));
        Ok(FinalResult {
            answer: format!("{} {}", ctx.conversation_id, history.len()),
            ..Default::default()
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn request_context_visible_on_worker() {
    let store = Arc::new(Recorded(Mutex::new(Vec::new())));
    store.append("conv-1", Role::Human, "earlier").await.unwrap();

    let ctx = RequestContext::capture("conv-1", "pdf-1", store).unwrap();
    let mut tokens = stream::stream(Arc::new(Introspect), ChatInput::new("q"), Some(Arc::new(ctx))).unwrap();

    let mut seen = Vec::new();
    while let Some(token) = tokens.next_token().await {
        seen.push(token);
    }
    assert_eq!(seen, vec!["conv-1", " 1"]);
    assert!(tokens.error().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_context_fails_the_run() {
    let mut tokens = stream::stream(Arc::new(Introspect), ChatInput::new("q"), None).unwrap();
    assert_eq!(tokens.next_token().await, None);
    assert!(tokens.error().is_some());
}

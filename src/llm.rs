//! Chat model backends.
//!
//! Two HTTP backends implement [`ChatModel`]:
//! - **[`OpenAIChatModel`]**: `POST /v1/chat/completions`, streamed as
//!   server-sent events (`data: {...}` lines ending with `data: [DONE]`).
//! - **[`OllamaChatModel`]**: `POST /api/chat`, streamed as one JSON object
//!   per line.
//!
//! Both are blocking and run on the chat worker thread. A model built with
//! `streaming = false` requests a single complete response and reports no
//! tokens. Run lifecycle callbacks are issued by [`invoke_model`], not by the
//! backends.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader};

use crate::config::LlmConfig;
use crate::http::LazyClient;
use crate::models::PromptMessage;
use crate::stream::{GenerationListener, RunId};
use crate::traits::ChatModel;

/// Runs one model call as its own generation run.
///
/// The run is opened with the model's [`run_config`](ChatModel::run_config)
/// and closed with `on_run_end` or `on_run_error`, so every nested call
/// leaves exactly one terminal marker on a relay.
pub fn invoke_model(
    model: &dyn ChatModel,
    messages: &[PromptMessage],
    listener: &mut dyn GenerationListener,
) -> Result<String> {
    let run_id = RunId::new();
    listener.on_run_start(run_id, &model.run_config());

    match model.generate(messages, listener) {
        Ok(text) => {
            listener.on_run_end(run_id);
            Ok(text)
        }
        Err(e) => {
            listener.on_run_error(run_id, &e);
            Err(e)
        }
    }
}

/// Builds the configured backend for `model_name`.
pub fn create_chat_model(
    config: &LlmConfig,
    model_name: &str,
    streaming: bool,
    temperature: f32,
) -> Result<Box<dyn ChatModel>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAIChatModel::new(
            config,
            model_name,
            streaming,
            temperature,
        )?)),
        "ollama" => Ok(Box::new(OllamaChatModel::new(
            config,
            model_name,
            streaming,
            temperature,
        ))),
        other => bail!("Unknown llm provider: {}", other),
    }
}

fn run_config_value(name: &str, streaming: bool, temperature: f32) -> Value {
    json!({
        "name": name,
        "kwargs": {
            "model": name,
            "streaming": streaming,
            "temperature": temperature,
        }
    })
}

fn ensure_success(response: reqwest::blocking::Response, service: &str) -> Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    bail!("{} API error {}: {}", service, status, body)
}

// ============ OpenAI ============

pub struct OpenAIChatModel {
    model: String,
    streaming: bool,
    temperature: f32,
    endpoint: String,
    api_key: String,
    client: LazyClient,
}

impl OpenAIChatModel {
    /// Requires the `OPENAI_API_KEY` environment variable.
    pub fn new(config: &LlmConfig, model: &str, streaming: bool, temperature: f32) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model: model.to_string(),
            streaming,
            temperature,
            endpoint: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            api_key,
            client: LazyClient::new(config.timeout_secs),
        })
    }
}

impl ChatModel for OpenAIChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    fn run_config(&self) -> Value {
        run_config_value(&self.model, self.streaming, self.temperature)
    }

    fn generate(
        &self,
        messages: &[PromptMessage],
        listener: &mut dyn GenerationListener,
    ) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": self.streaming,
        });

        let response = self
            .client
            .get()?
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .context("OpenAI connection error")?;
        let response = ensure_success(response, "OpenAI")?;

        if !self.streaming {
            let json: Value = response.json()?;
            return json
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"));
        }

        let mut answer = String::new();
        for line in BufReader::new(response).lines() {
            if listener.is_cancelled() {
                bail!("generation cancelled");
            }
            match parse_sse_line(&line?)? {
                SseLine::Token(token) => {
                    listener.on_token(&token);
                    answer.push_str(&token);
                }
                SseLine::Done => break,
                SseLine::Skip => {}
            }
        }
        Ok(answer)
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

/// Decodes one line of a chat-completions event stream.
fn parse_sse_line(line: &str) -> Result<SseLine> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let json: Value =
        serde_json::from_str(data).with_context(|| format!("Invalid OpenAI stream event: {}", data))?;
    match json.pointer("/choices/0/delta/content").and_then(Value::as_str) {
        Some(token) if !token.is_empty() => Ok(SseLine::Token(token.to_string())),
        _ => Ok(SseLine::Skip),
    }
}

// ============ Ollama ============

pub struct OllamaChatModel {
    model: String,
    streaming: bool,
    temperature: f32,
    endpoint: String,
    client: LazyClient,
}

impl OllamaChatModel {
    pub fn new(config: &LlmConfig, model: &str, streaming: bool, temperature: f32) -> Self {
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Self {
            model: model.to_string(),
            streaming,
            temperature,
            endpoint: format!("{}/api/chat", base.trim_end_matches('/')),
            client: LazyClient::new(config.timeout_secs),
        }
    }
}

impl ChatModel for OllamaChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    fn run_config(&self) -> Value {
        run_config_value(&self.model, self.streaming, self.temperature)
    }

    fn generate(
        &self,
        messages: &[PromptMessage],
        listener: &mut dyn GenerationListener,
    ) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": self.streaming,
            "options": { "temperature": self.temperature },
        });

        let response = self
            .client
            .get()?
            .post(&self.endpoint)
            .json(&body)
            .send()
            .context("Ollama connection error")?;
        let response = ensure_success(response, "Ollama")?;

        if !self.streaming {
            let json: Value = response.json()?;
            let (content, _) = parse_ollama_line(&json)?;
            return Ok(content);
        }

        let mut answer = String::new();
        for line in BufReader::new(response).lines() {
            if listener.is_cancelled() {
                bail!("generation cancelled");
            }
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let json: Value = serde_json::from_str(&line)
                .with_context(|| format!("Invalid Ollama stream line: {}", line))?;
            let (token, done) = parse_ollama_line(&json)?;
            if !token.is_empty() {
                listener.on_token(&token);
                answer.push_str(&token);
            }
            if done {
                break;
            }
        }
        Ok(answer)
    }
}

/// Extracts `(message.content, done)` from one Ollama chat object.
fn parse_ollama_line(json: &Value) -> Result<(String, bool)> {
    if let Some(error) = json.get("error").and_then(Value::as_str) {
        bail!("Ollama error: {}", error);
    }
    let content = json
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let done = json.get("done").and_then(Value::as_bool).unwrap_or(false);
    Ok((content, done))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::is_streaming_config;

    #[test]
    fn test_parse_sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap(),
            SseLine::Token("Hel".to_string())
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            SseLine::Skip
        );
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[test]
    fn test_parse_ollama_lines() {
        let (token, done) =
            parse_ollama_line(&json!({"message": {"role": "assistant", "content": "Hi"}, "done": false}))
                .unwrap();
        assert_eq!((token.as_str(), done), ("Hi", false));

        let (token, done) = parse_ollama_line(&json!({"done": true})).unwrap();
        assert_eq!((token.as_str(), done), ("", true));

        assert!(parse_ollama_line(&json!({"error": "model not found"})).is_err());
    }

    #[test]
    fn test_run_config_carries_streaming_flag() {
        let config = LlmConfig::default();
        let quiet = OllamaChatModel::new(&config, "llama3", false, 0.0);
        let loud = OllamaChatModel::new(&config, "llama3", true, 0.7);
        assert!(!is_streaming_config(&quiet.run_config()));
        assert!(is_streaming_config(&loud.run_config()));
        assert_eq!(loud.name(), "llama3");
    }

    struct Recorder {
        events: Vec<String>,
    }

    impl GenerationListener for Recorder {
        fn on_run_start(&mut self, _: RunId, _: &Value) {
            self.events.push("start".to_string());
        }
        fn on_token(&mut self, token: &str) {
            self.events.push(format!("token:{}", token));
        }
        fn on_run_end(&mut self, _: RunId) {
            self.events.push("end".to_string());
        }
        fn on_run_error(&mut self, _: RunId, e: &anyhow::Error) {
            self.events.push(format!("error:{}", e));
        }
    }

    struct Echo(bool);

    impl ChatModel for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn run_config(&self) -> Value {
            run_config_value("echo", true, 0.0)
        }
        fn generate(&self, messages: &[PromptMessage], l: &mut dyn GenerationListener) -> Result<String> {
            if self.0 {
                bail!("rate limited");
            }
            l.on_token(&messages[0].content);
            Ok(messages[0].content.clone())
        }
    }

    #[test]
    fn test_invoke_model_brackets_run() {
        let mut rec = Recorder { events: Vec::new() };
        let out = invoke_model(&Echo(false), &[PromptMessage::user("hey")], &mut rec).unwrap();
        assert_eq!(out, "hey");
        assert_eq!(rec.events, vec!["start", "token:hey", "end"]);

        let mut rec = Recorder { events: Vec::new() };
        assert!(invoke_model(&Echo(true), &[PromptMessage::user("hey")], &mut rec).is_err());
        assert_eq!(rec.events, vec!["start", "error:rate limited"]);
    }
}

//! Core data models.
//!
//! These types describe the PDFs, conversations, messages and chunks stored in
//! SQLite, plus the values that flow through one chat pipeline execution.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Ai => "ai",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "human" => Ok(Role::Human),
            "ai" => Ok(Role::Ai),
            "system" => Ok(Role::System),
            other => anyhow::bail!("invalid message role: {}", other),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded PDF.
#[derive(Debug, Clone, Serialize)]
pub struct Pdf {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

/// A conversation about one PDF. The component names are `None` until the
/// first message pins them.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub pdf_id: String,
    pub retriever: Option<String>,
    pub llm: Option<String>,
    pub memory: Option<String>,
    pub created_at: i64,
}

/// One persisted message.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
}

/// A chunk of a PDF's extracted text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub pdf_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// A chunk returned by a retriever, with its similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDocument {
    pub chunk_id: String,
    pub pdf_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f32,
}

/// A message handed to a chat model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Input to one pipeline execution.
#[derive(Debug, Clone)]
pub struct ChatInput {
    pub question: String,
}

impl ChatInput {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
        }
    }
}

/// Complete structured output of one pipeline execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FinalResult {
    pub answer: String,
    pub sources: Vec<SourceDocument>,
    /// The standalone question produced by the condense step, when it ran.
    pub generated_question: Option<String>,
}

/// Per-request arguments used to assemble a chat pipeline.
#[derive(Debug, Clone)]
pub struct ChatArgs {
    pub conversation_id: String,
    pub pdf_id: String,
    pub streaming: bool,
}

/// The three pluggable pieces of a chat pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
    Retriever,
    Llm,
    Memory,
}

impl ComponentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Retriever => "retriever",
            ComponentType::Llm => "llm",
            ComponentType::Memory => "memory",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip_through_str() {
        for role in [Role::Human, Role::Ai, Role::System] {
            assert_eq!(Role::parse(role.as_str()).unwrap(), role);
        }
        assert!(Role::parse("assistant").is_err());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Ai).unwrap(), "\"ai\"");
    }
}

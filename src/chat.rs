//! Chat pipeline assembly.
//!
//! A conversation is answered by a [`ConversationalRetrievalPipeline`] built
//! from one retriever, one chat model and one memory. Each kind of component
//! has a [`ComponentMap`] of named builders. The first message of a
//! conversation picks a name from each map at random; the choice is pinned in
//! the [`ComponentRegistry`] so every follow-up question is answered by the
//! same combination.
//!
//! ```text
//!  ChatArgs ─▶ ChatAssembler::build_chat
//!                 ├─ retriever: previous choice ∨ random   (vec_k2, vec_k3, ..)
//!                 ├─ llm:       previous choice ∨ random   (gpt-4o-mini, ..)
//!                 ├─ memory:    previous choice ∨ random   (sql_buffer, sql_window)
//!                 └─ set_choice(llm, retriever, memory)
//!
//!  Pipeline::run(question)
//!     history = memory.load_history()
//!     question' = history.is_empty() ? question : condense(history, question)
//!     sources  = retriever.retrieve(question')
//!     answer   = llm(qa_prompt(sources, question'))
//! ```

use anyhow::{bail, Result};
use rand::seq::SliceRandom;
use std::sync::Arc;

use crate::config::Config;
use crate::context::RequestContext;
use crate::embedding::EmbeddingProvider;
use crate::llm::{create_chat_model, invoke_model};
use crate::memory::{SqlBufferMemory, SqlWindowMemory};
use crate::models::{
    ChatArgs, ChatInput, ComponentType, FinalResult, Message, PromptMessage, Role, SourceDocument,
};
use crate::retriever::{KeywordRetriever, VectorRetriever};
use crate::stream::{GenerationListener, NoopListener};
use crate::traits::{
    ChatModel, ComponentRegistry, KeywordIndex, Memory, Pipeline, Retriever, VectorIndex,
};

const CONDENSE_QUESTION_PROMPT: &str = "\
Given the following conversation and a follow up question, rephrase the follow up question to be a standalone question.
If the follow up question is already standalone and doesn't reference the chat history, return it exactly as provided.

IMPORTANT: Preserve the original meaning and intent of the question. Do not change what is being asked.

Chat History:
{chat_history}

Follow Up Question: {question}

Standalone Question:";

const QA_PROMPT: &str = "\
You are a helpful AI assistant. Use the following pieces of context to answer the question at the end.
If you don't know the answer based on the context provided, just say that you don't have enough information to answer. Don't make up an answer.

Context:
{context}

Question: {question}

Answer:";

/// Builds one component for a request.
pub type Builder<T> = Box<dyn Fn(&ChatArgs) -> Result<Arc<T>> + Send + Sync>;

/// Named builders for one kind of component.
pub struct ComponentMap<T: ?Sized> {
    entries: Vec<(String, Builder<T>)>,
}

impl<T: ?Sized> ComponentMap<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers `builder` under `name`, replacing an earlier entry with the same name.
    pub fn register(&mut self, name: impl Into<String>, builder: Builder<T>) {
        let name = name.into();
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, builder));
    }

    pub fn find(&self, name: &str) -> Option<&Builder<T>> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keeps `previous` when it names a registered builder, otherwise picks
    /// a random name.
    fn choose(&self, previous: Option<String>) -> Option<String> {
        if let Some(name) = previous {
            if self.find(&name).is_some() {
                return Some(name);
            }
            tracing::warn!(component = %name, "previous component no longer configured; choosing again");
        }
        self.names()
            .choose(&mut rand::thread_rng())
            .map(|n| n.to_string())
    }

    fn build(&self, name: &str, args: &ChatArgs) -> Result<Arc<T>> {
        match self.find(name) {
            Some(builder) => builder(args),
            None => bail!("unknown component: {}", name),
        }
    }
}

impl<T: ?Sized> Default for ComponentMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Assembles per-request chat pipelines.
pub struct ChatAssembler {
    registry: Arc<dyn ComponentRegistry>,
    retrievers: ComponentMap<dyn Retriever>,
    llms: ComponentMap<dyn ChatModel>,
    memories: ComponentMap<dyn Memory>,
    condense_llm: Builder<dyn ChatModel>,
}

impl ChatAssembler {
    pub fn new(
        registry: Arc<dyn ComponentRegistry>,
        retrievers: ComponentMap<dyn Retriever>,
        llms: ComponentMap<dyn ChatModel>,
        memories: ComponentMap<dyn Memory>,
        condense_llm: Builder<dyn ChatModel>,
    ) -> Result<Self> {
        if retrievers.is_empty() || llms.is_empty() || memories.is_empty() {
            bail!("chat assembler needs at least one retriever, llm and memory");
        }
        Ok(Self {
            registry,
            retrievers,
            llms,
            memories,
            condense_llm,
        })
    }

    /// Registers the components described by `config`.
    ///
    /// Retrievers are `vec_k<k>` when an embedder is given and `fts_k<k>`
    /// otherwise, one per `retrieval.k_values` entry. Every model in
    /// `llm.models` becomes an llm of the same name. Memories are
    /// `sql_buffer` and `sql_window`.
    pub fn from_config<I>(
        config: &Config,
        registry: Arc<dyn ComponentRegistry>,
        index: Arc<I>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self>
    where
        I: VectorIndex + KeywordIndex + 'static,
    {
        let mut retrievers: ComponentMap<dyn Retriever> = ComponentMap::new();
        if let Some(embedder) = embedder {
            for &k in &config.retrieval.k_values {
                let index: Arc<dyn VectorIndex> = index.clone();
                let embedder = embedder.clone();
                retrievers.register(
                    format!("vec_k{}", k),
                    Box::new(move |args: &ChatArgs| -> Result<Arc<dyn Retriever>> {
                        Ok(Arc::new(VectorRetriever::new(
                            index.clone(),
                            embedder.clone(),
                            args.pdf_id.clone(),
                            k,
                        )) as Arc<dyn Retriever>)
                    }),
                );
            }
        } else {
            for &k in &config.retrieval.k_values {
                let index: Arc<dyn KeywordIndex> = index.clone();
                retrievers.register(
                    format!("fts_k{}", k),
                    Box::new(move |args: &ChatArgs| -> Result<Arc<dyn Retriever>> {
                        Ok(Arc::new(KeywordRetriever::new(index.clone(), args.pdf_id.clone(), k))
                            as Arc<dyn Retriever>)
                    }),
                );
            }
        }

        let mut llms: ComponentMap<dyn ChatModel> = ComponentMap::new();
        for model in &config.llm.models {
            let llm_config = config.llm.clone();
            let model_name = model.clone();
            llms.register(
                model.clone(),
                Box::new(move |args: &ChatArgs| -> Result<Arc<dyn ChatModel>> {
                    let model = create_chat_model(
                        &llm_config,
                        &model_name,
                        args.streaming,
                        llm_config.temperature,
                    )?;
                    Ok(Arc::from(model))
                }),
            );
        }

        let mut memories: ComponentMap<dyn Memory> = ComponentMap::new();
        memories.register(
            "sql_buffer",
            Box::new(|_: &ChatArgs| -> Result<Arc<dyn Memory>> { Ok(Arc::new(SqlBufferMemory)) }),
        );
        let turns = config.memory.window_turns;
        memories.register(
            "sql_window",
            Box::new(move |_: &ChatArgs| -> Result<Arc<dyn Memory>> {
                Ok(Arc::new(SqlWindowMemory::new(turns)))
            }),
        );

        let llm_config = config.llm.clone();
        let condense_llm: Builder<dyn ChatModel> =
            Box::new(move |_: &ChatArgs| -> Result<Arc<dyn ChatModel>> {
                let model = create_chat_model(&llm_config, &llm_config.condense_model, false, 0.0)?;
                Ok(Arc::from(model))
            });

        Self::new(registry, retrievers, llms, memories, condense_llm)
    }

    /// Builds the pipeline for one request and pins the chosen component names.
    pub async fn build_chat(&self, args: &ChatArgs) -> Result<Arc<dyn Pipeline>> {
        let retriever_name = self
            .select(&self.retrievers, ComponentType::Retriever, args)
            .await?;
        let llm_name = self.select(&self.llms, ComponentType::Llm, args).await?;
        let memory_name = self
            .select(&self.memories, ComponentType::Memory, args)
            .await?;

        let retriever = self.retrievers.build(&retriever_name, args)?;
        let llm = self.llms.build(&llm_name, args)?;
        let memory = self.memories.build(&memory_name, args)?;
        let condense_llm = (self.condense_llm)(args)?;

        tracing::info!(
            conversation_id = %args.conversation_id,
            llm = %llm_name,
            retriever = %retriever_name,
            memory = %memory_name,
            streaming = args.streaming,
            "assembled chat pipeline"
        );

        self.registry
            .set_choice(&args.conversation_id, &llm_name, &retriever_name, &memory_name)
            .await?;

        Ok(Arc::new(ConversationalRetrievalPipeline {
            retriever,
            llm,
            condense_llm,
            memory,
        }))
    }

    async fn select<T: ?Sized>(
        &self,
        map: &ComponentMap<T>,
        component: ComponentType,
        args: &ChatArgs,
    ) -> Result<String> {
        let previous = self
            .registry
            .get_previous_choice(&args.conversation_id, component)
            .await?;
        map.choose(previous)
            .ok_or_else(|| anyhow::anyhow!("no {} configured", component.as_str()))
    }
}

/// Condense the follow-up question against history, retrieve, then answer.
pub struct ConversationalRetrievalPipeline {
    pub retriever: Arc<dyn Retriever>,
    pub llm: Arc<dyn ChatModel>,
    pub condense_llm: Arc<dyn ChatModel>,
    pub memory: Arc<dyn Memory>,
}

impl Pipeline for ConversationalRetrievalPipeline {
    fn run(&self, input: &ChatInput, listener: &mut dyn GenerationListener) -> Result<FinalResult> {
        let history = self.memory.load_history()?;

        let mut generated_question = None;
        let question = if history.is_empty() {
            input.question.clone()
        } else {
            ensure_live(listener)?;
            let prompt = CONDENSE_QUESTION_PROMPT
                .replace("{chat_history}", &format_history(&history))
                .replace("{question}", &input.question);
            let condensed = invoke_model(
                self.condense_llm.as_ref(),
                &[PromptMessage::user(prompt)],
                listener,
            )?;
            let condensed = condensed.trim().to_string();
            tracing::debug!(question = %condensed, "condensed follow-up question");
            generated_question = Some(condensed.clone());
            condensed
        };

        ensure_live(listener)?;
        let sources = self.retriever.retrieve(&question)?;

        ensure_live(listener)?;
        let prompt = QA_PROMPT
            .replace("{context}", &format_context(&sources))
            .replace("{question}", &question);
        let answer = invoke_model(self.llm.as_ref(), &[PromptMessage::user(prompt)], listener)?;

        Ok(FinalResult {
            answer,
            sources,
            generated_question,
        })
    }
}

/// Runs `pipeline` to completion on the blocking pool with `context`
/// installed. No tokens are relayed.
pub async fn answer_blocking(
    pipeline: Arc<dyn Pipeline>,
    input: ChatInput,
    context: RequestContext,
) -> Result<FinalResult> {
    let context = Arc::new(context);
    tokio::task::spawn_blocking(move || {
        let _guard = context.install();
        pipeline.run(&input, &mut NoopListener)
    })
    .await
    .map_err(|e| anyhow::anyhow!("chat task failed: {}", e))?
}

fn ensure_live(listener: &dyn GenerationListener) -> Result<()> {
    if listener.is_cancelled() {
        bail!("generation cancelled");
    }
    Ok(())
}

fn format_history(history: &[Message]) -> String {
    history
        .iter()
        .map(|m| {
            let speaker = match m.role {
                Role::Human => "Human",
                Role::Ai => "Assistant",
                Role::System => "System",
            };
            format!("{}: {}", speaker, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_context(sources: &[SourceDocument]) -> String {
    sources
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::RunId;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemRegistry {
        choices: Mutex<HashMap<String, (String, String, String)>>,
    }

    #[async_trait]
    impl ComponentRegistry for MemRegistry {
        async fn get_previous_choice(&self, conv: &str, c: ComponentType) -> Result<Option<String>> {
            let choices = self.choices.lock().unwrap();
            Ok(choices.get(conv).map(|(llm, retriever, memory)| match c {
                ComponentType::Llm => llm.clone(),
                ComponentType::Retriever => retriever.clone(),
                ComponentType::Memory => memory.clone(),
            }))
        }

        async fn set_choice(&self, conv: &str, llm: &str, retriever: &str, memory: &str) -> Result<()> {
            self.choices.lock().unwrap().insert(
                conv.to_string(),
                (llm.to_string(), retriever.to_string(), memory.to_string()),
            );
            Ok(())
        }
    }

    struct Canned(&'static str);

    impl ChatModel for Canned {
        fn name(&self) -> &str {
            self.0
        }
        fn run_config(&self) -> Value {
            json!({"kwargs": {"streaming": false}})
        }
        fn generate(&self, _: &[PromptMessage], _: &mut dyn GenerationListener) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct NoDocs;

    impl Retriever for NoDocs {
        fn retrieve(&self, _: &str) -> Result<Vec<SourceDocument>> {
            Ok(Vec::new())
        }
    }

    struct History(Vec<Message>);

    impl Memory for History {
        fn load_history(&self) -> Result<Vec<Message>> {
            Ok(self.0.clone())
        }
    }

    fn assembler(registry: Arc<MemRegistry>) -> ChatAssembler {
        let mut retrievers: ComponentMap<dyn Retriever> = ComponentMap::new();
        for name in ["r1", "r2", "r3"] {
            retrievers.register(name, Box::new(|_: &ChatArgs| -> Result<Arc<dyn Retriever>> { Ok(Arc::new(NoDocs)) }));
        }
        let mut llms: ComponentMap<dyn ChatModel> = ComponentMap::new();
        llms.register("m1", Box::new(|_: &ChatArgs| -> Result<Arc<dyn ChatModel>> { Ok(Arc::new(Canned("m1"))) }));
        llms.register("m2", Box::new(|_: &ChatArgs| -> Result<Arc<dyn ChatModel>> { Ok(Arc::new(Canned("m2"))) }));
        let mut memories: ComponentMap<dyn Memory> = ComponentMap::new();
        memories.register("mem", Box::new(|_: &ChatArgs| -> Result<Arc<dyn Memory>> { Ok(Arc::new(History(Vec::new()))) }));

        ChatAssembler::new(
            registry,
            retrievers,
            llms,
            memories,
            Box::new(|_: &ChatArgs| -> Result<Arc<dyn ChatModel>> { Ok(Arc::new(Canned("condensed"))) }),
        )
        .unwrap()
    }

    fn args(conv: &str) -> ChatArgs {
        ChatArgs {
            conversation_id: conv.to_string(),
            pdf_id: "pdf".to_string(),
            streaming: true,
        }
    }

    #[tokio::test]
    async fn test_choices_pinned_across_requests() {
        let registry = Arc::new(MemRegistry::default());
        let assembler = assembler(registry.clone());

        assembler.build_chat(&args("c1")).await.unwrap();
        let first = registry.choices.lock().unwrap().get("c1").cloned().unwrap();

        for _ in 0..10 {
            assembler.build_chat(&args("c1")).await.unwrap();
            let again = registry.choices.lock().unwrap().get("c1").cloned().unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(first.2, "mem");
    }

    #[tokio::test]
    async fn test_unknown_previous_choice_replaced() {
        let registry = Arc::new(MemRegistry::default());
        registry
            .set_choice("c1", "retired-model", "r1", "mem")
            .await
            .unwrap();
        let assembler = assembler(registry.clone());

        assembler.build_chat(&args("c1")).await.unwrap();
        let (llm, retriever, _) = registry.choices.lock().unwrap().get("c1").cloned().unwrap();
        assert!(llm == "m1" || llm == "m2");
        assert_eq!(retriever, "r1");
    }

    #[test]
    fn test_empty_map_rejected() {
        let result = ChatAssembler::new(
            Arc::new(MemRegistry::default()),
            ComponentMap::new(),
            ComponentMap::new(),
            ComponentMap::new(),
            Box::new(|_: &ChatArgs| -> Result<Arc<dyn ChatModel>> { Ok(Arc::new(Canned("c"))) }),
        );
        assert!(result.is_err());
    }

    #[derive(Default)]
    struct Runs(Vec<RunId>);

    impl GenerationListener for Runs {
        fn on_run_start(&mut self, run_id: RunId, _: &Value) {
            self.0.push(run_id);
        }
    }

    fn pipeline(history: Vec<Message>) -> ConversationalRetrievalPipeline {
        ConversationalRetrievalPipeline {
            retriever: Arc::new(NoDocs),
            llm: Arc::new(Canned("the answer")),
            condense_llm: Arc::new(Canned("standalone?")),
            memory: Arc::new(History(history)),
        }
    }

    #[test]
    fn test_first_question_skips_condense() {
        let mut runs = Runs::default();
        let result = pipeline(Vec::new())
            .run(&ChatInput::new("what?"), &mut runs)
            .unwrap();
        assert_eq!(result.answer, "the answer");
        assert_eq!(result.generated_question, None);
        assert_eq!(runs.0.len(), 1);
    }

    #[test]
    fn test_follow_up_is_condensed() {
        let history = vec![Message {
            id: "1".to_string(),
            conversation_id: "c".to_string(),
            role: Role::Human,
            content: "hi".to_string(),
            created_at: 0,
        }];
        let mut runs = Runs::default();
        let result = pipeline(history)
            .run(&ChatInput::new("and then?"), &mut runs)
            .unwrap();
        assert_eq!(result.generated_question.as_deref(), Some("standalone?"));
        assert_eq!(runs.0.len(), 2);
        assert_ne!(runs.0[0], runs.0[1]);
    }

    #[test]
    fn test_format_history() {
        let msg = |role, content: &str| Message {
            id: String::new(),
            conversation_id: String::new(),
            role,
            content: content.to_string(),
            created_at: 0,
        };
        assert_eq!(
            format_history(&[msg(Role::Human, "hi"), msg(Role::Ai, "hello")]),
            "Human: hi\nAssistant: hello"
        );
    }

    #[test]
    fn test_noop_listener_runs_pipeline() {
        let result = pipeline(Vec::new())
            .run(&ChatInput::new("q"), &mut NoopListener)
            .unwrap();
        assert_eq!(result.answer, "the answer");
    }
}

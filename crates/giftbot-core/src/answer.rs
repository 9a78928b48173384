//! Retrieval-augmented answering for one chat session.
//!
//! A [Session] owns everything a conversation needs: service handles, the index
//! handle, memory, template and retrieval settings. Each question runs
//! Retrieving → Composing → Generating → Done, or stops in Failed.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::chunks::DocumentChunk;
use crate::memory::ConversationMemory;
use crate::prompt::{render_context, PromptTemplate};
use crate::provider::{EmbedError, Embedder, GenerateError, Generator};
use crate::store::{IndexHandle, SearchParams, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerState {
    Idle,
    Retrieving,
    Composing,
    Generating,
    Done,
    Failed,
}

impl fmt::Display for AnswerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnswerState::Idle => "idle",
            AnswerState::Retrieving => "retrieving",
            AnswerState::Composing => "composing",
            AnswerState::Generating => "generating",
            AnswerState::Done => "done",
            AnswerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What one turn produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// Generated text, verbatim.
    pub result: String,
    /// Chunks that were put in the prompt, in retrieval order.
    pub sources: Vec<DocumentChunk>,
    /// Product ids linked in `result` that none of `sources` came from.
    pub unverified_citations: Vec<String>,
}

pub struct Session {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    index: IndexHandle,
    memory: ConversationMemory,
    template: PromptTemplate,
    search: SearchParams,
    state: AnswerState,
}

impl Session {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        index: IndexHandle,
        search: SearchParams,
    ) -> Self {
        Self {
            embedder,
            generator,
            index,
            memory: ConversationMemory::new(),
            template: PromptTemplate::default(),
            search,
            state: AnswerState::Idle,
        }
    }

    pub fn with_memory(mut self, memory: ConversationMemory) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn state(&self) -> AnswerState {
        self.state
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Forgets the conversation so far.
    pub fn reset(&mut self) {
        self.memory.clear();
        self.state = AnswerState::Idle;
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    /// Points the session at a newly built index. Memory is kept.
    pub fn replace_index(&mut self, index: IndexHandle) {
        info!(from = %self.index.version(), to = %index.version(), "session switched index");
        self.index = index;
    }

    /// Embeds `question` and queries the index.
    pub async fn retrieve(&self, question: &str) -> Result<Vec<DocumentChunk>, AnswerError> {
        let embedding = self.embedder.embed_one(question).await?;
        let hits = self.index.query(&embedding, &self.search)?;
        Ok(hits.into_iter().map(|h| h.chunk).collect())
    }

    /// Answers one question. Memory is only updated when generation succeeds.
    pub async fn answer(&mut self, question: &str) -> Result<Answer, AnswerError> {
        let outcome = self.run(question).await;
        if let Err(e) = &outcome {
            self.transition(AnswerState::Failed);
            warn!("turn failed: {}", e);
        }
        outcome
    }

    async fn run(&mut self, question: &str) -> Result<Answer, AnswerError> {
        self.transition(AnswerState::Retrieving);
        let sources = self.retrieve(question).await?;

        self.transition(AnswerState::Composing);
        let prompt = self
            .template
            .render(question, &render_context(&sources), &self.memory.render());

        self.transition(AnswerState::Generating);
        let result = self.generator.generate(&prompt).await?;

        let unverified_citations = unverified_citations(&result, &sources);
        if !unverified_citations.is_empty() {
            warn!(ids = ?unverified_citations, "answer links products that were not retrieved");
        }
        self.memory.record_exchange(question, result.clone());
        self.transition(AnswerState::Done);
        Ok(Answer {
            result,
            sources,
            unverified_citations,
        })
    }

    fn transition(&mut self, next: AnswerState) {
        debug!(from = %self.state, to = %next, "answer state");
        self.state = next;
    }
}

fn product_link() -> &'static Regex {
    static LINK: OnceLock<Regex> = OnceLock::new();
    LINK.get_or_init(|| Regex::new(r"amazon\.com/dp/\(?([A-Za-z0-9_-]+)\)?").expect("product link pattern is valid"))
}

/// Product ids linked as `amazon.com/dp/<id>` or `amazon.com/dp/(<id>)`, first
/// occurrence order, without duplicates.
pub fn cited_product_ids(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    product_link()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Cited ids that do not belong to any retrieved chunk.
pub fn unverified_citations(text: &str, sources: &[DocumentChunk]) -> Vec<String> {
    let known: HashSet<&str> = sources.iter().map(|c| c.source_id.as_str()).collect();
    cited_product_ids(text)
        .into_iter()
        .filter(|id| !known.contains(id.as_str()))
        .collect()
}

/// A failed turn. Wraps the underlying service or index error verbatim.
#[derive(Debug, thiserror::Error)]
pub enum AnswerError {
    #[error("embedding service error: {0}")]
    Embedding(#[from] EmbedError),
    #[error("{0}")]
    Index(#[from] StoreError),
    #[error("generation service error: {0}")]
    Generation(#[from] GenerateError),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::memory::Turn;
    use crate::store::VectorStore;

    /// One dimension per keyword, so texts sharing words are similar.
    struct Keywords;

    const WORDS: [&str; 4] = ["headphones", "scarf", "lego", "mug"];

    #[async_trait]
    impl Embedder for Keywords {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    let mut v: Vec<f32> = WORDS.iter().map(|w| if t.contains(w) { 1.0 } else { 0.0 }).collect();
                    v.push(0.01);
                    v
                })
                .collect())
        }

        fn model(&self) -> &str {
            "keywords"
        }
    }

    /// Records prompts and replies with a fixed text until call `fail_from`,
    /// then times out.
    struct Scripted {
        reply: String,
        fail_from: usize,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn replying(s: &str) -> Arc<Self> {
            Self::failing_after(usize::MAX, s)
        }

        fn failing() -> Arc<Self> {
            Self::failing_after(0, "")
        }

        fn failing_after(calls: usize, s: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: s.to_string(),
                fail_from: calls,
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
            let mut prompts = self.prompts.lock().unwrap();
            let call = prompts.len();
            prompts.push(prompt.to_string());
            if call >= self.fail_from {
                return Err(GenerateError::Timeout(std::time::Duration::from_secs(60)));
            }
            Ok(self.reply.clone())
        }
    }

    fn chunk(id: &str, text: &str) -> DocumentChunk {
        DocumentChunk {
            text: text.to_string(),
            source_id: id.to_string(),
            start_offset: 0,
        }
    }

    async fn index(chunks: Vec<DocumentChunk>) -> IndexHandle {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = Keywords.embed(&texts).await.unwrap();
        let mut store = VectorStore::new();
        store.add_batch(chunks, vectors).unwrap();
        IndexHandle::new("test", store)
    }

    async fn session(generator: Arc<Scripted>) -> Session {
        let handle = index(vec![
            chunk("B001", "product_id: B001\ndescription: wireless headphones for teens"),
            chunk("B002", "product_id: B002\ndescription: wool scarf"),
            chunk("B003", "product_id: B003\ndescription: lego castle"),
        ])
        .await;
        Session::new(Arc::new(Keywords), generator, handle, SearchParams::similarity(1))
    }

    #[tokio::test]
    async fn answer_uses_retrieved_context_and_records_turn() {
        let gen = Scripted::replying("Try https://amazon.com/dp/(B001)");
        let mut s = session(gen.clone()).await;
        let a = s.answer("headphones for a teenager").await.unwrap();

        assert_eq!(a.sources.len(), 1);
        assert_eq!(a.sources[0].source_id, "B001");
        assert!(a.result.contains("amazon.com/dp/(B001)"));
        assert!(a.unverified_citations.is_empty());
        assert_eq!(s.state(), AnswerState::Done);
        assert_eq!(s.memory().len(), 2);

        let prompt = gen.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("wireless headphones for teens"));
        assert!(prompt.contains("**Question:** headphones for a teenager"));
    }

    #[tokio::test]
    async fn history_reaches_the_next_prompt() {
        let gen = Scripted::replying("How old are they?");
        let mut s = session(gen.clone()).await;
        s.answer("a gift for my nephew").await.unwrap();
        s.answer("he likes lego").await.unwrap();
        let prompts = gen.prompts.lock().unwrap();
        assert!(!prompts[0].contains("User: a gift for my nephew"));
        assert!(prompts[1].contains("User: a gift for my nephew\nAssistant: How old are they?"));
    }

    #[tokio::test]
    async fn generation_failure_leaves_memory_untouched() {
        let mut s = session(Scripted::failing()).await;
        let err = s.answer("headphones").await.unwrap_err();
        assert!(matches!(err, AnswerError::Generation(GenerateError::Timeout(_))));
        assert_eq!(s.state(), AnswerState::Failed);
        assert!(s.memory().is_empty());
    }

    #[tokio::test]
    async fn failed_turn_keeps_earlier_exchanges() {
        let mut s = session(Scripted::failing_after(1, "Try the scarf")).await;
        s.answer("a gift for grandma").await.unwrap();
        let before: Vec<Turn> = s.memory().history().cloned().collect();

        let err = s.answer("something warmer").await.unwrap_err();
        assert!(matches!(err, AnswerError::Generation(_)));
        assert_eq!(s.memory().len(), 2);
        let after: Vec<Turn> = s.memory().history().cloned().collect();
        assert_eq!(after, before);
        assert_eq!(after[0], Turn::user("a gift for grandma"));
        assert_eq!(after[1], Turn::assistant("Try the scarf"));
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_before_generation() {
        let gen = Scripted::replying("unused");
        let mut store = VectorStore::new();
        store.add(chunk("X", "x"), vec![1.0, 0.0]).unwrap();
        let mut s = Session::new(
            Arc::new(Keywords),
            gen.clone(),
            IndexHandle::new("bad", store),
            SearchParams::similarity(3),
        );
        let err = s.answer("mug").await.unwrap_err();
        assert!(matches!(err, AnswerError::Index(StoreError::DimensionMismatch { .. })));
        assert!(gen.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn flags_links_to_products_not_retrieved() {
        let gen = Scripted::replying("https://amazon.com/dp/(B001) and https://amazon.com/dp/Z999");
        let mut s = session(gen).await;
        let a = s.answer("headphones").await.unwrap();
        assert_eq!(a.unverified_citations, vec!["Z999".to_string()]);
    }

    #[tokio::test]
    async fn reset_clears_memory() {
        let mut s = session(Scripted::replying("ok")).await;
        s.answer("mug").await.unwrap();
        s.reset();
        assert!(s.memory().is_empty());
        assert_eq!(s.state(), AnswerState::Idle);
    }

    #[test]
    fn extracts_cited_ids_once_in_order() {
        let text = "amazon.com/dp/(B002) then https://amazon.com/dp/B001, again amazon.com/dp/(B002)";
        assert_eq!(cited_product_ids(text), vec!["B002".to_string(), "B001".to_string()]);
    }
}

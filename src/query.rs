//! Grounded question answering over the vector index.
//!
//! A query runs strictly in order:
//!
//! 1. route the question to a model tier ([`ModelRouter`])
//! 2. embed the question
//! 3. retrieve the top-k chunks inside the folder scope
//! 4. build a bounded grounding prompt
//! 5. stream the routed model's answer
//! 6. emit `sources`, `content`*, `metadata`, `done`
//!
//! Any failure before `sources` yields a single `error` event; a provider
//! failure mid-answer ends the stream with `error` and is not retried.
//! Queries only read the index, so they never wait on a sync run.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::config::{Config, RetrievalConfig, MAX_TOP_K};
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{VaultError, VaultResult};
use crate::llm::{ChatModel, ChatRequest, Completion, ProviderFactory};
use crate::models::RetrievedChunk;
use crate::pricing::{round6, PriceTable};
use crate::router::{Complexity, ModelRouter, RouteDecision, Tier};
use crate::store::{FolderFilter, VectorIndex};

pub const MAX_QUESTION_CHARS: usize = 5000;

/// Grounding used when retrieval finds nothing.
pub const NO_RELEVANT_NOTES: &str = "No relevant notes found for this query.";

pub const SYSTEM_PROMPT: &str = "You answer questions about the user's personal markdown notes.
Excerpts retrieved from those notes are given in the context section.

- Base the answer on the excerpts. Do not invent facts that are not in them.
- If the excerpts do not cover the question, say that plainly.
- Name the notes you draw from, by title or path.
- Point out recurring themes or links between notes when they are relevant.
- Be concise, but complete.";

const EVENT_BUFFER: usize = 64;
const DELTA_BUFFER: usize = 32;
const EXCERPT_SUFFIX: &str = "...";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub complexity: Complexity,
    /// Folder scopes; empty searches the whole vault.
    #[serde(default)]
    pub folders: Vec<String>,
    /// Overrides `retrieval.top_k`.
    #[serde(default)]
    pub top_k: Option<usize>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            complexity: Complexity::Auto,
            folders: Vec::new(),
            top_k: None,
        }
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.question.trim().is_empty() {
            return Err(VaultError::InvalidQuery("question must not be empty".to_string()));
        }
        let chars = self.question.chars().count();
        if chars > MAX_QUESTION_CHARS {
            return Err(VaultError::InvalidQuery(format!(
                "question is {} characters; the limit is {}",
                chars, MAX_QUESTION_CHARS
            )));
        }
        if let Some(k) = self.top_k {
            if !(1..=MAX_TOP_K).contains(&k) {
                return Err(VaultError::InvalidQuery(format!(
                    "top_k must be in [1, {}]",
                    MAX_TOP_K
                )));
            }
        }
        Ok(())
    }
}

/// A note cited as a source for an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteReference {
    pub note_path: String,
    pub title: String,
    pub folder: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    pub similarity_score: f32,
    pub relevant_excerpt: String,
    pub obsidian_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub complexity_used: Tier,
    pub model_used: String,
    pub provider_used: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub embedding_tokens: u64,
    /// USD for the answer plus the question embedding.
    pub total_cost: f64,
    pub latency_ms: u64,
}

/// One event of a streamed answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueryEvent {
    Sources { sources: Vec<NoteReference> },
    Content { content: String },
    Metadata(ResponseMetadata),
    Error { error: String },
    Done,
}

impl QueryEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryEvent::Done | QueryEvent::Error { .. })
    }
}

/// A complete, non-streamed answer.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<NoteReference>,
    #[serde(flatten)]
    pub metadata: ResponseMetadata,
}

/// Everything resolved before the model is called.
struct Prepared {
    route: RouteDecision,
    model: Arc<dyn ChatModel>,
    sources: Vec<NoteReference>,
    chat: ChatRequest,
    embedding_tokens: u64,
}

struct Inner {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    models: Arc<ProviderFactory>,
    router: ModelRouter,
    prices: PriceTable,
    retrieval: RetrievalConfig,
    vault_name: String,
    temperature: f32,
    max_tokens: u32,
}

/// Cheap to clone; every clone shares the same backends.
#[derive(Clone)]
pub struct QueryService {
    inner: Arc<Inner>,
}

impl QueryService {
    pub fn new(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        models: Arc<ProviderFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                embedder,
                index,
                models,
                router: ModelRouter::new(&config.routing),
                prices: PriceTable::new(config.pricing.clone()),
                retrieval: config.retrieval.clone(),
                vault_name: config.vault.display_name(),
                temperature: config.routing.temperature,
                max_tokens: config.routing.max_tokens,
            }),
        }
    }

    pub fn router(&self) -> &ModelRouter {
        &self.inner.router
    }

    /// Answer `request` as a stream of events. The work runs on its own
    /// task; dropping the receiver cancels it and closes the model stream.
    pub fn stream(&self, request: QueryRequest) -> mpsc::Receiver<QueryEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let service = self.clone();
        tokio::spawn(async move {
            service.run_stream(request, tx).await;
        });
        rx
    }

    async fn run_stream(&self, request: QueryRequest, tx: mpsc::Sender<QueryEvent>) {
        let started = Instant::now();

        let prepared = match self.prepare(&request).await {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::warn!(error = %err, "query failed before retrieval completed");
                let _ = tx.send(QueryEvent::Error { error: err.to_string() }).await;
                return;
            }
        };

        let sources = QueryEvent::Sources {
            sources: prepared.sources.clone(),
        };
        if tx.send(sources).await.is_err() {
            return;
        }

        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(DELTA_BUFFER);
        let content_tx = tx.clone();
        let forward = async move {
            while let Some(content) = delta_rx.recv().await {
                if content_tx.send(QueryEvent::Content { content }).await.is_err() {
                    return false;
                }
            }
            true
        };
        let generate = prepared.model.stream(&prepared.chat, delta_tx);
        let (outcome, delivered) = tokio::join!(generate, forward);

        if !delivered {
            tracing::debug!("query receiver dropped; answer abandoned");
            return;
        }
        let completion = match outcome {
            Ok(completion) => completion,
            Err(err) => {
                tracing::warn!(error = %err, model = %prepared.route.model, "answer stream failed");
                let _ = tx
                    .send(QueryEvent::Error {
                        error: VaultError::from(err).to_string(),
                    })
                    .await;
                return;
            }
        };

        let metadata = self.metadata(&prepared, &completion, started);
        tracing::info!(
            model = %metadata.model_used,
            tier = %metadata.complexity_used,
            input_tokens = metadata.input_tokens,
            output_tokens = metadata.output_tokens,
            latency_ms = metadata.latency_ms,
            "query answered"
        );
        if tx.send(QueryEvent::Metadata(metadata)).await.is_err() {
            return;
        }
        let _ = tx.send(QueryEvent::Done).await;
    }

    /// Answer `request` in one shot.
    pub async fn answer(&self, request: QueryRequest) -> VaultResult<QueryResponse> {
        let started = Instant::now();
        let prepared = self.prepare(&request).await?;
        let completion = prepared.model.complete(&prepared.chat).await?;
        let metadata = self.metadata(&prepared, &completion, started);
        Ok(QueryResponse {
            answer: completion.text,
            sources: prepared.sources,
            metadata,
        })
    }

    /// Retrieval only: the `k` chunks nearest to `query` inside `folders`.
    pub async fn search(
        &self,
        query: &str,
        folders: &[String],
        k: usize,
    ) -> VaultResult<Vec<RetrievedChunk>> {
        if query.trim().is_empty() {
            return Err(VaultError::InvalidQuery("query must not be empty".to_string()));
        }
        let (chunks, _) = self.retrieve(query, folders, k.clamp(1, MAX_TOP_K)).await?;
        Ok(chunks)
    }

    async fn retrieve(
        &self,
        question: &str,
        folders: &[String],
        k: usize,
    ) -> VaultResult<(Vec<RetrievedChunk>, u64)> {
        let (vector, tokens) = embed_query(self.inner.embedder.as_ref(), question).await?;
        let filter = FolderFilter::new(folders);
        let chunks = self.inner.index.search(&vector, k, &filter).await?;
        tracing::debug!(hits = chunks.len(), k, scoped = !filter.is_unscoped(), "retrieved chunks");
        Ok((chunks, tokens))
    }

    async fn prepare(&self, request: &QueryRequest) -> VaultResult<Prepared> {
        request.validate()?;
        let inner = &self.inner;

        let route = inner.router.resolve(&request.question, request.complexity);
        let model = inner.models.get(&route.provider, &route.model)?;
        tracing::info!(
            tier = %route.tier,
            provider = %route.provider,
            model = %route.model,
            score = route.analysis.score,
            "query routed"
        );

        let k = request.top_k.unwrap_or(inner.retrieval.top_k);
        let (chunks, embedding_tokens) = self
            .retrieve(&request.question, &request.folders, k)
            .await?;

        let context = format_context(&chunks, inner.retrieval.max_context_chars);
        let chat = ChatRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(&context, &request.question),
            temperature: inner.temperature,
            max_tokens: inner.max_tokens,
        };
        let sources = build_references(&chunks, &inner.vault_name, inner.retrieval.excerpt_chars);

        Ok(Prepared {
            route,
            model,
            sources,
            chat,
            embedding_tokens,
        })
    }

    fn metadata(
        &self,
        prepared: &Prepared,
        completion: &Completion,
        started: Instant,
    ) -> ResponseMetadata {
        let prices = &self.inner.prices;
        let answer_cost = prices.cost(
            &prepared.route.model,
            completion.input_tokens,
            completion.output_tokens,
        );
        let embedding_cost =
            prices.embedding_cost(self.inner.embedder.model_name(), prepared.embedding_tokens);
        ResponseMetadata {
            complexity_used: prepared.route.tier,
            model_used: prepared.route.model.clone(),
            provider_used: prepared.route.provider.clone(),
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            embedding_tokens: prepared.embedding_tokens,
            total_cost: round6(answer_cost + embedding_cost),
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Numbered excerpts for the prompt, bounded by `max_chars`.
pub fn format_context(chunks: &[RetrievedChunk], max_chars: usize) -> String {
    if chunks.is_empty() {
        return NO_RELEVANT_NOTES.to_string();
    }

    let mut out = String::from("=== Relevant Note Excerpts ===\n");
    for (i, chunk) in chunks.iter().enumerate() {
        let section = chunk
            .heading()
            .map(|h| format!(" (Section: {})", h))
            .unwrap_or_default();
        let block = format!(
            "\n[{}] From: {}{}\n---\n{}\n---\n",
            i + 1,
            chunk.note_path,
            section,
            chunk.text
        );
        if out.len() + block.len() > max_chars {
            if i == 0 {
                let room = max_chars.saturating_sub(out.len());
                out.push_str(truncate_at_boundary(&block, room));
            }
            tracing::debug!(kept = i.max(1), total = chunks.len(), "context budget reached");
            break;
        }
        out.push_str(&block);
    }
    out
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Context from your notes:\n\n{}\n\nQuestion: {}\n\n\
         Answer using the note excerpts above. If they do not contain the answer, say so.",
        context, question
    )
}

/// One reference per note, in rank order, keeping each note's best-scoring chunk.
pub fn build_references(
    chunks: &[RetrievedChunk],
    vault_name: &str,
    excerpt_chars: usize,
) -> Vec<NoteReference> {
    let mut seen = HashSet::new();
    let mut refs: Vec<NoteReference> = Vec::new();
    for chunk in chunks {
        if !seen.insert(chunk.note_path.as_str()) {
            if let Some(existing) = refs.iter_mut().find(|r| r.note_path == chunk.note_path) {
                if chunk.score > existing.similarity_score {
                    *existing = reference(chunk, vault_name, excerpt_chars);
                }
            }
            continue;
        }
        refs.push(reference(chunk, vault_name, excerpt_chars));
    }
    refs
}

fn reference(chunk: &RetrievedChunk, vault_name: &str, excerpt_chars: usize) -> NoteReference {
    NoteReference {
        note_path: chunk.note_path.clone(),
        title: chunk.title.clone(),
        folder: chunk.folder.clone(),
        heading: chunk.heading(),
        similarity_score: chunk.score,
        relevant_excerpt: excerpt(&chunk.text, excerpt_chars),
        obsidian_url: obsidian_url(vault_name, &chunk.note_path),
    }
}

pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &text[..cut], EXCERPT_SUFFIX),
        None => text.to_string(),
    }
}

/// `obsidian://open?vault=<name>&file=<path without .md>`, with path
/// separators left readable.
pub fn obsidian_url(vault_name: &str, note_path: &str) -> String {
    let file = note_path.strip_suffix(".md").unwrap_or(note_path);
    let file = file
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!(
        "obsidian://open?vault={}&file={}",
        urlencoding::encode(vault_name),
        file
    )
}

fn truncate_at_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, folder: &str, text: &str, score: f32, heading: &[&str]) -> RetrievedChunk {
        RetrievedChunk {
            note_path: path.to_string(),
            ordinal: 0,
            text: text.to_string(),
            heading_path: heading.iter().map(|h| h.to_string()).collect(),
            folder: folder.to_string(),
            title: path.trim_end_matches(".md").to_string(),
            score,
        }
    }

    #[test]
    fn test_request_validation() {
        assert!(QueryRequest::new("What did I plan?").validate().is_ok());
        assert!(matches!(
            QueryRequest::new("   ").validate(),
            Err(VaultError::InvalidQuery(_))
        ));
        assert!(QueryRequest::new("x".repeat(MAX_QUESTION_CHARS)).validate().is_ok());
        assert!(QueryRequest::new("x".repeat(MAX_QUESTION_CHARS + 1)).validate().is_err());

        let mut request = QueryRequest::new("q");
        request.top_k = Some(0);
        assert!(request.validate().is_err());
        request.top_k = Some(MAX_TOP_K + 1);
        assert!(request.validate().is_err());
        request.top_k = Some(MAX_TOP_K);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_empty_context_is_explicit() {
        assert_eq!(format_context(&[], 1000), NO_RELEVANT_NOTES);
    }

    #[test]
    fn test_context_numbers_excerpts_with_sections() {
        let chunks = vec![
            hit("a.md", "", "alpha body", 0.9, &["Intro", "Goals"]),
            hit("b.md", "", "beta body", 0.8, &[]),
        ];
        let context = format_context(&chunks, 10_000);
        assert!(context.contains("[1] From: a.md (Section: Intro > Goals)\n---\nalpha body\n---"));
        assert!(context.contains("[2] From: b.md\n---\nbeta body\n---"));
    }

    #[test]
    fn test_context_respects_budget() {
        let chunks = vec![
            hit("a.md", "", &"a".repeat(100), 0.9, &[]),
            hit("b.md", "", &"b".repeat(100), 0.8, &[]),
        ];
        let context = format_context(&chunks, 180);
        assert!(context.len() <= 180);
        assert!(context.contains("[1]"));
        assert!(!context.contains("[2]"));

        // a single oversized excerpt is cut rather than dropped
        let context = format_context(&chunks[..1], 60);
        assert!(context.len() <= 60);
        assert!(context.contains("[1] From: a.md"));
    }

    #[test]
    fn test_references_dedupe_by_note() {
        let chunks = vec![
            hit("a.md", "A", "first", 0.9, &[]),
            hit("b.md", "B", "second", 0.8, &[]),
            hit("a.md", "A", "third", 0.7, &[]),
        ];
        let refs = build_references(&chunks, "Vault", 300);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].note_path, "a.md");
        assert_eq!(refs[0].relevant_excerpt, "first");
        assert!((refs[0].similarity_score - 0.9).abs() < 1e-6);
        assert_eq!(refs[1].note_path, "b.md");
    }

    #[test]
    fn test_excerpt_truncates_by_chars() {
        assert_eq!(excerpt("short", 300), "short");
        let long = "é".repeat(301);
        let cut = excerpt(&long, 300);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 303);
        assert_eq!(excerpt(&"x".repeat(300), 300).len(), 300);
    }

    #[test]
    fn test_obsidian_url_encoding() {
        assert_eq!(
            obsidian_url("My Vault", "Projects/Q3 plan.md"),
            "obsidian://open?vault=My%20Vault&file=Projects/Q3%20plan"
        );
        assert_eq!(obsidian_url("v", "notes.txt.md"), "obsidian://open?vault=v&file=notes.txt");
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let json = serde_json::to_value(QueryEvent::Content {
            content: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "content");
        assert_eq!(json["content"], "hi");

        let json = serde_json::to_value(QueryEvent::Done).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "done" }));

        let json = serde_json::to_value(QueryEvent::Metadata(ResponseMetadata {
            complexity_used: Tier::Complex,
            model_used: "m".to_string(),
            provider_used: "p".to_string(),
            input_tokens: 1,
            output_tokens: 2,
            embedding_tokens: 3,
            total_cost: 0.5,
            latency_ms: 10,
        }))
        .unwrap();
        assert_eq!(json["type"], "metadata");
        assert_eq!(json["complexity_used"], "complex");
        assert_eq!(json["latency_ms"], 10);
    }

    #[test]
    fn test_prompt_includes_question() {
        let prompt = build_prompt(NO_RELEVANT_NOTES, "Where is the key?");
        assert!(prompt.contains(NO_RELEVANT_NOTES));
        assert!(prompt.contains("Question: Where is the key?"));
    }
}

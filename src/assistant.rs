//! Retrieval-augmented answering.
//!
//! An [`Assistant`] turns a question (plus optional conversation history)
//! into an answer: it optionally asks the chat model to rewrite the question
//! into a standalone search query, retrieves matching chunks from the
//! archive, narrows and orders them, and hands them to the chat model as
//! context.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::access::Caller;
use crate::archive::{order_and_apply_cutoff, ArchiveMatch, ChunkArchive, RetrievalRequest};
use crate::chat::{ChatAgent, ChatRequest, ChatTurn};
use crate::config::AssistantConfig;
use crate::dto::MessageForCreation;
use crate::error::ensure_valid;
use crate::models::{Citation, ContentType, Message, MessageType};
use crate::repo::messages;
use crate::tokens::count_tokens;

pub const CITATION_KIND: &str = "SourceDocument";

#[derive(Debug, Clone, Serialize)]
pub struct RankedChunk {
    pub content: String,
    pub rank: usize,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantAnswer {
    pub answer: String,
    pub embedding_lookup: String,
    pub chunks: Vec<RankedChunk>,
    pub citations: Vec<Citation>,
}

pub struct Assistant {
    archive: Arc<dyn ChunkArchive>,
    chat: Arc<dyn ChatAgent>,
    config: AssistantConfig,
}

impl Assistant {
    pub fn new(
        archive: Arc<dyn ChunkArchive>,
        chat: Arc<dyn ChatAgent>,
        config: AssistantConfig,
    ) -> Self {
        Self {
            archive,
            chat,
            config,
        }
    }

    pub async fn ask(&self, question: &str, history: &[ChatTurn]) -> Result<AssistantAnswer> {
        ensure_valid(!question.trim().is_empty(), "question must not be empty")?;
        let opts = &self.config;

        let mut request = ChatRequest::new(opts.system_prompt.clone(), question);
        request.history = trim_history(history, opts.cutoff_history_tokens);

        let embedding_lookup = self.contextualize(&request).await?;

        let matches = self
            .archive
            .retrieve(&RetrievalRequest {
                query: embedding_lookup.clone(),
                min_similarity: opts.min_similarity,
                cutoff_tokens: opts.cutoff_context_tokens,
                max_chunks: opts.max_chunks_per_ask,
            })
            .await?;
        let mut matches =
            order_and_apply_cutoff(matches, opts.cutoff_context_tokens, opts.max_chunks_per_ask);

        if let Some(limit) = opts.top_document_limit {
            matches = top_documents(matches, limit);
        }
        if opts.sort_chunks {
            sort_by_document(&mut matches);
        }

        let citations = citations_for(&matches);
        let chunks = rank(&matches);
        request.chunks = matches.into_iter().map(|m| m.chunk).collect();

        let response = self.chat.chat(&request).await?;
        info!(
            chunks = chunks.len(),
            citations = citations.len(),
            "assistant answered"
        );

        Ok(AssistantAnswer {
            answer: response.answer,
            embedding_lookup,
            chunks,
            citations,
        })
    }

    /// The retrieval query: a chat-rewritten question when a contextualize
    /// prompt is configured and the rewrite isn't blank, else the question.
    async fn contextualize(&self, request: &ChatRequest) -> Result<String> {
        let Some(prompt) = self
            .config
            .contextualize_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        else {
            return Ok(request.query_embedding_string().to_string());
        };

        let mut resolve = ChatRequest::new(
            format!("{}\r\n{}", request.system_prompt, prompt),
            request.question.clone(),
        );
        resolve.history = request.history.clone();
        let rewritten = self.chat.chat(&resolve).await?.answer;
        if rewritten.trim().is_empty() {
            return Ok(request.query_embedding_string().to_string());
        }
        debug!(lookup = %rewritten, "contextualized question");
        Ok(rewritten)
    }

    /// Asks within a thread: stores the question, answers from the thread's
    /// earlier User/System messages, and stores the answer with citations.
    /// A failed answer is stored (and returned) as an Error message.
    pub async fn ask_in_thread(
        &self,
        pool: &SqlitePool,
        caller: &Caller,
        thread_id: &str,
        question: &str,
    ) -> Result<Message> {
        ensure_valid(!question.trim().is_empty(), "question must not be empty")?;

        let prior = messages::list_for_thread(pool, caller, thread_id).await?;
        let history: Vec<ChatTurn> = prior
            .iter()
            .filter_map(|m| match m.message_type {
                MessageType::User => Some(ChatTurn::user(m.content.clone())),
                MessageType::System => Some(ChatTurn::assistant(m.content.clone())),
                MessageType::Error => None,
            })
            .collect();

        messages::add(pool, caller, thread_id, &MessageForCreation::user(question)).await?;

        let reply = match self.ask(question, &history).await {
            Ok(answer) => MessageForCreation {
                content: answer.answer,
                content_type: ContentType::PlainText,
                message_type: MessageType::System,
                citations: answer.citations,
            },
            Err(e) => {
                warn!(thread = %thread_id, error = %e, "assistant failed");
                MessageForCreation {
                    content: e.to_string(),
                    content_type: ContentType::PlainText,
                    message_type: MessageType::Error,
                    citations: Vec::new(),
                }
            }
        };
        messages::add(pool, caller, thread_id, &reply).await
    }
}

/// Keeps the newest turns whose combined `role: content` tokens fit `cutoff`.
pub fn trim_history(history: &[ChatTurn], cutoff: usize) -> Vec<ChatTurn> {
    let mut kept = Vec::new();
    let mut tokens = 0usize;
    for turn in history.iter().rev() {
        let t = count_tokens(&format!("{}: ", turn.role)) + count_tokens(&turn.content);
        if tokens + t > cutoff {
            break;
        }
        tokens += t;
        kept.push(turn.clone());
    }
    kept.reverse();
    kept
}

fn document_key(m: &ArchiveMatch) -> String {
    m.chunk
        .metadata
        .document_id
        .clone()
        .or_else(|| m.chunk.metadata.source_document.clone())
        .unwrap_or_default()
}

/// Keeps only chunks of the `limit` documents with the best chunk scores.
pub fn top_documents(matches: Vec<ArchiveMatch>, limit: usize) -> Vec<ArchiveMatch> {
    let mut best: HashMap<String, f32> = HashMap::new();
    for m in &matches {
        let entry = best.entry(document_key(m)).or_insert(f32::MIN);
        if m.score > *entry {
            *entry = m.score;
        }
    }
    let mut ranked: Vec<(String, f32)> = best.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let keep: HashSet<String> = ranked.into_iter().take(limit).map(|(k, _)| k).collect();

    matches
        .into_iter()
        .filter(|m| keep.contains(&document_key(m)))
        .collect()
}

/// Orders by group, then source document, then position in the document.
pub fn sort_by_document(matches: &mut [ArchiveMatch]) {
    matches.sort_by(|a, b| {
        let (ma, mb) = (&a.chunk.metadata, &b.chunk.metadata);
        ma.source_document_group
            .cmp(&mb.source_document_group)
            .then_with(|| ma.source_document.cmp(&mb.source_document))
            .then_with(|| a.chunk.seq_no.cmp(&b.chunk.seq_no))
    });
}

fn rank(matches: &[ArchiveMatch]) -> Vec<RankedChunk> {
    let mut by_score: Vec<&ArchiveMatch> = matches.iter().collect();
    by_score.sort_by(|a, b| b.score.total_cmp(&a.score));
    by_score
        .into_iter()
        .enumerate()
        .map(|(i, m)| RankedChunk {
            content: m.chunk.context_string(),
            rank: i + 1,
            similarity: m.score,
        })
        .collect()
}

fn citations_for(matches: &[ArchiveMatch]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    matches
        .iter()
        .filter_map(|m| m.chunk.metadata.source_document.clone())
        .filter(|name| seen.insert(name.clone()))
        .map(|name| Citation {
            name,
            url: None,
            kind: Some(CITATION_KIND.to_string()),
        })
        .collect()
}

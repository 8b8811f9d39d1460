//! Chat completion agents.
//!
//! [`ChatAgent`] is the seam the assistant talks to. [`OpenAIChatAgent`]
//! calls `POST {base_url}/chat/completions`; [`ChatCache`] wraps any agent
//! and memoises answers per request.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::chunk::TextChunk;
use crate::config::ChatConfig;
use crate::embedding::send_with_retry;
use crate::error::CxError;

/// Roles as they appear in the completion API.
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ROLE_USER.to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ROLE_ASSISTANT.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub history: Vec<ChatTurn>,
    pub question: String,
    pub chunks: Vec<TextChunk>,
}

impl ChatRequest {
    pub fn new(system_prompt: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history: Vec::new(),
            question: question.into(),
            chunks: Vec::new(),
        }
    }

    /// The text used to look up context chunks.
    pub fn query_embedding_string(&self) -> &str {
        &self.question
    }

    /// Context chunks rendered for the model, separated by `---` lines.
    pub fn context_block(&self) -> Option<String> {
        if self.chunks.is_empty() {
            return None;
        }
        let body = self
            .chunks
            .iter()
            .map(|c| c.context_string())
            .collect::<Vec<_>>()
            .join("\n---\n");
        Some(format!("Context:\n{}", body))
    }

    /// Messages in completion API order: system prompt, context, history, question.
    pub fn to_messages(&self) -> Vec<serde_json::Value> {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": self.system_prompt,
        })];
        if let Some(context) = self.context_block() {
            messages.push(serde_json::json!({ "role": "system", "content": context }));
        }
        for turn in &self.history {
            messages.push(serde_json::json!({ "role": turn.role, "content": turn.content }));
        }
        messages.push(serde_json::json!({ "role": ROLE_USER, "content": self.question }));
        messages
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
}

#[async_trait]
pub trait ChatAgent: Send + Sync {
    fn model_name(&self) -> &str;
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;
}

// ============ Disabled ============

pub struct DisabledChatAgent;

#[async_trait]
impl ChatAgent for DisabledChatAgent {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        Err(CxError::Disabled("chat provider".to_string()).into())
    }
}

// ============ OpenAI ============

pub struct OpenAIChatAgent {
    model: String,
    temperature: Option<f32>,
    base_url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChatAgent {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("chat.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            temperature: config.temperature,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl ChatAgent for OpenAIChatAgent {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": req.to_messages(),
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let json = send_with_retry(&self.client, &url, &self.api_key, &body, self.max_retries).await?;
        let answer = parse_completion(&json)?;
        Ok(ChatResponse { answer })
    }
}

fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

// ============ Cache ============

/// Memoises answers by a SHA-256 of the model name and serialized request.
pub struct ChatCache {
    inner: Arc<dyn ChatAgent>,
    enabled: bool,
    answers: Mutex<HashMap<String, ChatResponse>>,
}

impl ChatCache {
    pub fn new(inner: Arc<dyn ChatAgent>, enabled: bool) -> Self {
        Self {
            inner,
            enabled,
            answers: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, req: &ChatRequest) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.model_name().as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(req)?);
        Ok(hex::encode(hasher.finalize()))
    }

    pub async fn len(&self) -> usize {
        self.answers.lock().await.len()
    }
}

#[async_trait]
impl ChatAgent for ChatCache {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        if !self.enabled {
            return self.inner.chat(req).await;
        }
        let key = self.key(req)?;
        if let Some(hit) = self.answers.lock().await.get(&key).cloned() {
            debug!("chat cache hit");
            return Ok(hit);
        }
        let response = self.inner.chat(req).await?;
        self.answers.lock().await.insert(key, response.clone());
        Ok(response)
    }
}

pub fn create_chat_agent(config: &ChatConfig) -> Result<Arc<dyn ChatAgent>> {
    let agent: Arc<dyn ChatAgent> = match config.provider.as_str() {
        "disabled" => return Ok(Arc::new(DisabledChatAgent)),
        "openai" => Arc::new(OpenAIChatAgent::new(config)?),
        other => bail!("Unknown chat provider: {}", other),
    };
    Ok(Arc::new(ChatCache::new(agent, config.use_cache)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatAgent for Echo {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                answer: format!("echo: {}", req.question),
            })
        }
    }

    #[test]
    fn messages_are_ordered() {
        let mut req = ChatRequest::new("be brief", "what now?");
        req.history = vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")];
        req.chunks = vec![
            TextChunk::new("first", ChunkMeta::default()),
            TextChunk::new("second", ChunkMeta::default()),
        ];
        let msgs = req.to_messages();
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[0]["content"], "be brief");
        assert_eq!(msgs[1]["content"], "Context:\nfirst\n---\nsecond");
        assert_eq!(msgs[2]["role"], "user");
        assert_eq!(msgs[3]["role"], "assistant");
        assert_eq!(msgs[4]["content"], "what now?");
    }

    #[test]
    fn no_context_message_without_chunks() {
        let req = ChatRequest::new("sys", "q");
        assert_eq!(req.to_messages().len(), 2);
        assert_eq!(req.query_embedding_string(), "q");
    }

    #[test]
    fn parses_completion_content() {
        let json = serde_json::json!({"choices": [{"message": {"role": "assistant", "content": "42"}}]});
        assert_eq!(parse_completion(&json).unwrap(), "42");
        assert!(parse_completion(&serde_json::json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn cache_memoises_identical_requests() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let cache = ChatCache::new(echo.clone(), true);
        let req = ChatRequest::new("sys", "q1");
        assert_eq!(cache.chat(&req).await.unwrap().answer, "echo: q1");
        cache.chat(&req).await.unwrap();
        cache.chat(&ChatRequest::new("sys", "q2")).await.unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn disabled_cache_passes_through() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let cache = ChatCache::new(echo.clone(), false);
        let req = ChatRequest::new("sys", "q");
        cache.chat(&req).await.unwrap();
        cache.chat(&req).await.unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
    }
}

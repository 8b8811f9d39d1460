#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use cx_container::app::App;
use cx_container::chat::{ChatAgent, ChatRequest, ChatResponse};
use cx_container::config::{self, Config};
use cx_container::embedding::Embedder;
use cx_container::storage::DiskStorage;

const DIMS: usize = 1024;

/// Hashes each lowercase word into one of `DIMS` buckets.
pub struct WordEmbedder;

fn bucket(word: &str) -> usize {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in word.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h % DIMS as u64) as usize
}

#[async_trait]
impl Embedder for WordEmbedder {
    fn model_name(&self) -> &str {
        "words"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; DIMS];
                for w in t
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    v[bucket(&w.to_lowercase())] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Replies `"<question> [<n> chunks]"`.
pub struct EchoAgent;

#[async_trait]
impl ChatAgent for EchoAgent {
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            answer: format!("{} [{} chunks]", req.question, req.chunks.len()),
        })
    }
}

pub fn test_config(root: &std::path::Path) -> Config {
    let src = format!(
        r#"[db]
path = "{root}/cx.sqlite"

[storage]
provider = "disk"
root = "{root}/files"

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );
    let cfg: Config = toml::from_str(&src).unwrap();
    config::validate(&cfg).unwrap();
    cfg
}

/// A fully wired app over a temporary directory; keep the `TempDir` alive.
pub async fn test_app() -> (TempDir, Arc<App>) {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let app = build_app(cfg, Arc::new(WordEmbedder), Arc::new(EchoAgent))
        .await
        .unwrap();
    (tmp, Arc::new(app))
}

/// Like [`test_app`] with explicit providers and a config hook.
pub async fn test_app_with(
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatAgent>,
    tweak: impl FnOnce(&mut Config),
) -> (TempDir, Arc<App>) {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    tweak(&mut cfg);
    let app = build_app(cfg, embedder, chat).await.unwrap();
    (tmp, Arc::new(app))
}

pub async fn build_app(
    cfg: Config,
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatAgent>,
) -> Result<App> {
    let pool = cx_container::db::connect(&cfg).await?;
    cx_container::migrate::run_migrations(&pool).await?;
    let storage = Arc::new(DiskStorage::new(cfg.storage.root.clone()));
    App::from_parts(cfg, pool, embedder, chat, storage).await
}

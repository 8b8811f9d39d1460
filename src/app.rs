//! Wiring of the configured providers into one shared [`App`].

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::archive::{create_archive, ChunkArchive};
use crate::assistant::Assistant;
use crate::chat::{create_chat_agent, ChatAgent};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::embedding_cache::EmbeddingCache;
use crate::ingest::Ingestor;
use crate::migrate;
use crate::storage::{create_storage, StorageService};

pub struct App {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub cache: Arc<EmbeddingCache>,
    pub archive: Arc<dyn ChunkArchive>,
    pub ingestor: Arc<Ingestor>,
    pub assistant: Arc<Assistant>,
}

impl App {
    /// Connects, migrates and builds every provider named in `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;

        let embedder = create_embedder(&config.embedding)?;
        let chat = create_chat_agent(&config.chat)?;
        let storage = create_storage(&config.storage)?;
        Self::from_parts(config.clone(), pool, embedder, chat, storage).await
    }

    /// Assembles an app from explicit providers.
    pub async fn from_parts(
        config: Config,
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatAgent>,
        storage: Arc<dyn StorageService>,
    ) -> Result<Self> {
        let cache = Arc::new(EmbeddingCache::open(embedder, &config.embedding_cache).await?);
        let archive = create_archive(&config, &pool, cache.clone()).await?;
        let ingestor = Arc::new(Ingestor::new(
            pool.clone(),
            storage,
            archive.clone(),
            config.splitter.clone(),
        ));
        let assistant = Arc::new(Assistant::new(
            archive.clone(),
            chat,
            config.assistant.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            pool,
            cache,
            archive,
            ingestor,
            assistant,
        })
    }

    /// Refills an in-memory archive from trained documents. Persistent
    /// archives are left alone.
    pub async fn warm_archive(&self) -> Result<()> {
        if self.config.archive.engine != "in-memory" {
            return Ok(());
        }
        match self.ingestor.rebuild_archive().await {
            Ok(chunks) => info!(chunks, "archive loaded"),
            Err(e) => warn!(error = %e, "archive rebuild failed; retrieval will miss trained documents"),
        }
        self.persist_cache().await;
        Ok(())
    }

    /// Writes the embedding cache file if anything changed. Failures are logged.
    pub async fn persist_cache(&self) {
        match self.cache.save().await {
            Ok(true) => {
                let entries = self.cache.len().await;
                info!(entries, "embedding cache saved");
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to save embedding cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    // Handlers hand these futures to axum, which needs them to be Send.
    #[allow(dead_code)]
    fn app_futures_are_send(app: &App) {
        assert_send(&app.persist_cache());
        assert_send(&app.warm_archive());
        assert_send(&app.cache.load_from_file(std::path::Path::new("cache.bin")));
    }
}

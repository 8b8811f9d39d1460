//! Memoising embedding cache with binary persistence.
//!
//! Entries are keyed by `(model, content)`. Concurrent requests for the
//! same content wait on a per-content lock so the embedder is called once.
//!
//! # File format
//!
//! All integers little-endian:
//!
//! | Field | Type |
//! |-------|------|
//! | magic | `i32` = 313249127 |
//! | version | `i32` (1 or 2; 2 is written) |
//! | entry count | `u32` |
//! | per entry: model (v2 only) | `u32` length + UTF-8 |
//! | per entry: content | `u32` length + UTF-8 |
//! | per entry: vector | `u32` length + `f32` values |
//!
//! Saves go to `<file>.tmp`, the previous file is kept as `<file>.bak`,
//! and loading falls back to the `.bak` file when the main one is missing.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::EmbeddingCacheConfig;
use crate::embedding::Embedder;

pub const CACHE_MAGIC: i32 = 313_249_127;
pub const CACHE_VERSION: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EmbeddingKey {
    model: String,
    content: String,
}

pub struct EmbeddingCache {
    embedder: Arc<dyn Embedder>,
    use_cache: bool,
    cache_file: Option<PathBuf>,
    entries: Mutex<HashMap<EmbeddingKey, Vec<f32>>>,
    content_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    hits: AtomicU64,
    version: AtomicU64,
    saved_version: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(embedder: Arc<dyn Embedder>, config: &EmbeddingCacheConfig) -> Self {
        Self {
            embedder,
            use_cache: config.use_cache,
            cache_file: config.cache_file.clone(),
            entries: Mutex::new(HashMap::new()),
            content_locks: std::sync::Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            version: AtomicU64::new(0),
            saved_version: AtomicU64::new(0),
        }
    }

    /// Builds the cache and loads the configured cache file, if any.
    pub async fn open(embedder: Arc<dyn Embedder>, config: &EmbeddingCacheConfig) -> Result<Self> {
        let cache = Self::new(embedder, config);
        if let Some(path) = cache.cache_file.clone() {
            cache.load_from_file(&path).await?;
        }
        Ok(cache)
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn lookup(&self, key: &EmbeddingKey) -> Option<Vec<f32>> {
        let entries = self.entries.lock().await;
        let found = entries.get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn content_lock(&self, content: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .content_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(content.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_content_lock(&self, content: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self
            .content_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(lock);
        if locks
            .get(content)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(content);
        }
    }

    /// Returns the embedding of `content`, computing it on a miss.
    pub async fn get(&self, content: &str) -> Result<Vec<f32>> {
        let key = EmbeddingKey {
            model: self.embedder.model_name().to_string(),
            content: content.to_string(),
        };

        if self.use_cache {
            if let Some(v) = self.lookup(&key).await {
                return Ok(v);
            }
        }

        let lock = self.content_lock(content);
        let result = {
            let _guard = lock.lock().await;
            self.get_locked(key).await
        };
        self.release_content_lock(content, lock);
        result
    }

    async fn get_locked(&self, key: EmbeddingKey) -> Result<Vec<f32>> {
        if self.use_cache {
            if let Some(v) = self.lookup(&key).await {
                return Ok(v);
            }
        }

        let vector = self
            .embedder
            .embed(std::slice::from_ref(&key.content))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;

        if self.use_cache {
            self.entries.lock().await.insert(key, vector.clone());
            self.version.fetch_add(1, Ordering::Relaxed);
        }
        Ok(vector)
    }

    // ============ Persistence ============

    pub async fn serialize(&self) -> Vec<u8> {
        let entries = self.entries.lock().await;
        let mut out = Vec::new();
        out.extend_from_slice(&CACHE_MAGIC.to_le_bytes());
        out.extend_from_slice(&CACHE_VERSION.to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (key, vector) in entries.iter() {
            write_str(&mut out, &key.model);
            write_str(&mut out, &key.content);
            out.extend_from_slice(&(vector.len() as u32).to_le_bytes());
            for v in vector {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    /// Replaces the cache contents with `bytes`. Version 1 files carry no
    /// model, so their entries are attributed to the current embedder.
    pub async fn deserialize(&self, bytes: &[u8]) -> Result<()> {
        let mut r = Reader { buf: bytes, pos: 0 };
        let magic = r.i32()?;
        if magic != CACHE_MAGIC {
            bail!("Invalid magic number (found {} expected {})", magic, CACHE_MAGIC);
        }
        let version = r.i32()?;
        if version != 1 && version != 2 {
            bail!("Invalid version number (found {} expected 1-2)", version);
        }

        let count = r.u32()? as usize;
        // Each entry needs at least two length prefixes and a vector length.
        let mut loaded = HashMap::with_capacity(count.min(r.remaining() / 12));
        for _ in 0..count {
            let model = if version == 1 {
                self.embedder.model_name().to_string()
            } else {
                r.string()?
            };
            let content = r.string()?;
            let len = r.u32()? as usize;
            if len > r.remaining() / 4 {
                bail!("Truncated embedding cache: vector of {} floats at byte {}", len, r.pos);
            }
            let mut vector = Vec::with_capacity(len);
            for _ in 0..len {
                vector.push(r.f32()?);
            }
            loaded.insert(EmbeddingKey { model, content }, vector);
        }

        *self.entries.lock().await = loaded;
        Ok(())
    }

    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let bak = path.with_extension("bak");
        let bytes = self.serialize().await;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;

        if tokio::fs::try_exists(path).await? {
            if tokio::fs::try_exists(&bak).await? {
                tokio::fs::remove_file(&bak).await?;
            }
            tokio::fs::rename(path, &bak).await?;
        }
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn load_from_file(&self, path: &Path) -> Result<()> {
        let bak = path.with_extension("bak");
        let source = if tokio::fs::try_exists(path).await? {
            path.to_path_buf()
        } else if tokio::fs::try_exists(&bak).await? {
            bak
        } else {
            debug!(path = %path.display(), "no embedding cache file yet");
            return Ok(());
        };

        let bytes = tokio::fs::read(&source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;
        self.deserialize(&bytes)
            .await
            .with_context(|| format!("Failed to load embedding cache {}", source.display()))?;
        self.saved_version
            .store(self.version.load(Ordering::Relaxed), Ordering::Relaxed);
        let entries = self.len().await;
        info!(path = %source.display(), entries, "embedding cache loaded");
        Ok(())
    }

    /// Persists to the configured file. Does nothing without a cache file
    /// or when nothing changed since the last save.
    pub async fn save(&self) -> Result<bool> {
        let Some(path) = &self.cache_file else {
            return Ok(false);
        };
        let version = self.version.load(Ordering::Relaxed);
        if version == self.saved_version.load(Ordering::Relaxed) {
            return Ok(false);
        }
        self.save_to_file(path).await?;
        self.saved_version.store(version, Ordering::Relaxed);
        debug!(path = %path.display(), "embedding cache saved");
        Ok(true)
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| anyhow::anyhow!("Truncated embedding cache at byte {}", self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn array4(&mut self) -> Result<[u8; 4]> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array4()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array4()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array4()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0])
                .collect())
        }
    }

    fn embedder() -> Arc<CountingEmbedder> {
        Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        })
    }

    fn config(use_cache: bool, cache_file: Option<PathBuf>) -> EmbeddingCacheConfig {
        EmbeddingCacheConfig {
            use_cache,
            cache_file,
        }
    }

    #[tokio::test]
    async fn second_lookup_is_a_hit() {
        let e = embedder();
        let cache = EmbeddingCache::new(e.clone(), &config(true, None));
        let a = cache.get("hello").await.unwrap();
        let b = cache.get("hello").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(e.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_requests_embed_once() {
        let e = embedder();
        let cache = Arc::new(EmbeddingCache::new(e.clone(), &config(true, None)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get("shared").await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(e.calls.load(Ordering::SeqCst), 1);
        assert!(cache.content_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_always_embeds() {
        let e = embedder();
        let cache = EmbeddingCache::new(e.clone(), &config(false, None));
        cache.get("x").await.unwrap();
        cache.get("x").await.unwrap();
        assert_eq!(e.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn save_and_reload_with_backup() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("embeddings.bin");

        let cache = EmbeddingCache::new(embedder(), &config(true, Some(path.clone())));
        assert!(!cache.save().await.unwrap(), "nothing to save yet");
        cache.get("alpha").await.unwrap();
        assert!(cache.save().await.unwrap());
        assert!(!cache.save().await.unwrap(), "unchanged cache is not rewritten");

        cache.get("beta").await.unwrap();
        assert!(cache.save().await.unwrap());
        assert!(path.with_extension("bak").exists());

        let e = embedder();
        let reloaded = EmbeddingCache::open(e.clone(), &config(true, Some(path.clone())))
            .await
            .unwrap();
        assert_eq!(reloaded.len().await, 2);
        reloaded.get("alpha").await.unwrap();
        assert_eq!(e.calls.load(Ordering::SeqCst), 0);

        // Missing main file falls back to the backup (one entry).
        std::fs::remove_file(&path).unwrap();
        let from_bak = EmbeddingCache::open(embedder(), &config(true, Some(path)))
            .await
            .unwrap();
        assert_eq!(from_bak.len().await, 1);
    }

    #[tokio::test]
    async fn rejects_bad_magic_and_version() {
        let cache = EmbeddingCache::new(embedder(), &config(true, None));
        let mut bytes = 42i32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&2i32.to_le_bytes());
        assert!(cache.deserialize(&bytes).await.is_err());

        let mut bytes = CACHE_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&3i32.to_le_bytes());
        let err = cache.deserialize(&bytes).await.unwrap_err();
        assert!(err.to_string().contains("expected 1-2"));
    }

    #[tokio::test]
    async fn version_one_entries_use_current_model() {
        let mut bytes = CACHE_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        write_str(&mut bytes, "legacy");
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0.25f32.to_le_bytes());

        let e = embedder();
        let cache = EmbeddingCache::new(e.clone(), &config(true, None));
        cache.deserialize(&bytes).await.unwrap();
        assert_eq!(cache.get("legacy").await.unwrap(), vec![0.25]);
        assert_eq!(e.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_counts_are_truncation_errors() {
        let cache = EmbeddingCache::new(embedder(), &config(true, None));
        cache.get("kept").await.unwrap();

        let mut bytes = CACHE_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = cache.deserialize(&bytes).await.unwrap_err();
        assert!(err.to_string().contains("Truncated"));

        let mut bytes = CACHE_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        write_str(&mut bytes, "counting");
        write_str(&mut bytes, "huge");
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = cache.deserialize(&bytes).await.unwrap_err();
        assert!(err.to_string().contains("Truncated"));

        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn opening_a_truncated_file_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("embeddings.bin");

        let cache = EmbeddingCache::new(embedder(), &config(true, Some(path.clone())));
        cache.get("alpha").await.unwrap();
        cache.save().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let err = EmbeddingCache::open(embedder(), &config(true, Some(path)))
            .await
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("Truncated embedding cache"));
    }
}

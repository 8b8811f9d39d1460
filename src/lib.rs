//! # CX Container
//!
//! A multi-tenant document and chat backend with retrieval-augmented
//! answering.
//!
//! Users organise work into projects, nodes and threads. Source documents
//! uploaded to nodes are extracted to plain text, split into token-bounded
//! chunks, embedded and imported into a chunk archive. Questions asked in a
//! thread are answered by a chat model grounded in the most similar chunks,
//! and the answer is stored as a message with citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Storage  │──▶│ Extract  │──▶│   Splitter   │──▶│   Archive   │
//! │ disk/S3  │   │ pdf/docx │   │ token chunks │   │ memory/sql  │
//! └──────────┘   └──────────┘   └──────────────┘   └──────┬──────┘
//!                                                         │
//!     ┌──────────┐   ┌──────────┐   ┌──────────────┐      │
//!     │   HTTP   │──▶│ Threads  │──▶│  Assistant   │◀─────┘
//!     │  (axum)  │   │ messages │   │ chat + cites │
//!     └──────────┘   └──────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Persisted entities |
//! | [`dto`] | Request and response bodies |
//! | [`access`] | Callers, roles and permissions |
//! | [`repo`] | Tenant-scoped persistence |
//! | [`tokens`] | Token estimates |
//! | [`chunk`] | Text chunks and their metadata |
//! | [`splitter`] | Token-bounded text splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embedding_cache`] | Persistent embedding cache |
//! | [`archive`] | Chunk archives and similarity retrieval |
//! | [`chat`] | Chat model abstraction |
//! | [`assistant`] | Retrieval-augmented answering |
//! | [`extract`] | PDF and DOCX text extraction |
//! | [`storage`] | Disk and S3 object storage |
//! | [`ingest`] | Document upload and training pipeline |
//! | [`search`] | Direct archive retrieval |
//! | [`server`] | REST API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod access;
pub mod app;
pub mod archive;
pub mod assistant;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod dto;
pub mod embedding;
pub mod embedding_cache;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod repo;
pub mod search;
pub mod server;
pub mod splitter;
pub mod storage;
pub mod tokens;

#[cfg(test)]
mod test_support;

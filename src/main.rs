//! # CX Container CLI (`cx`)
//!
//! ## Usage
//!
//! ```bash
//! cx --config ./config/cx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cx init` | Create the SQLite database and run schema migrations |
//! | `cx serve` | Start the REST API server |
//! | `cx import <file> --node <id>` | Upload a file to a node and process it |
//! | `cx process <doc-id>` | (Re)process a source document |
//! | `cx search "<query>"` | Retrieve matching chunks from the archive |
//! | `cx ask "<question>"` | Ask the assistant outside any thread |
//!
//! Set `RUST_LOG` to adjust log verbosity and `CX_LOG_FORMAT=json` for
//! JSON log lines.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cx_container::access::Caller;
use cx_container::app::App;
use cx_container::{config, db, logging, migrate, search, server};

/// CX Container: document and chat backend with retrieval-augmented answering.
#[derive(Parser)]
#[command(name = "cx", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the REST API server on `[server].bind`.
    Serve,

    /// Upload a file to a node and process it into the archive.
    Import {
        /// File to upload.
        file: PathBuf,

        /// Node the file belongs to.
        #[arg(long)]
        node: String,
    },

    /// Extract, split and import an existing source document.
    Process {
        /// Source document ID.
        id: String,
    },

    /// Retrieve the archive chunks most similar to a query.
    Search {
        query: String,

        /// Maximum number of chunks.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask the assistant a single question.
    Ask { question: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let caller = Caller::system();

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Import { file, node } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("file path has no file name")?;

            let app = App::open(&cfg).await?;
            let doc = app
                .ingestor
                .upload_document(&caller, &node, file_name, &bytes)
                .await?;
            let report = app.ingestor.process_document(&caller, &doc.id).await?;
            app.persist_cache().await;

            println!("import {}", file.display());
            println!("  document: {}", doc.id);
            println!("  chunks: {}", report.chunks);
            if let Some(w) = report.warnings {
                println!("  warnings: {}", w);
            }
            println!("ok");
        }
        Commands::Process { id } => {
            let app = App::open(&cfg).await?;
            let report = app.ingestor.process_document(&caller, &id).await?;
            app.persist_cache().await;
            println!("processed {} ({} chunks)", report.document_id, report.chunks);
        }
        Commands::Search { query, limit } => {
            let app = App::open(&cfg).await?;
            app.warm_archive().await?;
            search::run_search(&cfg, app.archive.as_ref(), &query, limit).await?;
            app.persist_cache().await;
        }
        Commands::Ask { question } => {
            let app = App::open(&cfg).await?;
            app.warm_archive().await?;
            let answer = app.assistant.ask(&question, &[]).await?;
            app.persist_cache().await;

            println!("{}", answer.answer);
            if !answer.citations.is_empty() {
                println!();
                println!("Sources:");
                for c in &answer.citations {
                    println!("  - {}", c.name);
                }
            }
        }
    }

    Ok(())
}

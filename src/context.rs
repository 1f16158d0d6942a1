//! Process-lifetime dependencies shared by every request.

use anyhow::{Context, Result};
use std::sync::Arc;

use aiha_core::chunk::{ApproxTokenCounter, RecursiveSplitter, TokenCounter};
use aiha_core::embedding::Embedder;
use aiha_core::store::Store;

use crate::blobs::{BlobFetcher, BlobStore, FsBlobStore, HttpFetcher, SourceFetcher};
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generation::{create_chat_model, ChatModel};
use crate::migrate::apply_schema;
use crate::sqlite_store::SqliteStore;

/// Everything a pipeline run needs, built once at startup and cloned
/// cheaply into request handlers.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub embedder: Arc<dyn Embedder>,
    pub chat: Arc<dyn ChatModel>,
    pub blobs: Arc<dyn BlobStore>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub splitter: Arc<RecursiveSplitter>,
}

impl AppContext {
    /// Build the production context: SQLite store, configured providers,
    /// filesystem blob store, and HTTP source fetcher.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        apply_schema(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

        let embedder = create_embedder(&config.embedding)?;
        let chat = create_chat_model(&config.generation)?;
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.blobs.root.clone()));
        let fetcher: Arc<dyn SourceFetcher> =
            Arc::new(HttpFetcher::new(config.ingest.fetch_timeout_secs)?);
        let splitter = Arc::new(build_splitter(&config)?);

        tracing::info!(
            db = %config.db.path.display(),
            embedding = embedder.model_name(),
            generation = chat.model_name(),
            "application context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            embedder,
            chat,
            blobs,
            fetcher,
            splitter,
        })
    }

    /// Read markdown sources from the staging container instead of over
    /// HTTP. Used by the CLI, where documents are local files.
    pub fn with_blob_sources(mut self) -> Self {
        self.fetcher = Arc::new(self.staging_fetcher());
        self
    }

    pub fn staging_fetcher(&self) -> BlobFetcher {
        BlobFetcher::new(
            self.blobs.clone(),
            &self.config.ingest.allowed_source_prefix,
            &self.config.ingest.staging_container,
        )
    }
}

/// Build the chunk splitter with the configured token counter.
pub fn build_splitter(config: &Config) -> Result<RecursiveSplitter> {
    let counter = token_counter(&config.chunking.tokenizer)?;
    RecursiveSplitter::new(config.chunking.splitter_config(), counter)
        .context("invalid [chunking] configuration")
}

fn token_counter(tokenizer: &str) -> Result<Arc<dyn TokenCounter>> {
    if tokenizer == "approx" {
        return Ok(Arc::new(ApproxTokenCounter));
    }
    load_tokenizer(tokenizer)
}

#[cfg(feature = "hf-tokenizer")]
fn load_tokenizer(path: &str) -> Result<Arc<dyn TokenCounter>> {
    let counter = aiha_core::chunk::HfTokenCounter::from_file(std::path::Path::new(path))?;
    Ok(Arc::new(counter))
}

#[cfg(not(feature = "hf-tokenizer"))]
fn load_tokenizer(path: &str) -> Result<Arc<dyn TokenCounter>> {
    anyhow::bail!(
        "chunking.tokenizer = '{}' requires building with the hf-tokenizer feature",
        path
    )
}

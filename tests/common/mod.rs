//! Fakes and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tempfile::TempDir;

use aiha::blobs::{BlobStore, FsBlobStore, SourceFetcher};
use aiha::config::{self, Config};
use aiha::context::{build_splitter, AppContext};
use aiha::generation::{ChatModel, CompletionRequest, TextStream};
use aiha_core::embedding::Embedder;
use aiha_core::store::memory::InMemoryStore;
use aiha_core::store::Store;

pub const SOURCE_PREFIX: &str = "https://aiha.blob.core.windows.net/aiha";
pub const ASSET_BASE: &str = "https://cdn.test/images";

pub fn test_config(tmp: &TempDir) -> Config {
    let root = tmp.path();
    let path = root.join("aiha.toml");
    std::fs::write(
        &path,
        format!(
            r#"[db]
path = "{root}/data/aiha.sqlite"

[chunking]
chunk_size = 64
chunk_overlap = 16

[retrieval]
top_k = 3

[ingest]
allowed_source_prefix = "{prefix}"

[blobs]
root = "{root}/blobs"

[assets]
base_url = "{assets}"
"#,
            root = root.display(),
            prefix = SOURCE_PREFIX,
            assets = ASSET_BASE,
        ),
    )
    .unwrap();
    config::load_config(&path).unwrap()
}

// ─── Embedder ───────────────────────────────────────────────────────

/// Bag-of-words embedder: each lowercase word lands in one of `DIMS`
/// buckets, and the vector is L2-normalized.
pub struct BagOfWordsEmbedder {
    pub calls: AtomicUsize,
    /// When set, every call fails.
    pub fail: AtomicBool,
}

impl BagOfWordsEmbedder {
    pub const DIMS: usize = 32;

    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; Self::DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
        {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
            v[bucket % Self::DIMS] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for BagOfWordsEmbedder {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn dims(&self) -> usize {
        Self::DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("Embedding API error 503: service unavailable"));
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

// ─── Chat model ─────────────────────────────────────────────────────

/// Replies to `complete` with a fixed query and streams fixed deltas.
pub struct ScriptedChat {
    pub query: String,
    pub deltas: Vec<String>,
    /// When set, the answer stream stalls after the deltas instead of ending.
    pub stall: bool,
    /// When set, the answer stream yields this error after the deltas.
    pub failure: Option<String>,
    /// Reported by `supports_web_search`.
    pub web_search: bool,
    pub completions: AtomicUsize,
    pub streams: AtomicUsize,
    pub last_stream: Mutex<Option<CompletionRequest>>,
    /// Set once the answer stream has been dropped.
    pub stream_dropped: Arc<AtomicBool>,
}

impl ScriptedChat {
    pub fn new(query: &str, deltas: &[&str]) -> Self {
        Self {
            query: query.to_string(),
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            stall: false,
            failure: None,
            web_search: false,
            completions: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
            last_stream: Mutex::new(None),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stalling(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn failing_after_deltas(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn with_web_search(mut self) -> Self {
        self.web_search = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.completions.load(Ordering::SeqCst) + self.streams.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn supports_web_search(&self) -> bool {
        self.web_search
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<String> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(self.query.clone())
    }

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        *self.last_stream.lock().unwrap() = Some(request);

        let flag = DropFlag(self.stream_dropped.clone());
        let deltas = futures::stream::iter(self.deltas.clone().into_iter().map(Ok));
        let tail = if self.stall {
            futures::stream::pending().boxed()
        } else if let Some(message) = &self.failure {
            futures::stream::once(futures::future::ready(Err(anyhow!(message.clone())))).boxed()
        } else {
            futures::stream::empty().boxed()
        };
        Ok(deltas
            .chain(tail)
            .map(move |item| {
                let _held = &flag;
                item
            })
            .boxed())
    }
}

// ─── Source fetcher ─────────────────────────────────────────────────

#[derive(Default)]
pub struct StaticFetcher {
    pages: Mutex<HashMap<String, String>>,
    pub calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn with_page(self, url: &str, body: &str) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("Failed to fetch markdown: 404 Not Found"))
    }
}

// ─── Context ────────────────────────────────────────────────────────

pub struct Harness {
    pub ctx: AppContext,
    pub store: Arc<InMemoryStore>,
    pub embedder: Arc<BagOfWordsEmbedder>,
    pub chat: Arc<ScriptedChat>,
    pub fetcher: Arc<StaticFetcher>,
    pub blobs: Arc<FsBlobStore>,
}

pub fn harness(tmp: &TempDir, chat: ScriptedChat, fetcher: StaticFetcher) -> Harness {
    let config = test_config(tmp);
    let store = Arc::new(InMemoryStore::new());
    let embedder = Arc::new(BagOfWordsEmbedder::new());
    let chat = Arc::new(chat);
    let fetcher = Arc::new(fetcher);
    let blobs = Arc::new(FsBlobStore::new(config.blobs.root.clone()));
    let splitter = Arc::new(build_splitter(&config).unwrap());

    let ctx = AppContext {
        config: Arc::new(config),
        store: store.clone() as Arc<dyn Store>,
        embedder: embedder.clone() as Arc<dyn Embedder>,
        chat: chat.clone() as Arc<dyn ChatModel>,
        blobs: blobs.clone() as Arc<dyn BlobStore>,
        fetcher: fetcher.clone() as Arc<dyn SourceFetcher>,
        splitter,
    };
    Harness {
        ctx,
        store,
        embedder,
        chat,
        fetcher,
        blobs,
    }
}

pub async fn stage(blobs: &FsBlobStore, container: &str, name: &str, data: &[u8]) {
    blobs.write(container, name, data).await.unwrap();
}

/// A ~2000 character maintenance manual with one figure.
pub fn manual_markdown() -> String {
    let mut md = String::from("# Pump Maintenance Manual\n\n![Pump overview](/tmp/images/pump.png)\n\n");
    let sections = [
        ("Reset procedure", "To reset the pump, switch off the main breaker, wait thirty seconds, then hold the reset button until the status light blinks green."),
        ("Filter replacement", "Replace the intake filter every six months. Unscrew the housing, remove the cartridge, and insert a new cartridge with the arrow pointing toward the motor."),
        ("Pressure settings", "Normal operating pressure is between two and four bar. Adjust the regulator valve clockwise to increase pressure and counterclockwise to decrease it."),
        ("Error codes", "Code E1 means low water level. Code E2 means overheating of the motor. Code E3 means a blocked impeller that must be cleared by a technician."),
        ("Winter storage", "Drain all water from the housing before storing the pump below freezing temperatures. Keep the unit in a dry place and cover the electrical connectors."),
    ];
    for (title, body) in sections {
        md.push_str(&format!("## {}\n\n{}\n\n{}\n\n", title, body, body));
    }
    md
}

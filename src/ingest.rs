//! Ingestion pipeline.
//!
//! One run turns an uploaded document's markdown rendering into a stored
//! document and its embedded chunks:
//!
//! ```text
//! validate → authorize → fetch markdown → relocate images → rewrite links
//!          → split → embed (batched) → persist document + chunks atomically
//! ```
//!
//! Nothing is written until every chunk has an embedding, so a failed run
//! leaves no trace in the store. Image relocation is best effort and never
//! fails the run.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use aiha_core::chunk::TextChunk;
use aiha_core::images::rewrite_image_links;
use aiha_core::models::{Chunk, Document, DocumentType};

use crate::blobs::{relocate_images, RelocationReport};
use crate::context::AppContext;
use crate::embedding::embed_in_batches;
use crate::error::{PipelineError, PipelineResult, Stage, StageExt};
use crate::projects::{authorize_write, load_project, Identity};

/// Body of `PUT /api/document`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub images_dir: String,
    #[serde(default)]
    pub md_doc_url: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub doc_name: String,
    #[serde(default)]
    pub doc_type: String,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// An [`IngestRequest`] that passed validation.
#[derive(Debug, Clone)]
pub struct ValidIngest {
    pub container_name: String,
    pub images_dir: String,
    pub md_doc_url: String,
    pub project_id: String,
    pub doc_name: String,
    pub doc_type: DocumentType,
    pub source_url: Option<String>,
}

fn required(value: &str, field: &str) -> PipelineResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::validation(format!("Missing {}", field)));
    }
    Ok(trimmed.to_string())
}

impl IngestRequest {
    /// Check required fields, the document type, and the markdown origin.
    pub fn validate(&self, allowed_prefix: &str) -> PipelineResult<ValidIngest> {
        let container_name = required(&self.container_name, "containerName")?;
        let images_dir = required(&self.images_dir, "imagesDir")?;
        let md_doc_url = required(&self.md_doc_url, "mdDocUrl")?;
        if !md_doc_url.starts_with(allowed_prefix) {
            return Err(PipelineError::validation("Invalid mdDocUrl"));
        }
        let project_id = required(&self.project_id, "projectId")?;
        let doc_name = required(&self.doc_name, "docName")?;
        let doc_type = required(&self.doc_type, "docType")?
            .parse::<DocumentType>()
            .map_err(|_| PipelineError::validation("Invalid docType: must be pdf, txt, or md"))?;
        let source_url = self
            .source_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(ValidIngest {
            container_name,
            images_dir,
            md_doc_url,
            project_id,
            doc_name,
            doc_type,
            source_url,
        })
    }
}

/// Result of a successful ingestion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub document_id: String,
    pub chunks: Vec<TextChunk>,
    #[serde(skip)]
    pub document: Document,
    #[serde(skip)]
    pub relocation: RelocationReport,
}

pub async fn run_ingest(
    ctx: &AppContext,
    caller: &Identity,
    request: &IngestRequest,
) -> PipelineResult<IngestOutcome> {
    let req = request.validate(&ctx.config.ingest.allowed_source_prefix)?;

    let project = load_project(ctx.store.as_ref(), &req.project_id).await?;
    authorize_write(&project, caller)?;

    tracing::info!(
        project = %project.id,
        doc = %req.doc_name,
        container = %req.container_name,
        "ingesting document"
    );

    let markdown = ctx
        .fetcher
        .fetch_text(&req.md_doc_url)
        .await
        .stage(Stage::Fetch)?;

    let relocation = relocate_images(
        ctx.blobs.as_ref(),
        &ctx.config.ingest.staging_container,
        &ctx.config.ingest.images_container,
        &req.images_dir,
    )
    .await;

    let rewritten = rewrite_image_links(&markdown, &req.images_dir);
    let pieces = ctx.splitter.split(&rewritten.markdown);
    if pieces.is_empty() {
        return Err(PipelineError::validation("Document has no text content"));
    }
    tracing::debug!(chunks = pieces.len(), images = rewritten.images.len(), "document split");

    let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
    let vectors = embed_in_batches(
        ctx.embedder.as_ref(),
        &texts,
        ctx.config.embedding.batch_size,
    )
    .await
    .stage(Stage::Embedding)?;

    let document = Document {
        id: uuid::Uuid::new_v4().to_string(),
        project_id: project.id.clone(),
        title: req.doc_name.clone(),
        doc_type: req.doc_type,
        thumbnail: rewritten.thumbnail().map(str::to_string),
        source_url: req.source_url.clone(),
        markdown_url: req.md_doc_url.clone(),
        created_at: Utc::now(),
    };

    let chunks: Vec<Chunk> = pieces
        .iter()
        .zip(vectors)
        .map(|(piece, embedding)| {
            Chunk::new(
                &document.id,
                &document.project_id,
                piece.text.clone(),
                Some(piece.lines),
                embedding,
            )
        })
        .collect();

    ctx.store
        .insert_document_with_chunks(&document, &chunks)
        .await
        .stage(Stage::Storage)?;

    tracing::info!(
        document = %document.id,
        chunks = chunks.len(),
        images_copied = relocation.copied,
        "document ingested"
    );

    Ok(IngestOutcome {
        document_id: document.id.clone(),
        chunks: pieces,
        document,
        relocation,
    })
}

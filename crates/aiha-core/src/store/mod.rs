//! Storage abstraction for AIHA.
//!
//! The [`Store`] trait defines every persistence operation the ingestion
//! and query pipelines need, enabling pluggable backends (SQLite in the app
//! crate, in-memory here for tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{Chunk, Document, Project, SearchHit};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_project`](Store::insert_project) | Create a project |
/// | [`update_project`](Store::update_project) | Overwrite a project's editable fields |
/// | [`get_project`](Store::get_project) | Fetch a project by id |
/// | [`find_project_by_name`](Store::find_project_by_name) | Name lookup within one owner |
/// | [`list_projects`](Store::list_projects) | Every project, most recently updated first |
/// | [`list_documents`](Store::list_documents) | Documents of a project |
/// | [`insert_document_with_chunks`](Store::insert_document_with_chunks) | Atomically persist a document and all its chunks |
/// | [`vector_search`](Store::vector_search) | Exact, project-scoped dot-product search |
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_project(&self, project: &Project) -> Result<()>;

    async fn update_project(&self, project: &Project) -> Result<()>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>>;

    async fn find_project_by_name(&self, owner_id: &str, name: &str) -> Result<Option<Project>>;

    async fn list_projects(&self) -> Result<Vec<Project>>;

    async fn list_documents(&self, project_id: &str) -> Result<Vec<Document>>;

    /// Persist a document and its chunks as one unit: either everything is
    /// stored or nothing is.
    async fn insert_document_with_chunks(&self, doc: &Document, chunks: &[Chunk]) -> Result<()>;

    /// Return up to `top_k` chunks of `project_id`, best dot-product first.
    async fn vector_search(
        &self,
        project_id: &str,
        query_vec: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>>;
}

/// Check that every chunk belongs to `doc` before it is written.
pub fn validate_chunks_for(doc: &Document, chunks: &[Chunk]) -> Result<()> {
    for c in chunks {
        if c.document_id != doc.id
            || c.project_id != doc.project_id
            || c.metadata.document_id != doc.id
            || c.metadata.project_id != doc.project_id
        {
            bail!(
                "chunk {} does not belong to document {} in project {}",
                c.id,
                doc.id,
                doc.project_id
            );
        }
    }
    Ok(())
}

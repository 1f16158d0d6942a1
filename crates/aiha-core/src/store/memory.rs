//! In-memory [`Store`] implementation for tests and embedding in other
//! processes.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force dot product over the project's chunks.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{Chunk, Document, Project, SearchHit};
use crate::search::rank_by_dot_product;

use super::{validate_chunks_for, Store};

/// In-memory store.
pub struct InMemoryStore {
    projects: RwLock<HashMap<String, Project>>,
    documents: RwLock<Vec<Document>>,
    chunks: RwLock<Vec<Chunk>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            documents: RwLock::new(Vec::new()),
            chunks: RwLock::new(Vec::new()),
        }
    }

    /// Number of chunks stored across all projects.
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    /// All chunks of one document, in insertion order.
    pub fn chunks_for_document(&self, document_id: &str) -> Vec<Chunk> {
        self.chunks
            .read()
            .map(|c| {
                c.iter()
                    .filter(|c| c.document_id == document_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_project(&self, project: &Project) -> Result<()> {
        let mut projects = write(&self.projects)?;
        if projects.contains_key(&project.id) {
            bail!("project {} already exists", project.id);
        }
        projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn update_project(&self, project: &Project) -> Result<()> {
        let mut projects = write(&self.projects)?;
        match projects.get_mut(&project.id) {
            Some(existing) => {
                *existing = project.clone();
                Ok(())
            }
            None => bail!("project {} not found", project.id),
        }
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        Ok(read(&self.projects)?.get(id).cloned())
    }

    async fn find_project_by_name(&self, owner_id: &str, name: &str) -> Result<Option<Project>> {
        Ok(read(&self.projects)?
            .values()
            .find(|p| p.owner_id == owner_id && p.name == name)
            .cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> = read(&self.projects)?.values().cloned().collect();
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(projects)
    }

    async fn list_documents(&self, project_id: &str) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = read(&self.documents)?
            .iter()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs)
    }

    async fn insert_document_with_chunks(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        validate_chunks_for(doc, chunks)?;
        if !read(&self.projects)?.contains_key(&doc.project_id) {
            bail!("project {} not found", doc.project_id);
        }

        // Take both write locks before mutating so readers never observe a
        // document without its chunks.
        let mut documents = write(&self.documents)?;
        let mut stored = write(&self.chunks)?;
        if documents.iter().any(|d| d.id == doc.id) {
            bail!("document {} already exists", doc.id);
        }
        documents.push(doc.clone());
        stored.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn vector_search(
        &self,
        project_id: &str,
        query_vec: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let chunks = read(&self.chunks)?;
        rank_by_dot_product(
            query_vec,
            top_k,
            chunks.iter().filter(|c| c.project_id == project_id),
        )
    }
}

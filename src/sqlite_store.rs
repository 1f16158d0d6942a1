//! SQLite-backed [`Store`] implementation.
//!
//! Projects, documents, and chunks live in three tables (see
//! [`crate::migrate`]). Embeddings are little-endian f32 BLOBs; vector search
//! loads the requested project's chunks and ranks them exactly in process,
//! so only rows of that project are ever read.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use aiha_core::embedding::{blob_to_vec, vec_to_blob};
use aiha_core::models::{Chunk, ChunkMetadata, Document, DocumentType, Project, SearchHit};
use aiha_core::search::rank_by_dot_product;
use aiha_core::store::{validate_chunks_for, Store};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of chunks stored for one document.
    pub async fn count_chunks(&self, document_id: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

fn ts_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_project(row: &SqliteRow) -> Result<Project> {
    let collaborators_json: String = row.get("collaborators_json");
    let is_public: i64 = row.get("is_public");
    Ok(Project {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        owner_id: row.get("owner_id"),
        owner_name: row.get("owner_name"),
        is_public: is_public != 0,
        collaborators: serde_json::from_str(&collaborators_json)
            .context("corrupt collaborators_json")?,
        created_at: ts_to_datetime(row.get("created_at")),
        updated_at: ts_to_datetime(row.get("updated_at")),
    })
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let doc_type: String = row.get("doc_type");
    Ok(Document {
        id: row.get("id"),
        project_id: row.get("project_id"),
        title: row.get("title"),
        doc_type: doc_type.parse::<DocumentType>()?,
        thumbnail: row.get("thumbnail"),
        source_url: row.get("source_url"),
        markdown_url: row.get("markdown_url"),
        created_at: ts_to_datetime(row.get("created_at")),
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let metadata_json: String = row.get("metadata_json");
    let blob: Vec<u8> = row.get("embedding");
    let metadata: ChunkMetadata =
        serde_json::from_str(&metadata_json).context("corrupt chunk metadata_json")?;
    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        project_id: row.get("project_id"),
        content: row.get("content"),
        metadata,
        embedding: blob_to_vec(&blob),
        created_at: ts_to_datetime(row.get("created_at")),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, description, owner_id, owner_name,
                                  is_public, collaborators_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(&project.owner_id)
        .bind(&project.owner_name)
        .bind(project.is_public as i64)
        .bind(serde_json::to_string(&project.collaborators)?)
        .bind(project.created_at.timestamp_millis())
        .bind(project.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_project(&self, project: &Project) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET name = ?, description = ?, is_public = ?, collaborators_json = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.is_public as i64)
        .bind(serde_json::to_string(&project.collaborators)?)
        .bind(project.updated_at.timestamp_millis())
        .bind(&project.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("project {} not found", project.id);
        }
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_project).transpose()
    }

    async fn find_project_by_name(&self, owner_id: &str, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE owner_id = ? AND name = ?")
            .bind(owner_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_project).transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY updated_at DESC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_project).collect()
    }

    async fn list_documents(&self, project_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE project_id = ? ORDER BY created_at DESC, id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn insert_document_with_chunks(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        validate_chunks_for(doc, chunks)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, project_id, title, doc_type, thumbnail,
                                   source_url, markdown_url, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.project_id)
        .bind(&doc.title)
        .bind(doc.doc_type.as_str())
        .bind(&doc.thumbnail)
        .bind(&doc.source_url)
        .bind(&doc.markdown_url)
        .bind(doc.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, project_id, content,
                                    metadata_json, embedding, dims, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.project_id)
            .bind(&chunk.content)
            .bind(serde_json::to_string(&chunk.metadata)?)
            .bind(vec_to_blob(&chunk.embedding))
            .bind(chunk.embedding.len() as i64)
            .bind(chunk.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        // Dropping `tx` on any early return above rolls everything back.
        tx.commit().await?;
        Ok(())
    }

    async fn vector_search(
        &self,
        project_id: &str,
        query_vec: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        let chunks: Vec<Chunk> = rows.iter().map(row_to_chunk).collect::<Result<_>>()?;
        rank_by_dot_product(query_vec, top_k, chunks.iter())
    }
}

//! Core data models used throughout AIHA.
//!
//! These types represent the projects, documents, chunks, search hits, and
//! chat messages that flow through the ingestion and query pipelines. The
//! JSON shapes (camelCase) are the ones exchanged with the web frontend and
//! stored in chunk metadata.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of source document formats accepted for ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Pdf,
    Txt,
    Md,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "pdf",
            DocumentType::Txt => "txt",
            DocumentType::Md => "md",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(DocumentType::Pdf),
            "txt" => Ok(DocumentType::Txt),
            "md" => Ok(DocumentType::Md),
            other => anyhow::bail!("unknown document type '{}': must be pdf, txt, or md", other),
        }
    }
}

/// Access-control boundary owning documents and, transitively, chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub owner_id: String,
    pub owner_name: String,
    pub is_public: bool,
    pub collaborators: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// True if `user_id` is the owner or a listed collaborator.
    pub fn is_member(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.collaborators.iter().any(|c| c == user_id)
    }

    /// Read access: public projects, or any member.
    pub fn can_read(&self, user_id: Option<&str>) -> bool {
        self.is_public || user_id.is_some_and(|u| self.is_member(u))
    }

    /// Write access (adding documents and chunks): members only, even for
    /// public projects.
    pub fn can_write(&self, user_id: Option<&str>) -> bool {
        user_id.is_some_and(|u| self.is_member(u))
    }
}

/// One uploaded source artifact within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub doc_type: DocumentType,
    /// First rewritten image link, still carrying the `${BASE_URL}` placeholder.
    pub thumbnail: Option<String>,
    /// Where the original upload lives.
    pub source_url: Option<String>,
    /// The markdown rendering that was chunked.
    pub markdown_url: String,
    pub created_at: DateTime<Utc>,
}

/// Inclusive, 1-based line range of a chunk within its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub lines: LineRange,
}

/// Metadata stored alongside every chunk.
///
/// `documentId` and `projectId` are always present and always equal the
/// owning chunk's ids. Additional keys are preserved through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub document_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<ChunkLocation>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A persisted, embedded slice of a document's text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub project_id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Build a chunk whose metadata ids are derived from the owning ids, so
    /// the two can never disagree.
    pub fn new(
        document_id: &str,
        project_id: &str,
        content: String,
        lines: Option<LineRange>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            project_id: project_id.to_string(),
            content,
            metadata: ChunkMetadata {
                document_id: document_id.to_string(),
                project_id: project_id.to_string(),
                loc: lines.map(|lines| ChunkLocation { lines }),
                extra: serde_json::Map::new(),
            },
            embedding,
            created_at: Utc::now(),
        }
    }
}

/// A vector search result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

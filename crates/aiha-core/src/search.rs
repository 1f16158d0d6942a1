//! Project-scoped exact vector search.
//!
//! Search is exact nearest-neighbour by dot product (the metric the chunk
//! embeddings are normalised for), restricted to one project. The project
//! filter is applied by the store before scoring, and [`search_chunks`]
//! re-checks every hit, so a chunk from another project can never be
//! returned whatever its similarity.
//!
//! Ordering is by descending score, then ascending chunk id so equal
//! scores rank the same way on every call.

use std::cmp::Ordering;
use std::collections::HashSet;

use anyhow::{anyhow, bail, Result};

use crate::embedding::dot_product;
use crate::models::{Chunk, SearchHit};
use crate::store::Store;

/// Number of chunks retrieved per chat turn when not configured otherwise.
pub const DEFAULT_TOP_K: usize = 6;

/// Run a vector search against a [`Store`] backend.
///
/// The caller must already have verified that the requesting user may read
/// `project_id`.
pub async fn search_chunks<S: Store + ?Sized>(
    store: &S,
    project_id: &str,
    query_vec: &[f32],
    top_k: usize,
) -> Result<Vec<SearchHit>> {
    if project_id.trim().is_empty() {
        bail!("project id is required");
    }
    if query_vec.is_empty() {
        bail!("query vector must not be empty");
    }
    if top_k == 0 {
        bail!("top_k must be a positive integer");
    }

    let mut hits = store.vector_search(project_id, query_vec, top_k).await?;
    hits.retain(|h| h.metadata.project_id == project_id);
    hits.truncate(top_k);
    Ok(hits)
}

/// Score `chunks` against `query`, keeping the best `top_k`.
///
/// Duplicate chunk ids are scored once. A chunk whose embedding length
/// differs from the query's is an error: mixed-dimension indexes are not
/// supported.
pub fn rank_by_dot_product<'a, I>(query: &[f32], top_k: usize, chunks: I) -> Result<Vec<SearchHit>>
where
    I: IntoIterator<Item = &'a Chunk>,
{
    if top_k == 0 {
        return Ok(Vec::new());
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut scored: Vec<(f32, &Chunk)> = Vec::new();
    for chunk in chunks {
        if !seen.insert(chunk.id.as_str()) {
            continue;
        }
        let score = dot_product(query, &chunk.embedding).ok_or_else(|| {
            anyhow!(
                "embedding dimension mismatch: query has {} dims, chunk {} has {}",
                query.len(),
                chunk.id,
                chunk.embedding.len()
            )
        })?;
        scored.push((score, chunk));
    }

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });
    scored.truncate(top_k);

    Ok(scored
        .into_iter()
        .map(|(score, c)| SearchHit {
            chunk_id: c.id.clone(),
            document_id: c.document_id.clone(),
            content: c.content.clone(),
            metadata: c.metadata.clone(),
            score,
        })
        .collect())
}

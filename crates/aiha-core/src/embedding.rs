//! Embedding gateway trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that every embedding backend implements,
//! plus pure helpers for vector serialization and similarity computation.
//!
//! Concrete providers (OpenAI-compatible HTTP, disabled) live in the `aiha`
//! app crate.

use anyhow::{bail, Result};
use async_trait::async_trait;

/// Boundary to an external embedding service.
///
/// Ingestion and query must use the same embedder configuration: vectors
/// of different dimensionality cannot be compared.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts. The output has one vector per input, in
    /// input order, or the whole call fails.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        check_batch(&vectors, 1, self.dims())?;
        Ok(vectors.remove(0))
    }
}

/// Verify that a provider response is a complete batch: `expected` vectors,
/// each of `dims` entries. Partial batches are rejected as a unit.
pub fn check_batch(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<()> {
    if vectors.len() != expected {
        bail!(
            "Embedding batch size mismatch: sent {} texts, got {} vectors",
            expected,
            vectors.len()
        );
    }
    if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dims) {
        bail!(
            "Embedding dimension mismatch at position {}: expected {}, got {}",
            i,
            dims,
            v.len()
        );
    }
    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use aiha_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Dot product of two equal-length vectors.
///
/// Returns `None` when the lengths differ; callers treat that as a
/// mixed-dimension index, which is unsupported.
pub fn dot_product(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_dot_product() {
        assert_eq!(dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), Some(32.0));
        assert_eq!(dot_product(&[], &[]), Some(0.0));
        assert_eq!(dot_product(&[1.0], &[1.0, 2.0]), None);
    }

    #[test]
    fn test_check_batch() {
        let ok = vec![vec![0.0; 3], vec![1.0; 3]];
        assert!(check_batch(&ok, 2, 3).is_ok());
        assert!(check_batch(&ok, 3, 3).is_err());
        assert!(check_batch(&ok, 2, 4).is_err());
    }
}

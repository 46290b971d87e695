//! Embedding generation.
//!
//! The only built-in model is the deterministic `hash` embedding, which maps
//! text into a fixed-dimension vector derived from its SHA-256 digest. It is
//! useless for semantics but stable across runs, which is exactly what the
//! offline test and fallback paths need. Anything else must be provided by an
//! external embedder and is rejected here; the index pipeline downgrades
//! `fastembed*` models to `hash` when they fail.

use crate::error::{Result, SiktError};
use sha2::{Digest, Sha256};

fn hash_embedding(text: &str, dim: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let n = digest.len();
    (0..dim)
        .map(|i| (f32::from(digest[i % n]) - 128.0) / 128.0)
        .collect()
}

/// Embed a batch of texts under the named model.
pub fn embed_texts(texts: &[String], model: &str, dim: usize) -> Result<Vec<Vec<f32>>> {
    let model = model.trim().to_lowercase();
    if model != "hash" {
        return Err(SiktError::Embedding(
            "EMBEDDING_MODEL_NOT_SUPPORTED".to_string(),
        ));
    }

    Ok(texts.iter().map(|t| hash_embedding(t, dim)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_embedding_is_deterministic() {
        let a = embed_texts(&["hello".to_string()], "hash", 384).unwrap();
        let b = embed_texts(&["hello".to_string()], "hash", 384).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 384);
        assert!(a[0].iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_different_texts_differ() {
        let out = embed_texts(&["a".to_string(), "b".to_string()], "hash", 16).unwrap();
        assert_ne!(out[0], out[1]);
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let err = embed_texts(&["x".to_string()], "fastembed-small", 8).unwrap_err();
        assert_eq!(err.to_string(), "EMBEDDING_MODEL_NOT_SUPPORTED");
    }
}

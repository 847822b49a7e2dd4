//! Text-to-vector embedding collaborator.
//!
//! The engine treats embedding as an opaque external function returning a
//! fixed-length vector; centroids are the only consumer. Provides the
//! [`EmbeddingProvider`] trait, a deterministic feature-hashing provider for
//! demo and test use, and a factory from configuration.

use anyhow::Result;

/// Trait for embedding text into vectors.
///
/// Implementations produce vectors of exactly `dimensions()` length. All
/// methods are synchronous — callers in async contexts should use
/// `tokio::task::spawn_blocking` for heavyweight providers.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize;
}

/// Deterministic feature-hashing embedder: token hashes bucketed into a
/// fixed-length L2-normalized vector. No semantics, but stable across runs,
/// which is what demos and routing tests need.
pub struct HashEmbeddingProvider {
    dimensions: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric());
            if token.is_empty() {
                continue;
            }
            let bucket = fnv1a(&token.to_lowercase()) as usize % self.dimensions;
            v[bucket] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// FNV-1a, enough to spread tokens across buckets deterministically.
fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Create an embedding provider from config.
///
/// `"hash"` is the deterministic built-in; `"none"` disables embeddings
/// entirely (branch centroids stay empty).
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Option<Box<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "hash" => Ok(Some(Box::new(HashEmbeddingProvider::new(
            config.dimensions,
        )))),
        "none" => Ok(None),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: hash, none"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedding_is_deterministic() {
        let provider = HashEmbeddingProvider::new(64);
        let a = provider.embed("plan a trip to Paris").unwrap();
        let b = provider.embed("plan a trip to Paris").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hash_embedding_is_normalized() {
        let provider = HashEmbeddingProvider::new(64);
        let v = provider.embed("hotels near the Eiffel Tower").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let provider = HashEmbeddingProvider::new(16);
        let v = provider.embed("").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn none_provider_disables_embeddings() {
        let config = crate::config::EmbeddingConfig {
            provider: "none".into(),
            dimensions: 0,
        };
        assert!(create_provider(&config).unwrap().is_none());
    }
}

//! Text-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] trait and an implementation backed by the
//! model runtime's embeddings endpoint. Vectors are L2-normalized so that the
//! sqlite-vec L2 distance can be converted to cosine similarity.

pub mod ollama;

use anyhow::Result;
use async_trait::async_trait;

pub use ollama::OllamaEmbedder;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly
/// [`EmbeddingProvider::dimensions`] entries.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;

    /// Identifier stored in `schema_meta` to detect model changes.
    fn model_name(&self) -> &str;
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// For unit vectors, `||a - b||² = 2 - 2·cos(a, b)`.
pub fn cosine_threshold_to_l2(threshold: f64) -> f64 {
    (2.0 - 2.0 * threshold).max(0.0).sqrt()
}

pub fn l2_to_cosine(distance: f64) -> f64 {
    1.0 - (distance * distance) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_length() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0f32; 4];
        l2_normalize(&mut zero);
        assert!(zero.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn threshold_conversion_round_trips() {
        for cos in [0.0, 0.5, 0.75, 0.92, 1.0] {
            let d = cosine_threshold_to_l2(cos);
            assert!((l2_to_cosine(d) - cos).abs() < 1e-9);
        }
        assert_eq!(cosine_threshold_to_l2(1.0), 0.0);
    }
}

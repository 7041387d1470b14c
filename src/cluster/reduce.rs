//! Dimensionality reduction ahead of clustering, with degradation.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::linalg::{pca, spectral_embedding};

/// Method that produced the reduced space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    Spectral,
    Pca,
    /// No reduction; the embeddings themselves.
    Raw,
}

impl Reduction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reduction::Spectral => "spectral",
            Reduction::Pca => "pca",
            Reduction::Raw => "raw",
        }
    }
}

/// Reduce `vectors` to `dims` dimensions: spectral embedding, else PCA,
/// else the raw vectors. Never fails.
pub fn reduce(
    vectors: &[Vec<f32>],
    dims: usize,
    neighbors: usize,
    seed: u64,
) -> (Vec<Vec<f64>>, Reduction) {
    let source_dims = vectors.first().map(|v| v.len()).unwrap_or(0);
    if source_dims <= dims {
        info!(source_dims, dims, "embeddings already low-dimensional, skipping reduction");
        return (raw(vectors), Reduction::Raw);
    }

    match spectral_embedding(vectors, dims, neighbors, seed) {
        Ok(points) => return (points, Reduction::Spectral),
        Err(e) => warn!(error = %e, "spectral reduction unavailable, degrading to pca"),
    }
    match pca(vectors, dims, seed) {
        Ok(points) => return (points, Reduction::Pca),
        Err(e) => warn!(error = %e, "pca reduction unavailable, clustering raw embeddings"),
    }
    (raw(vectors), Reduction::Raw)
}

fn raw(vectors: &[Vec<f32>]) -> Vec<Vec<f64>> {
    vectors
        .iter()
        .map(|v| v.iter().map(|x| *x as f64).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrades_to_raw_for_tiny_input() {
        let vectors = vec![vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]];
        let (points, method) = reduce(&vectors, 2, 5, 0);
        assert_eq!(method, Reduction::Raw);
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn test_degrades_to_pca_when_spectral_needs_more_points() {
        let vectors = vec![
            vec![1.0, 0.0, 0.2, 0.0],
            vec![0.0, 1.0, 0.0, 0.3],
            vec![0.5, 0.5, 0.1, 0.9],
        ];
        let (points, method) = reduce(&vectors, 2, 5, 0);
        assert_eq!(method, Reduction::Pca);
        assert!(points.iter().all(|p| p.len() == 2));
    }

    #[test]
    fn test_spectral_when_enough_points() {
        let vectors: Vec<Vec<f32>> = (0..20)
            .map(|i| {
                let t = i as f32 * 0.3;
                vec![t.cos(), t.sin(), (i % 2) as f32, 0.1 * i as f32]
            })
            .collect();
        let (points, method) = reduce(&vectors, 2, 5, 0);
        assert_eq!(method, Reduction::Spectral);
        assert_eq!(points.len(), 20);
    }

    #[test]
    fn test_low_dimensional_input_is_kept() {
        let vectors = vec![vec![1.0, 2.0]; 10];
        let (_, method) = reduce(&vectors, 5, 5, 0);
        assert_eq!(method, Reduction::Raw);
    }
}

//! Batch clustering of chunk embeddings.
//!
//! One call to [`cluster_chunks`] covers a whole run: reduce, cluster, then
//! summarise every non-noise cluster. Nothing is merged with earlier runs.

pub mod hdbscan;
pub mod reduce;
pub mod summary;

use std::collections::BTreeMap;

use tracing::info;

use crate::config::ClusteringConfig;
use crate::error::Result;
use crate::models::NOISE_CLUSTER;

pub use hdbscan::{hdbscan, HdbscanParams};
pub use reduce::{reduce, Reduction};

/// One chunk's input to clustering.
#[derive(Debug, Clone)]
pub struct ClusterInput {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub title: String,
}

/// Summary of one non-noise cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSummary {
    pub id: i64,
    pub size: usize,
    pub top_terms: Vec<String>,
    pub sample_titles: Vec<String>,
    pub centroid: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    /// `(chunk_id, cluster_id)` in input order.
    pub assignments: Vec<(String, i64)>,
    pub clusters: Vec<ClusterSummary>,
    pub reduction: Reduction,
}

impl ClusterOutcome {
    pub fn noise_count(&self) -> usize {
        self.assignments
            .iter()
            .filter(|(_, c)| *c == NOISE_CLUSTER)
            .count()
    }
}

pub fn params_from_config(config: &ClusteringConfig) -> HdbscanParams {
    HdbscanParams::default()
        .with_min_cluster_size(config.min_cluster_size)
        .with_min_samples(config.min_samples.unwrap_or(config.min_cluster_size))
        .with_selection(config.selection)
}

/// Cluster the full input set.
pub fn cluster_chunks(
    inputs: &[ClusterInput],
    config: &ClusteringConfig,
) -> Result<ClusterOutcome> {
    let params = params_from_config(config);
    params.validate()?;

    let vectors: Vec<Vec<f32>> = inputs.iter().map(|i| i.vector.clone()).collect();
    let (points, reduction) = reduce(&vectors, config.reduce_dims, config.neighbors, config.seed);
    let labels = hdbscan(&points, &params)?;

    let mut members: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, label) in labels.iter().enumerate() {
        if *label != NOISE_CLUSTER {
            members.entry(*label).or_default().push(i);
        }
    }

    let clusters: Vec<ClusterSummary> = members
        .into_iter()
        .map(|(id, idx)| ClusterSummary {
            id,
            size: idx.len(),
            top_terms: summary::top_terms(
                idx.iter().map(|&i| inputs[i].text.as_str()),
                config.top_terms,
            ),
            sample_titles: summary::sample_titles(
                idx.iter().map(|&i| inputs[i].title.as_str()),
                config.sample_titles,
            ),
            centroid: summary::centroid(idx.iter().map(|&i| inputs[i].vector.as_slice())),
        })
        .collect();

    let outcome = ClusterOutcome {
        assignments: inputs
            .iter()
            .zip(labels)
            .map(|(input, label)| (input.chunk_id.clone(), label))
            .collect(),
        clusters,
        reduction,
    };
    info!(
        points = inputs.len(),
        clusters = outcome.clusters.len(),
        noise = outcome.noise_count(),
        reduction = reduction.as_str(),
        "clustering complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;

    const TOPICS: [(&str, &str); 3] = [
        ("Rust questions", "rust borrow checker lifetime ownership compiler trait"),
        ("Baking", "sourdough starter flour hydration oven crust dough"),
        ("Finance", "portfolio index fund dividend bond yield retirement"),
    ];

    fn corpus(per_topic: usize) -> Vec<ClusterInput> {
        let hasher = HashingProvider::new(128);
        let mut inputs = Vec::new();
        for i in 0..per_topic {
            for (t, (title, words)) in TOPICS.iter().enumerate() {
                let ws: Vec<&str> = words.split(' ').collect();
                // Rotate so chunks in a topic differ but share vocabulary.
                let text = (0..5)
                    .map(|k| ws[(i + k) % ws.len()])
                    .collect::<Vec<_>>()
                    .join(" ");
                inputs.push(ClusterInput {
                    chunk_id: format!("c{}-{}", t, i),
                    vector: hasher.embed_one(&text),
                    text,
                    title: title.to_string(),
                });
            }
        }
        inputs
    }

    #[test]
    fn test_fifty_chunks_get_ids_and_summaries() {
        let mut inputs = corpus(16);
        inputs.truncate(48);
        let hasher = HashingProvider::new(128);
        for k in 0..2 {
            let text = format!("unrelated gibberish zebra quartz {}", k);
            inputs.push(ClusterInput {
                chunk_id: format!("noise-{}", k),
                vector: hasher.embed_one(&text),
                text,
                title: "Misc".into(),
            });
        }
        assert_eq!(inputs.len(), 50);

        let config = ClusteringConfig {
            min_cluster_size: 5,
            ..ClusteringConfig::default()
        };
        let outcome = cluster_chunks(&inputs, &config).unwrap();
        assert_eq!(outcome.assignments.len(), 50);

        let k = outcome.clusters.len() as i64;
        assert!(k >= 1);
        for (_, c) in &outcome.assignments {
            assert!(*c == NOISE_CLUSTER || (0..k).contains(c));
        }
        let c0 = outcome.clusters.iter().find(|c| c.id == 0).unwrap();
        assert!(c0.top_terms.len() <= 10);
        assert!(c0.sample_titles.len() <= 5);
        assert_eq!(c0.centroid.len(), 128);
        let total: usize = outcome.clusters.iter().map(|c| c.size).sum();
        assert_eq!(total + outcome.noise_count(), 50);
    }

    #[test]
    fn test_fewer_than_min_cluster_size_all_noise() {
        let inputs = corpus(1);
        let outcome = cluster_chunks(&inputs, &ClusteringConfig::default()).unwrap();
        assert!(outcome.clusters.is_empty());
        assert_eq!(outcome.noise_count(), 3);
    }

    #[test]
    fn test_min_samples_defaults_to_min_cluster_size() {
        let config = ClusteringConfig {
            min_cluster_size: 7,
            ..ClusteringConfig::default()
        };
        assert_eq!(params_from_config(&config).min_samples, 7);
    }
}

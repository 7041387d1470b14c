//! 2D positioning of chunks for display.
//!
//! Chunk texts are turned into TF-IDF vectors and laid out by the first
//! algorithm in the configured preference list that can handle the input.
//! `random` always succeeds, so positioning never fails.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::cluster::summary::content_tokens;
use crate::config::LayoutConfig;
use crate::error::{Error, Result};
use crate::linalg::{normalize_unit_range, pca, spectral_embedding};
use crate::models::{LayoutMethod, NOISE_CLUSTER};

/// Vocabulary cap for TF-IDF features.
pub const MAX_FEATURES: usize = 2048;

#[derive(Debug, Clone)]
pub struct Layout {
    /// `(x, y)` per input, in input order, each coordinate in `[-1, 1]`.
    pub points: Vec<(f32, f32)>,
    pub method: LayoutMethod,
}

pub fn parse_method(name: &str) -> Option<LayoutMethod> {
    match name {
        "spectral" => Some(LayoutMethod::Spectral),
        "pca" => Some(LayoutMethod::Pca),
        "random" => Some(LayoutMethod::Random),
        _ => None,
    }
}

/// L2-normalised TF-IDF vectors over the `max_features` terms with the
/// highest document frequency.
pub fn tfidf<S: AsRef<str>>(texts: &[S], max_features: usize) -> Vec<Vec<f32>> {
    let docs: Vec<Vec<String>> = texts
        .iter()
        .map(|t| content_tokens(t.as_ref()).collect())
        .collect();

    let mut df: HashMap<&str, usize> = HashMap::new();
    for doc in &docs {
        let mut seen: Vec<&str> = doc.iter().map(|s| s.as_str()).collect();
        seen.sort_unstable();
        seen.dedup();
        for term in seen {
            *df.entry(term).or_insert(0) += 1;
        }
    }
    let mut vocab: Vec<(&str, usize)> = df.into_iter().collect();
    vocab.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    vocab.truncate(max_features);

    let n = docs.len() as f32;
    let index: HashMap<&str, (usize, f32)> = vocab
        .iter()
        .enumerate()
        .map(|(i, (term, df))| (*term, (i, ((1.0 + n) / (1.0 + *df as f32)).ln() + 1.0)))
        .collect();

    docs.iter()
        .map(|doc| {
            let mut v = vec![0.0f32; vocab.len()];
            for token in doc {
                if let Some((i, idf)) = index.get(token.as_str()) {
                    v[*i] += idf;
                }
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                v.iter_mut().for_each(|x| *x /= norm);
            }
            v
        })
        .collect()
}

fn run_method(
    method: LayoutMethod,
    features: &[Vec<f32>],
    config: &LayoutConfig,
) -> Result<Vec<Vec<f64>>> {
    match method {
        LayoutMethod::Spectral => spectral_embedding(features, 2, config.neighbors, config.seed),
        LayoutMethod::Pca => pca(features, 2, config.seed),
        LayoutMethod::Random => Ok(random_points(features.len(), config.seed)),
    }
}

fn random_points(n: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| vec![rng.gen_range(-1.0..=1.0), rng.gen_range(-1.0..=1.0)])
        .collect()
}

/// Lay out `texts` in 2D.
pub fn layout<S: AsRef<str>>(texts: &[S], config: &LayoutConfig) -> Layout {
    let mut order: Vec<LayoutMethod> = config
        .algorithms
        .iter()
        .filter_map(|name| parse_method(name))
        .collect();
    if !order.contains(&LayoutMethod::Random) {
        order.push(LayoutMethod::Random);
    }

    let features = tfidf(texts, MAX_FEATURES);
    for method in order {
        let no_vocabulary = features.first().map_or(true, |f| f.is_empty());
        let attempt = if method != LayoutMethod::Random && no_vocabulary {
            Err(Error::MissingDependency("no vocabulary to lay out".into()))
        } else {
            run_method(method, &features, config)
        };
        match attempt {
            Ok(mut points) => {
                if method != LayoutMethod::Random {
                    normalize_unit_range(&mut points);
                }
                info!(points = points.len(), method = method.as_str(), "layout complete");
                return Layout {
                    points: points
                        .into_iter()
                        .map(|p| (p[0] as f32, p[1] as f32))
                        .collect(),
                    method,
                };
            }
            Err(e) => warn!(
                method = method.as_str(),
                error = %e,
                "layout algorithm unavailable, degrading"
            ),
        }
    }
    // Random is always in the list and always succeeds.
    Layout {
        points: Vec::new(),
        method: LayoutMethod::Random,
    }
}

/// Mean position of each cluster's members. Noise is not a cluster.
pub fn cluster_centers(
    members: impl IntoIterator<Item = (i64, (f32, f32))>,
) -> BTreeMap<i64, (f32, f32)> {
    let mut sums: BTreeMap<i64, (f64, f64, usize)> = BTreeMap::new();
    for (cluster, (x, y)) in members {
        if cluster == NOISE_CLUSTER {
            continue;
        }
        let e = sums.entry(cluster).or_insert((0.0, 0.0, 0));
        e.0 += x as f64;
        e.1 += y as f64;
        e.2 += 1;
    }
    sums.into_iter()
        .map(|(id, (sx, sy, n))| (id, ((sx / n as f64) as f32, (sy / n as f64) as f32)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts() -> Vec<String> {
        let mut out = Vec::new();
        for i in 0..8 {
            out.push(format!("rust borrow checker lifetimes variant{}", i % 3));
            out.push(format!("sourdough starter hydration flour batch{}", i % 3));
        }
        out
    }

    fn in_range(layout: &Layout) -> bool {
        layout
            .points
            .iter()
            .all(|(x, y)| (-1.0..=1.0).contains(x) && (-1.0..=1.0).contains(y))
    }

    #[test]
    fn test_tfidf_is_normalised_and_capped() {
        let vectors = tfidf(&texts(), 4);
        assert!(vectors.iter().all(|v| v.len() == 4));
        for v in &vectors {
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!(norm == 0.0 || (norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_spectral_layout_preferred() {
        let layout = layout(&texts(), &LayoutConfig::default());
        assert_eq!(layout.method, LayoutMethod::Spectral);
        assert_eq!(layout.points.len(), 16);
        assert!(in_range(&layout));
    }

    #[test]
    fn test_degrades_to_random_for_tiny_input() {
        let layout = layout(&["only one"], &LayoutConfig::default());
        assert_eq!(layout.method, LayoutMethod::Random);
        assert_eq!(layout.points.len(), 1);
        assert!(in_range(&layout));
    }

    #[test]
    fn test_pca_when_listed_first() {
        let config = LayoutConfig {
            algorithms: vec!["pca".into()],
            ..LayoutConfig::default()
        };
        let layout = layout(&texts(), &config);
        assert_eq!(layout.method, LayoutMethod::Pca);
        assert!(in_range(&layout));
    }

    #[test]
    fn test_random_is_seeded() {
        let config = LayoutConfig {
            algorithms: vec!["random".into()],
            ..LayoutConfig::default()
        };
        let a = layout(&texts(), &config);
        let b = layout(&texts(), &config);
        assert_eq!(a.points, b.points);
    }

    #[test]
    fn test_cluster_centers_skip_noise() {
        let centers = cluster_centers(vec![
            (0, (0.0, 0.0)),
            (0, (1.0, -1.0)),
            (1, (0.5, 0.5)),
            (NOISE_CLUSTER, (0.9, 0.9)),
        ]);
        assert_eq!(centers.len(), 2);
        assert_eq!(centers[&0], (0.5, -0.5));
        assert_eq!(centers[&1], (0.5, 0.5));
    }
}

//! Small dense linear-algebra kernels for reduction and layout.
//!
//! Everything here works on row-major `Vec<Vec<_>>` point sets and solves
//! for a handful of leading eigenvectors by orthogonal (subspace) iteration,
//! so no external BLAS/LAPACK is needed. Failures that make an algorithm
//! unusable for the given input are reported as
//! [`Error::MissingDependency`] so callers can degrade.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

const MAX_ITERS: usize = 500;
const TOLERANCE: f64 = 1e-9;
const COLLAPSE: f64 = 1e-10;

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Gram-Schmidt `cols` in place, first against `fixed`, then each other.
/// Returns `false` if any column collapses to zero.
fn orthonormalize(cols: &mut [Vec<f64>], fixed: &[Vec<f64>]) -> bool {
    for i in 0..cols.len() {
        for f in fixed {
            let p = dot(&cols[i], f);
            for (x, y) in cols[i].iter_mut().zip(f) {
                *x -= p * y;
            }
        }
        for j in 0..i {
            let (done, rest) = cols.split_at_mut(i);
            let p = dot(&rest[0], &done[j]);
            for (x, y) in rest[0].iter_mut().zip(&done[j]) {
                *x -= p * y;
            }
        }
        let n = norm(&cols[i]);
        if !n.is_finite() || n < COLLAPSE {
            return false;
        }
        for x in cols[i].iter_mut() {
            *x /= n;
        }
    }
    true
}

/// Leading `k` eigenvectors of a symmetric positive semi-definite operator
/// of size `n`, orthogonal to `deflate`. Columns come back ordered by
/// decreasing eigenvalue with a deterministic sign.
pub fn top_eigenvectors<F>(
    n: usize,
    k: usize,
    apply: F,
    deflate: &[Vec<f64>],
    seed: u64,
) -> Option<Vec<Vec<f64>>>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    if k == 0 || k + deflate.len() > n {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut cols: Vec<Vec<f64>> = (0..k)
        .map(|_| (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();
    if !orthonormalize(&mut cols, deflate) {
        return None;
    }

    for _ in 0..MAX_ITERS {
        let mut next: Vec<Vec<f64>> = cols.iter().map(|c| apply(c)).collect();
        if !orthonormalize(&mut next, deflate) {
            return None;
        }
        let delta = cols
            .iter()
            .zip(&next)
            .map(|(a, b)| 1.0 - dot(a, b).abs())
            .fold(0.0f64, f64::max);
        cols = next;
        if delta < TOLERANCE {
            break;
        }
    }

    for col in cols.iter_mut() {
        let pivot = col
            .iter()
            .copied()
            .fold(0.0f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
        if pivot < 0.0 {
            for x in col.iter_mut() {
                *x = -*x;
            }
        }
    }
    Some(cols)
}

fn to_f64(data: &[Vec<f32>]) -> Vec<Vec<f64>> {
    data.iter()
        .map(|row| row.iter().map(|x| *x as f64).collect())
        .collect()
}

/// Project `data` onto its top `k` principal components.
pub fn pca(data: &[Vec<f32>], k: usize, seed: u64) -> Result<Vec<Vec<f64>>> {
    let n = data.len();
    if n < 2 {
        return Err(Error::MissingDependency(format!(
            "pca needs at least 2 points, got {}",
            n
        )));
    }
    let d = data[0].len();
    if data.iter().any(|r| r.len() != d) {
        return Err(Error::MissingDependency("pca needs equal-length vectors".into()));
    }
    if k > d.min(n - 1) {
        return Err(Error::MissingDependency(format!(
            "pca cannot produce {} components from {} points of dimension {}",
            k, n, d
        )));
    }

    let mut rows = to_f64(data);
    let mut mean = vec![0.0; d];
    for row in &rows {
        for (m, x) in mean.iter_mut().zip(row) {
            *m += x;
        }
    }
    for m in mean.iter_mut() {
        *m /= n as f64;
    }
    for row in rows.iter_mut() {
        for (x, m) in row.iter_mut().zip(&mean) {
            *x -= m;
        }
    }

    let total_var: f64 = rows.iter().map(|r| dot(r, r)).sum();
    if total_var < COLLAPSE {
        return Err(Error::MissingDependency("pca input has zero variance".into()));
    }

    // Covariance applied implicitly: C v = Xᵀ (X v) / (n - 1).
    let apply = |v: &[f64]| {
        let xv: Vec<f64> = rows.iter().map(|r| dot(r, v)).collect();
        let mut out = vec![0.0; d];
        for (r, s) in rows.iter().zip(&xv) {
            for (o, x) in out.iter_mut().zip(r) {
                *o += x * s;
            }
        }
        let scale = (n - 1) as f64;
        out.iter_mut().for_each(|o| *o /= scale);
        out
    };
    let components = top_eigenvectors(d, k, apply, &[], seed)
        .ok_or_else(|| Error::MissingDependency("pca eigen solver collapsed".into()))?;

    Ok(rows
        .iter()
        .map(|r| components.iter().map(|c| dot(r, c)).collect())
        .collect())
}

/// Laplacian-eigenmap embedding of `data` into `k` dimensions over a
/// symmetric cosine k-nearest-neighbour graph.
pub fn spectral_embedding(
    data: &[Vec<f32>],
    k: usize,
    neighbors: usize,
    seed: u64,
) -> Result<Vec<Vec<f64>>> {
    let n = data.len();
    if n <= k + 1 {
        return Err(Error::MissingDependency(format!(
            "spectral embedding into {} dims needs more than {} points, got {}",
            k,
            k + 1,
            n
        )));
    }
    let kk = neighbors.clamp(1, n - 1);

    let rows = to_f64(data);
    let norms: Vec<f64> = rows.iter().map(|r| norm(r)).collect();
    let cosine = |i: usize, j: usize| {
        let denom = norms[i] * norms[j];
        if denom < COLLAPSE {
            0.0
        } else {
            dot(&rows[i], &rows[j]) / denom
        }
    };

    // Affinity (1 + cos) / 2 on k-NN edges, symmetrised by max.
    let mut adjacency: Vec<std::collections::BTreeMap<usize, f64>> = vec![Default::default(); n];
    for i in 0..n {
        let mut sims: Vec<(usize, f64)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| (j, cosine(i, j)))
            .collect();
        sims.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        for &(j, s) in sims.iter().take(kk) {
            let w = (1.0 + s) / 2.0;
            if w <= 0.0 {
                continue;
            }
            let e = adjacency[i].entry(j).or_insert(0.0);
            *e = e.max(w);
            let e = adjacency[j].entry(i).or_insert(0.0);
            *e = e.max(w);
        }
    }

    let degree: Vec<f64> = adjacency.iter().map(|row| row.values().sum()).collect();
    if degree.iter().any(|d| *d < COLLAPSE) {
        return Err(Error::MissingDependency(
            "affinity graph has isolated points".into(),
        ));
    }
    let inv_sqrt: Vec<f64> = degree.iter().map(|d| 1.0 / d.sqrt()).collect();

    // I + D^-1/2 W D^-1/2 is PSD; its top eigenvector ∝ sqrt(degree) is trivial.
    let apply = |v: &[f64]| {
        let mut out = v.to_vec();
        for (i, row) in adjacency.iter().enumerate() {
            let mut acc = 0.0;
            for (&j, &w) in row {
                acc += w * inv_sqrt[j] * v[j];
            }
            out[i] += inv_sqrt[i] * acc;
        }
        out
    };
    let mut trivial: Vec<f64> = degree.iter().map(|d| d.sqrt()).collect();
    let tn = norm(&trivial);
    trivial.iter_mut().for_each(|x| *x /= tn);

    let vectors = top_eigenvectors(n, k, apply, &[trivial], seed)
        .ok_or_else(|| Error::MissingDependency("spectral eigen solver collapsed".into()))?;

    let embedding: Vec<Vec<f64>> = (0..n)
        .map(|i| vectors.iter().map(|v| v[i] * inv_sqrt[i]).collect())
        .collect();
    if embedding.iter().flatten().any(|x| !x.is_finite()) {
        return Err(Error::MissingDependency(
            "spectral embedding produced non-finite coordinates".into(),
        ));
    }
    Ok(embedding)
}

/// Rescale each column independently into `[-1, 1]`. Constant columns map
/// to 0.
pub fn normalize_unit_range(points: &mut [Vec<f64>]) {
    let dims = points.first().map(|p| p.len()).unwrap_or(0);
    for d in 0..dims {
        let (lo, hi) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p[d]), hi.max(p[d]))
        });
        let span = hi - lo;
        for p in points.iter_mut() {
            p[d] = if span > COLLAPSE {
                2.0 * (p[d] - lo) / span - 1.0
            } else {
                0.0
            };
        }
    }
}

//! Hierarchical density-based clustering (HDBSCAN).
//!
//! Steps, on Euclidean distance in the reduced space:
//!
//! 1. Core distance of each point: distance to its `min_samples`-th
//!    nearest neighbour, counting the point itself.
//! 2. Minimum spanning tree over mutual reachability
//!    `max(core(a), core(b), d(a, b))` (Prim, O(n²)).
//! 3. Single-linkage hierarchy from the sorted MST edges.
//! 4. Condensed tree: splits where both sides have at least
//!    `min_cluster_size` points create new clusters; smaller sides fall
//!    out as points at `λ = 1 / distance`.
//! 5. Cluster selection by excess of mass or leaves, root excluded.
//!
//! Labels are `0..k` in order of cluster birth; unassigned points get
//! [`NOISE_CLUSTER`].

use crate::config::SelectionMethod;
use crate::error::{Error, Result};
use crate::models::NOISE_CLUSTER;

const MIN_DISTANCE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdbscanParams {
    /// Minimum number of points to form a cluster.
    pub min_cluster_size: usize,
    /// Neighbourhood size for core distances. Must be <= min_cluster_size.
    pub min_samples: usize,
    pub selection: SelectionMethod,
}

impl Default for HdbscanParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 5,
            min_samples: 5,
            selection: SelectionMethod::Eom,
        }
    }
}

impl HdbscanParams {
    #[must_use]
    pub fn with_min_cluster_size(mut self, size: usize) -> Self {
        self.min_cluster_size = size;
        self
    }

    #[must_use]
    pub fn with_min_samples(mut self, samples: usize) -> Self {
        self.min_samples = samples;
        self
    }

    #[must_use]
    pub fn with_selection(mut self, selection: SelectionMethod) -> Self {
        self.selection = selection;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_cluster_size < 2 {
            return Err(Error::Config(format!(
                "min_cluster_size must be >= 2, got {}",
                self.min_cluster_size
            )));
        }
        if self.min_samples < 1 {
            return Err(Error::Config(format!(
                "min_samples must be >= 1, got {}",
                self.min_samples
            )));
        }
        if self.min_samples > self.min_cluster_size {
            return Err(Error::Config(format!(
                "min_samples ({}) must be <= min_cluster_size ({})",
                self.min_samples, self.min_cluster_size
            )));
        }
        Ok(())
    }

    /// Fewer points than `min_cluster_size` can only be noise.
    #[inline]
    pub fn is_viable_for_size(&self, n_points: usize) -> bool {
        n_points >= self.min_cluster_size
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Cluster `points`; returns one label per point.
pub fn hdbscan(points: &[Vec<f64>], params: &HdbscanParams) -> Result<Vec<i64>> {
    params.validate()?;
    let n = points.len();
    if !params.is_viable_for_size(n) {
        return Ok(vec![NOISE_CLUSTER; n]);
    }

    let core = core_distances(points, params.min_samples);
    let mst = mutual_reachability_mst(points, &core);
    let tree = single_linkage(n, mst);
    let condensed = condense(n, &tree, params.min_cluster_size);
    let selected = select_clusters(n, &condensed, params.selection);
    Ok(label_points(n, &condensed, &selected))
}

fn core_distances(points: &[Vec<f64>], min_samples: usize) -> Vec<f64> {
    let n = points.len();
    let kth = min_samples.clamp(1, n) - 1;
    points
        .iter()
        .map(|p| {
            let mut d: Vec<f64> = points.iter().map(|q| euclidean(p, q)).collect();
            let (_, v, _) = d.select_nth_unstable_by(kth, |a, b| a.total_cmp(b));
            *v
        })
        .collect()
}

/// Prim's algorithm on the implicit complete graph.
fn mutual_reachability_mst(points: &[Vec<f64>], core: &[f64]) -> Vec<(usize, usize, f64)> {
    let n = points.len();
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    let mut current = 0;
    in_tree[0] = true;
    for _ in 1..n {
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            let mr = euclidean(&points[current], &points[j])
                .max(core[current])
                .max(core[j]);
            if mr < best[j] {
                best[j] = mr;
                from[j] = current;
            }
        }
        let mut next = usize::MAX;
        let mut next_w = f64::INFINITY;
        for j in 0..n {
            if !in_tree[j] && (next == usize::MAX || best[j] < next_w) {
                next = j;
                next_w = best[j];
            }
        }
        in_tree[next] = true;
        edges.push((from[next], next, next_w));
        current = next;
    }
    edges
}

/// Internal node of the single-linkage tree; node ids `n..2n-1`.
#[derive(Debug, Clone, Copy)]
struct Merge {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }
}

fn single_linkage(n: usize, mut mst: Vec<(usize, usize, f64)>) -> Vec<Merge> {
    mst.sort_by(|a, b| a.2.total_cmp(&b.2));
    let mut uf = UnionFind::new(2 * n);
    let mut sizes = vec![1usize; 2 * n];
    let mut merges = Vec::with_capacity(n.saturating_sub(1));
    for (a, b, w) in mst {
        let ra = uf.find(a);
        let rb = uf.find(b);
        let node = n + merges.len();
        let size = sizes[ra] + sizes[rb];
        merges.push(Merge {
            left: ra,
            right: rb,
            distance: w,
            size,
        });
        uf.parent[ra] = node;
        uf.parent[rb] = node;
        sizes[node] = size;
    }
    merges
}

/// One edge of the condensed tree: `child` (a point `< n` or a cluster
/// label `>= n`) leaves `parent` at `lambda`.
#[derive(Debug, Clone, Copy)]
struct CondensedEdge {
    parent: usize,
    child: usize,
    lambda: f64,
    size: usize,
}

fn condense(n: usize, tree: &[Merge], min_cluster_size: usize) -> Vec<CondensedEdge> {
    let size_of = |node: usize| if node < n { 1 } else { tree[node - n].size };
    let root = n + tree.len() - 1;
    let mut relabel = vec![0usize; 2 * n];
    let mut next_label = n;
    relabel[root] = next_label;
    next_label += 1;

    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node < n {
            continue;
        }
        let merge = tree[node - n];
        let lambda = 1.0 / merge.distance.max(MIN_DISTANCE);
        let parent = relabel[node];
        let (l, r) = (merge.left, merge.right);
        let (ls, rs) = (size_of(l), size_of(r));

        match (ls >= min_cluster_size, rs >= min_cluster_size) {
            (true, true) => {
                for (child, size) in [(l, ls), (r, rs)] {
                    relabel[child] = next_label;
                    out.push(CondensedEdge {
                        parent,
                        child: next_label,
                        lambda,
                        size,
                    });
                    next_label += 1;
                    stack.push(child);
                }
            }
            (false, false) => {
                for child in [l, r] {
                    for p in leaves(n, tree, child) {
                        out.push(CondensedEdge {
                            parent,
                            child: p,
                            lambda,
                            size: 1,
                        });
                    }
                }
            }
            (true, false) | (false, true) => {
                let (keep, drop) = if ls >= min_cluster_size { (l, r) } else { (r, l) };
                relabel[keep] = parent;
                stack.push(keep);
                for p in leaves(n, tree, drop) {
                    out.push(CondensedEdge {
                        parent,
                        child: p,
                        lambda,
                        size: 1,
                    });
                }
            }
        }
    }
    out
}

fn leaves(n: usize, tree: &[Merge], node: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(x) = stack.pop() {
        if x < n {
            out.push(x);
        } else {
            let m = tree[x - n];
            stack.push(m.left);
            stack.push(m.right);
        }
    }
    out
}

/// Labels `>= n` of the selected clusters, in ascending order.
fn select_clusters(n: usize, condensed: &[CondensedEdge], method: SelectionMethod) -> Vec<usize> {
    let root = n;
    let max_label = condensed
        .iter()
        .map(|e| e.parent.max(if e.child >= n { e.child } else { 0 }))
        .max()
        .unwrap_or(root);
    let slots = max_label - n + 1;

    let mut birth = vec![0.0f64; slots];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); slots];
    for e in condensed.iter().filter(|e| e.child >= n) {
        birth[e.child - n] = e.lambda;
        children[e.parent - n].push(e.child);
    }

    let mut stability = vec![0.0f64; slots];
    for e in condensed {
        let b = birth[e.parent - n];
        stability[e.parent - n] += (e.lambda - b) * e.size as f64;
    }

    let mut selected = vec![false; slots];
    match method {
        SelectionMethod::Leaf => {
            for c in (n + 1)..=max_label {
                if children[c - n].is_empty() {
                    selected[c - n] = true;
                }
            }
        }
        SelectionMethod::Eom => {
            // Children always carry larger labels than their parent.
            for c in ((n + 1)..=max_label).rev() {
                let child_sum: f64 = children[c - n].iter().map(|k| stability[k - n]).sum();
                if !children[c - n].is_empty() && child_sum > stability[c - n] {
                    stability[c - n] = child_sum;
                } else {
                    selected[c - n] = true;
                    let mut stack = children[c - n].clone();
                    while let Some(k) = stack.pop() {
                        selected[k - n] = false;
                        stack.extend(children[k - n].iter().copied());
                    }
                }
            }
        }
    }

    (n..=max_label).filter(|c| selected[c - n]).collect()
}

fn label_points(n: usize, condensed: &[CondensedEdge], selected: &[usize]) -> Vec<i64> {
    let mut cluster_parent = std::collections::HashMap::new();
    for e in condensed.iter().filter(|e| e.child >= n) {
        cluster_parent.insert(e.child, e.parent);
    }
    let label_of: std::collections::HashMap<usize, i64> = selected
        .iter()
        .enumerate()
        .map(|(i, c)| (*c, i as i64))
        .collect();

    let mut labels = vec![NOISE_CLUSTER; n];
    for e in condensed.iter().filter(|e| e.child < n) {
        let mut cursor = Some(e.parent);
        while let Some(c) = cursor {
            if let Some(&label) = label_of.get(&c) {
                labels[e.child] = label;
                break;
            }
            cursor = cluster_parent.get(&c).copied();
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tight grid of `count` points around `(cx, cy)`.
    fn blob(cx: f64, cy: f64, count: usize) -> Vec<Vec<f64>> {
        (0..count)
            .map(|i| {
                let dx = (i % 4) as f64 * 0.05;
                let dy = (i / 4) as f64 * 0.05;
                vec![cx + dx, cy + dy]
            })
            .collect()
    }

    #[test]
    fn test_validate() {
        assert!(HdbscanParams::default().validate().is_ok());
        assert!(HdbscanParams::default().with_min_cluster_size(1).validate().is_err());
        assert!(HdbscanParams::default().with_min_samples(0).validate().is_err());
        assert!(HdbscanParams::default().with_min_samples(6).validate().is_err());
    }

    #[test]
    fn test_too_few_points_all_noise() {
        let pts = blob(0.0, 0.0, 4);
        let labels = hdbscan(&pts, &HdbscanParams::default()).unwrap();
        assert_eq!(labels, vec![NOISE_CLUSTER; 4]);
    }

    #[test]
    fn test_three_blobs_and_outlier() {
        let mut pts = blob(0.0, 0.0, 12);
        pts.extend(blob(10.0, 0.0, 12));
        pts.extend(blob(0.0, 10.0, 12));
        pts.push(vec![50.0, 50.0]);

        let labels = hdbscan(&pts, &HdbscanParams::default()).unwrap();
        assert_eq!(labels[36], NOISE_CLUSTER);

        let a = labels[0];
        let b = labels[12];
        let c = labels[24];
        assert!(a >= 0 && b >= 0 && c >= 0);
        assert!(a != b && b != c && a != c);
        assert!(labels[..12].iter().all(|l| *l == a));
        assert!(labels[12..24].iter().all(|l| *l == b));
        assert!(labels[24..36].iter().all(|l| *l == c));

        let mut distinct: Vec<i64> = labels.iter().copied().filter(|l| *l >= 0).collect();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct, vec![0, 1, 2]);
    }

    #[test]
    fn test_leaf_selection_finds_blobs() {
        let mut pts = blob(0.0, 0.0, 8);
        pts.extend(blob(20.0, 20.0, 8));
        let params = HdbscanParams::default()
            .with_min_cluster_size(4)
            .with_min_samples(3)
            .with_selection(SelectionMethod::Leaf);
        let labels = hdbscan(&pts, &params).unwrap();
        assert_ne!(labels[0], labels[8]);
        assert!(labels[0] >= 0 && labels[8] >= 0);
    }

    #[test]
    fn test_duplicate_points_do_not_panic() {
        let pts = vec![vec![1.0, 1.0]; 10];
        let labels = hdbscan(&pts, &HdbscanParams::default()).unwrap();
        assert_eq!(labels.len(), 10);
    }
}

//! Grouping of images the attribute classifier could not place.
//!
//! Embeddings are centered and projected onto their leading principal
//! components, then partitioned with k-means. Every step is deterministic so
//! identical input always yields identical `cluster_NN` folders.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use tracing::{debug, info};

use crate::capability::Embedder;
use crate::models::ClusterLabel;
use crate::utils::fs;
use crate::utils::logging::RunLog;

pub const MAX_COMPONENTS: usize = 5;
pub const MAX_SEARCH_K: usize = 10;
pub const MAX_ITERATIONS: usize = 300;
const POWER_ITERATIONS: usize = 200;
const EPS: f64 = 1e-12;

fn distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

/// Project rows of `data` onto at most `min(5, n - 1, dim)` principal
/// components. Components are taken from the Gram matrix by power iteration
/// with deflation; directions with no variance are dropped.
pub fn reduce(data: &Array2<f64>) -> Array2<f64> {
    let (n, dim) = data.dim();
    if n == 0 {
        return Array2::zeros((0, 0));
    }
    let Some(mean) = data.mean_axis(Axis(0)) else {
        return data.clone();
    };
    let centered = data - &mean;
    let wanted = MAX_COMPONENTS.min(n.saturating_sub(1)).min(dim);
    let mut gram = centered.dot(&centered.t());
    let mut columns: Vec<Array1<f64>> = Vec::with_capacity(wanted);
    let mut leading = 0.0_f64;

    for c in 0..wanted {
        // Deterministic, non-symmetric start so it is unlikely to be orthogonal
        // to the leading eigenvector.
        let mut v = Array1::from_shape_fn(n, |i| 1.0 + ((i + c) % 7) as f64 * 0.1);
        let mut lambda = 0.0;
        for _ in 0..POWER_ITERATIONS {
            let next = gram.dot(&v);
            let norm = next.dot(&next).sqrt();
            if norm < EPS {
                lambda = 0.0;
                break;
            }
            v = next / norm;
            lambda = norm;
        }
        if lambda < EPS * leading.max(1.0) {
            break;
        }
        leading = leading.max(lambda);
        // Score of each row along this component is sqrt(lambda) * v.
        columns.push(&v * lambda.sqrt());
        let outer = v
            .view()
            .insert_axis(Axis(1))
            .dot(&v.view().insert_axis(Axis(0)));
        gram = gram - outer * lambda;
    }

    if columns.is_empty() {
        return Array2::zeros((n, 1));
    }
    let mut out = Array2::zeros((n, columns.len()));
    for (j, col) in columns.iter().enumerate() {
        out.column_mut(j).assign(col);
    }
    out
}

/// Relabel so clusters are numbered by the first item that belongs to them.
pub fn renumber(labels: &[usize]) -> Vec<usize> {
    let mut mapping: Vec<(usize, usize)> = Vec::new();
    labels
        .iter()
        .map(|&l| match mapping.iter().find(|(old, _)| *old == l) {
            Some((_, new)) => *new,
            None => {
                let new = mapping.len();
                mapping.push((l, new));
                new
            }
        })
        .collect()
}

fn nearest(point: ArrayView1<f64>, centers: &Array2<f64>) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (c, center) in centers.outer_iter().enumerate() {
        let d = distance(point, center);
        if d < best_d {
            best_d = d;
            best = c;
        }
    }
    best
}

/// Farthest-point initialization seeded at the item closest to the centroid.
fn initial_centers(points: &Array2<f64>, k: usize) -> Array2<f64> {
    let n = points.nrows();
    let mut chosen: Vec<usize> = Vec::with_capacity(k);
    if let Some(centroid) = points.mean_axis(Axis(0)) {
        chosen.push(nearest(centroid.view(), points));
    } else {
        chosen.push(0);
    }
    while chosen.len() < k {
        let mut far = 0;
        let mut far_d = -1.0;
        for i in 0..n {
            let d = chosen
                .iter()
                .map(|&c| distance(points.row(i), points.row(c)))
                .fold(f64::INFINITY, f64::min);
            if d > far_d {
                far_d = d;
                far = i;
            }
        }
        chosen.push(far);
    }
    points.select(Axis(0), &chosen)
}

/// Lloyd's k-means. Labels are renumbered by first appearance.
pub fn kmeans(points: &Array2<f64>, k: usize) -> Vec<usize> {
    let n = points.nrows();
    if n == 0 {
        return vec![];
    }
    let k = k.clamp(1, n);
    let mut centers = initial_centers(points, k);
    let mut labels: Vec<usize> = points.outer_iter().map(|p| nearest(p, &centers)).collect();

    for _ in 0..MAX_ITERATIONS {
        for c in 0..k {
            let members: Vec<usize> = (0..n).filter(|&i| labels[i] == c).collect();
            // An emptied cluster keeps its previous center.
            if let Some(mean) = points.select(Axis(0), &members).mean_axis(Axis(0)) {
                centers.row_mut(c).assign(&mean);
            }
        }
        let next: Vec<usize> = points.outer_iter().map(|p| nearest(p, &centers)).collect();
        if next == labels {
            break;
        }
        labels = next;
    }
    renumber(&labels)
}

/// Mean silhouette coefficient. Items alone in their cluster score 0.
/// Returns `None` with fewer than two clusters.
pub fn silhouette(points: &Array2<f64>, labels: &[usize]) -> Option<f64> {
    let n = points.nrows();
    let clusters = labels.iter().copied().max().map_or(0, |m| m + 1);
    if n < 2 || clusters < 2 {
        return None;
    }
    let mut total = 0.0;
    for i in 0..n {
        let mut sums = vec![0.0; clusters];
        let mut counts = vec![0usize; clusters];
        for j in 0..n {
            if i != j {
                sums[labels[j]] += distance(points.row(i), points.row(j));
                counts[labels[j]] += 1;
            }
        }
        let own = labels[i];
        if counts[own] == 0 {
            continue;
        }
        let a = sums[own] / counts[own] as f64;
        let b = (0..clusters)
            .filter(|&c| c != own && counts[c] > 0)
            .map(|c| sums[c] / counts[c] as f64)
            .fold(f64::INFINITY, f64::min);
        if !b.is_finite() {
            continue;
        }
        let denom = a.max(b);
        if denom > EPS {
            total += (b - a) / denom;
        }
    }
    Some(total / n as f64)
}

/// Cluster `points`, either into `requested` groups (clamped to `1..=n`) or
/// into the k in `2..=min(10, n)` with the best silhouette. Ties keep the
/// smaller k.
pub fn choose_clusters(points: &Array2<f64>, requested: Option<usize>) -> Vec<usize> {
    let n = points.nrows();
    if n < 2 {
        return vec![0; n];
    }
    if let Some(k) = requested {
        return kmeans(points, k.clamp(1, n));
    }
    let max_k = MAX_SEARCH_K.min(n);
    let mut best_labels = kmeans(points, 2);
    let mut best_score = silhouette(points, &best_labels).unwrap_or(-1.0);
    for k in 3..=max_k {
        let labels = kmeans(points, k);
        let score = silhouette(points, &labels).unwrap_or(-1.0);
        debug!("k={} silhouette={:.4}", k, score);
        if score > best_score {
            best_score = score;
            best_labels = labels;
        }
    }
    best_labels
}

/// Embed the images in `dir` and move each into a `cluster_NN` subfolder.
/// Returns the number of clusters created; fewer than two images are left
/// where they are.
pub fn cluster_dir(dir: &Path, embedder: &dyn Embedder, requested: Option<usize>, log: &RunLog) -> Result<usize> {
    let items = fs::list_pngs(dir)?;
    if items.len() < 2 {
        debug!("{} unclassified image(s), nothing to cluster", items.len());
        return Ok(0);
    }
    let vectors = items
        .iter()
        .map(|item| {
            let img = item.load()?;
            embedder.embed(&img).with_context(|| format!("Failed to embed {}", item.name))
        })
        .collect::<Result<Vec<_>>>()?;
    let dim = vectors[0].len();
    anyhow::ensure!(
        vectors.iter().all(|v| v.len() == dim),
        "embedder returned vectors of differing length"
    );
    let data = Array2::from_shape_fn((vectors.len(), dim), |(i, j)| vectors[i][j] as f64);
    let labels = choose_clusters(&reduce(&data), requested);
    let clusters = labels.iter().copied().max().map_or(0, |m| m + 1);

    for (item, label) in items.iter().zip(&labels) {
        let target = dir.join(ClusterLabel(*label).dir_name());
        std::fs::create_dir_all(&target).with_context(|| format!("Failed to create {:?}", target))?;
        let dst = item.target_in(&target);
        std::fs::rename(&item.path, &dst).with_context(|| format!("Failed to move {:?}", item.path))?;
    }
    info!("Grouped {} unclassified images into {} clusters", items.len(), clusters);
    log.step(&format!("Clustered {} unclassified images into {} groups", items.len(), clusters));
    Ok(clusters)
}

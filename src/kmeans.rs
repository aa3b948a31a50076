//! Spherical k-means used to learn the coarse centroids of the codec.
//!
//! Embeddings are compared by inner product on unit vectors, so every update
//! step renormalizes the centroids (spherical k-means). The procedure is fully
//! deterministic for a given seed: initialization and subsampling draw from a
//! seeded `ChaCha8Rng`, assignment ties go to the lowest centroid id, and the
//! per-cluster sums are accumulated in input order.

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::{argmax, normalize_in_place, normalize_rows};

/// Rows scored against the centroids per matrix multiplication.
const ASSIGN_CHUNK_ROWS: usize = 4096;

/// Configuration for centroid training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansConfig {
    /// Maximum number of refinement iterations (default: 20)
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
    /// Training stops once no centroid moves (L2) by more than this (default: 1e-4)
    #[serde(default = "default_tol")]
    pub tol: f32,
    /// Random seed for initialization and subsampling (default: 42)
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Cap on training points per centroid; larger samples are subsampled.
    /// `None` trains on the whole sample. (default: 256)
    #[serde(default = "default_max_points_per_centroid")]
    pub max_points_per_centroid: Option<usize>,
}

fn default_max_iters() -> usize {
    20
}

fn default_tol() -> f32 {
    1e-4
}

fn default_seed() -> u64 {
    42
}

fn default_max_points_per_centroid() -> Option<usize> {
    Some(256)
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            max_iters: default_max_iters(),
            tol: default_tol(),
            seed: default_seed(),
            max_points_per_centroid: default_max_points_per_centroid(),
        }
    }
}

impl KMeansConfig {
    /// Reject settings that cannot produce a clustering.
    pub fn validate(&self) -> Result<()> {
        if self.max_iters == 0 {
            return Err(Error::Config("max_iters must be at least 1".into()));
        }
        if !self.tol.is_finite() || self.tol < 0.0 {
            return Err(Error::Config(format!(
                "tol must be a non-negative finite number, got {}",
                self.tol
            )));
        }
        if self.max_points_per_centroid == Some(0) {
            return Err(Error::Config(
                "max_points_per_centroid must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone)]
pub struct Clustering {
    /// Unit-norm centroids of shape `[k, dim]`
    pub centroids: Array2<f32>,
    /// Number of refinement iterations performed
    pub iterations: usize,
    /// Whether the movement threshold was reached before `max_iters`
    pub converged: bool,
}

/// Spherical k-means over unit-normalized embeddings.
#[derive(Debug, Clone, Default)]
pub struct SphericalKMeans {
    config: KMeansConfig,
}

impl SphericalKMeans {
    pub fn new(config: KMeansConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KMeansConfig {
        &self.config
    }

    /// Cluster `data` (shape `[N, dim]`) into `k` centroids.
    ///
    /// Fails with `EmptyInput` on an empty sample and with `Config` when `k` is
    /// zero or exceeds the number of sample rows.
    pub fn fit(&self, data: &ArrayView2<f32>, k: usize) -> Result<Clustering> {
        self.config.validate()?;

        let n = data.nrows();
        if n == 0 {
            return Err(Error::EmptyInput("k-means training sample is empty".into()));
        }
        if k == 0 {
            return Err(Error::Config("number of centroids must be at least 1".into()));
        }
        if k > n {
            return Err(Error::Config(format!(
                "number of centroids ({}) exceeds training sample size ({})",
                k, n
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);

        let points = self.subsample(data, k, &mut rng);
        let points = points.view();

        // Initialize from k distinct sample rows
        let mut order: Vec<usize> = (0..points.nrows()).collect();
        order.shuffle(&mut rng);
        let mut centroids = points.select(Axis(0), &order[..k]);
        normalize_rows(&mut centroids);

        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.config.max_iters {
            iterations += 1;

            let assignments = assign_to_centroids(&points, &centroids.view());

            let dim = points.ncols();
            let mut sums = Array2::<f32>::zeros((k, dim));
            let mut counts = vec![0usize; k];
            for (row, &c) in points.axis_iter(Axis(0)).zip(assignments.iter()) {
                let mut sum = sums.row_mut(c);
                sum += &row;
                counts[c] += 1;
            }

            let mut max_shift = 0.0f32;
            let mut empty = 0usize;
            for (c, count) in counts.iter().enumerate() {
                if *count == 0 {
                    empty += 1;
                    continue;
                }
                let mut updated = sums.row(c).to_owned();
                normalize_in_place(updated.view_mut());
                let shift: f32 = (&updated - &centroids.row(c))
                    .mapv(|x| x * x)
                    .sum()
                    .sqrt();
                max_shift = max_shift.max(shift);
                centroids.row_mut(c).assign(&updated);
            }

            if empty > 0 {
                tracing::warn!(
                    iteration = iterations,
                    empty_clusters = empty,
                    "k-means left clusters empty, keeping their previous centroids"
                );
            }
            tracing::debug!(iteration = iterations, max_shift, "k-means iteration");

            if max_shift <= self.config.tol {
                converged = true;
                break;
            }
        }

        Ok(Clustering {
            centroids,
            iterations,
            converged,
        })
    }

    /// Keep at most `k * max_points_per_centroid` rows, chosen at random but
    /// returned in their original order.
    fn subsample(&self, data: &ArrayView2<f32>, k: usize, rng: &mut ChaCha8Rng) -> Array2<f32> {
        let n = data.nrows();
        let cap = self
            .config
            .max_points_per_centroid
            .map(|m| m.saturating_mul(k))
            .unwrap_or(n);

        let mut points = if n > cap {
            let mut indices: Vec<usize> = (0..n).collect();
            indices.shuffle(rng);
            indices.truncate(cap);
            indices.sort_unstable();
            data.select(Axis(0), &indices)
        } else {
            data.to_owned()
        };
        normalize_rows(&mut points);
        points
    }
}

/// Assign each row of `embeddings` to the centroid with maximum inner product.
///
/// Rows are scored in chunks with a matrix multiplication
/// (`[chunk, dim] @ [dim, K]`), then reduced with a parallel argmax.
pub fn assign_to_centroids(embeddings: &ArrayView2<f32>, centroids: &ArrayView2<f32>) -> Vec<usize> {
    let n = embeddings.nrows();
    let mut codes = Vec::with_capacity(n);

    for start in (0..n).step_by(ASSIGN_CHUNK_ROWS) {
        let end = (start + ASSIGN_CHUNK_ROWS).min(n);
        let scores = embeddings.slice(s![start..end, ..]).dot(&centroids.t());
        let chunk: Vec<usize> = scores
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(argmax)
            .collect();
        codes.extend(chunk);
    }

    codes
}

/// Number of centroids for a corpus of `total_tokens` token embeddings:
/// `2^floor(log2(16 * sqrt(total_tokens)))`.
pub fn estimate_num_centroids(total_tokens: usize) -> usize {
    if total_tokens == 0 {
        return 0;
    }
    let target = 16.0 * (total_tokens as f64).sqrt();
    2usize.pow(target.log2().floor() as u32)
}

/// Number of documents drawn for centroid training:
/// `min(1 + 16 * sqrt(120 * num_documents), num_documents)`.
pub fn estimate_sample_documents(num_documents: usize) -> usize {
    ((1.0 + 16.0 * (120.0 * num_documents as f64).sqrt()) as usize).min(num_documents)
}

/// Draw a training sample of token embeddings from a corpus.
///
/// Picks `n_documents` documents with a seeded shuffle and concatenates their
/// token embeddings in corpus order.
pub fn sample_corpus(documents: &[Array2<f32>], n_documents: usize, seed: u64) -> Array2<f32> {
    let dim = documents.first().map(|d| d.ncols()).unwrap_or(0);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..documents.len()).collect();
    indices.shuffle(&mut rng);
    indices.truncate(n_documents.min(documents.len()));
    indices.sort_unstable();

    let total: usize = indices.iter().map(|&i| documents[i].nrows()).sum();
    let mut sample = Array2::<f32>::zeros((total, dim));
    let mut offset = 0;
    for &i in &indices {
        let doc = &documents[i];
        sample
            .slice_mut(s![offset..offset + doc.nrows(), ..])
            .assign(doc);
        offset += doc.nrows();
    }
    sample
}

/// Mean inner product between each row and its assigned centroid.
pub fn mean_assignment_similarity(data: &ArrayView2<f32>, centroids: &ArrayView2<f32>) -> f32 {
    if data.nrows() == 0 {
        return 0.0;
    }
    let codes = assign_to_centroids(data, centroids);
    let sims: Array1<f32> = data
        .axis_iter(Axis(0))
        .zip(codes.iter())
        .map(|(row, &c)| row.dot(&centroids.row(c)))
        .collect();
    sims.mean().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    fn unit_random(n: usize, dim: usize) -> Array2<f32> {
        let mut data: Array2<f32> = Array2::random((n, dim), Uniform::new(-1.0f32, 1.0));
        normalize_rows(&mut data);
        data
    }

    #[test]
    fn test_fit_produces_unit_centroids() {
        let data = unit_random(400, 16);
        let kmeans = SphericalKMeans::new(KMeansConfig::default());
        let clustering = kmeans.fit(&data.view(), 8).unwrap();

        assert_eq!(clustering.centroids.dim(), (8, 16));
        assert!(clustering.iterations >= 1);
        for row in clustering.centroids.axis_iter(Axis(0)) {
            let norm = row.dot(&row).sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "Centroid not normalized: {}", norm);
        }
    }

    #[test]
    fn test_fit_is_deterministic_for_seed() {
        let data = unit_random(300, 8);
        let kmeans = SphericalKMeans::new(KMeansConfig {
            seed: 7,
            ..Default::default()
        });
        let a = kmeans.fit(&data.view(), 5).unwrap();
        let b = kmeans.fit(&data.view(), 5).unwrap();
        assert_eq!(a.centroids, b.centroids);
        assert_eq!(a.iterations, b.iterations);
    }

    #[test]
    fn test_fit_separates_obvious_clusters() {
        // Two tight groups around e0 and e1
        let mut rows = Vec::new();
        for i in 0..20 {
            let eps = i as f32 * 0.001;
            rows.extend_from_slice(&[1.0, eps, 0.0, 0.0]);
            rows.extend_from_slice(&[eps, 1.0, 0.0, 0.0]);
        }
        let mut data = Array2::from_shape_vec((40, 4), rows).unwrap();
        normalize_rows(&mut data);

        let clustering = SphericalKMeans::default().fit(&data.view(), 2).unwrap();
        assert!(clustering.converged);
        let sim = mean_assignment_similarity(&data.view(), &clustering.centroids.view());
        assert!(sim > 0.99, "mean similarity too low: {}", sim);
    }

    #[test]
    fn test_fit_rejects_bad_inputs() {
        let empty = Array2::<f32>::zeros((0, 4));
        let kmeans = SphericalKMeans::default();
        assert!(matches!(
            kmeans.fit(&empty.view(), 1),
            Err(Error::EmptyInput(_))
        ));

        let data = unit_random(5, 4);
        assert!(matches!(kmeans.fit(&data.view(), 6), Err(Error::Config(_))));
        assert!(matches!(kmeans.fit(&data.view(), 0), Err(Error::Config(_))));
    }

    #[test]
    fn test_subsampling_respects_cap() {
        let data = unit_random(1000, 8);
        let kmeans = SphericalKMeans::new(KMeansConfig {
            max_points_per_centroid: Some(10),
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let points = kmeans.subsample(&data.view(), 4, &mut rng);
        assert_eq!(points.nrows(), 40);
    }

    #[test]
    fn test_assign_to_centroids() {
        let centroids = Array2::from_shape_vec(
            (3, 4),
            vec![
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ],
        )
        .unwrap();
        let embeddings = Array2::from_shape_vec(
            (2, 4),
            vec![0.9, 0.1, 0.0, 0.0, 0.0, 0.0, 0.95, 0.05],
        )
        .unwrap();

        let codes = assign_to_centroids(&embeddings.view(), &centroids.view());
        assert_eq!(codes, vec![0, 2]);
    }

    #[test]
    fn test_estimates() {
        assert_eq!(estimate_num_centroids(0), 0);
        // 16 * sqrt(10_000) = 1600 -> 1024
        assert_eq!(estimate_num_centroids(10_000), 1024);
        assert!(estimate_num_centroids(1_000_000) > estimate_num_centroids(10_000));

        assert_eq!(estimate_sample_documents(10), 10);
        assert!(estimate_sample_documents(1_000_000) < 1_000_000);
    }

    #[test]
    fn test_sample_corpus_is_deterministic() {
        let docs: Vec<Array2<f32>> = (0..30).map(|_| unit_random(5, 4)).collect();
        let a = sample_corpus(&docs, 10, 3);
        let b = sample_corpus(&docs, 10, 3);
        assert_eq!(a.nrows(), 50);
        assert_eq!(a, b);
    }
}

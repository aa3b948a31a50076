//! Residual codec: the vector quantizer shared by index building and search.
//!
//! A vector is approximated by its nearest centroid (maximum inner product)
//! plus a residual in which every dimension is scalar-quantized into one of
//! `2^nbits` buckets. Bucket boundaries and reconstruction values are fit on
//! the residuals of the training sample (empirical quantiles), so the codes
//! spend their resolution where residual values actually fall.
//!
//! Codes are packed MSB-first into a contiguous bit stream of
//! `ceil(dim * nbits / 8)` bytes per vector.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::kmeans::{assign_to_centroids, KMeansConfig, SphericalKMeans};
use crate::utils::{argmax, normalize_in_place, normalize_rows, quantiles};

/// Largest supported residual width.
pub const MAX_NBITS: usize = 8;

/// A vector compressed against the codec: nearest centroid plus packed
/// residual buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizedVector {
    /// Id of the nearest centroid, in `[0, K)`
    pub centroid_id: u32,
    /// Packed residual buckets, `packed_dim()` bytes
    pub residual: Vec<u8>,
}

/// The trained quantizer state.
///
/// Immutable after construction and cheap to share behind an `Arc`; both
/// the index builder and the search path take it as an explicit dependency.
#[derive(Debug, Clone)]
pub struct ResidualCodec {
    /// Number of bits per residual dimension (1..=8)
    nbits: usize,
    /// Unit-norm coarse centroids of shape `[num_centroids, dim]`
    centroids: Array2<f32>,
    /// `2^nbits - 1` ascending boundaries; bucket `b` holds values in
    /// `(cutoffs[b-1], cutoffs[b]]`
    bucket_cutoffs: Array1<f32>,
    /// `2^nbits` reconstruction values, one per bucket
    bucket_weights: Array1<f32>,
}

impl ResidualCodec {
    /// Creates a codec from already-fit parameters.
    ///
    /// # Arguments
    ///
    /// * `nbits` - Bits per residual dimension, between 1 and 8
    /// * `centroids` - Coarse centroids of shape `[num_centroids, dim]`
    /// * `bucket_cutoffs` - `2^nbits - 1` ascending bucket boundaries
    /// * `bucket_weights` - `2^nbits` reconstruction values
    pub fn new(
        nbits: usize,
        centroids: Array2<f32>,
        bucket_cutoffs: Array1<f32>,
        bucket_weights: Array1<f32>,
    ) -> Result<Self> {
        validate_nbits(nbits)?;

        if centroids.nrows() == 0 || centroids.ncols() == 0 {
            return Err(Error::EmptyInput("codec requires at least one centroid".into()));
        }
        let n_buckets = 1usize << nbits;
        if bucket_cutoffs.len() != n_buckets - 1 {
            return Err(Error::Config(format!(
                "expected {} bucket cutoffs for nbits={}, got {}",
                n_buckets - 1,
                nbits,
                bucket_cutoffs.len()
            )));
        }
        if bucket_weights.len() != n_buckets {
            return Err(Error::Config(format!(
                "expected {} bucket weights for nbits={}, got {}",
                n_buckets,
                nbits,
                bucket_weights.len()
            )));
        }
        if bucket_cutoffs
            .windows(2)
            .into_iter()
            .any(|w| w[0] > w[1])
        {
            return Err(Error::Config("bucket cutoffs must be ascending".into()));
        }

        Ok(Self {
            nbits,
            centroids,
            bucket_cutoffs,
            bucket_weights,
        })
    }

    /// Train a codec on a sample of token embeddings.
    ///
    /// Clusters the (normalized) sample into `k` centroids with spherical
    /// k-means, then fits the residual buckets on the sample's residuals:
    /// cutoffs at quantiles `i / 2^nbits` and reconstruction values at the
    /// bucket midpoints `(i + 0.5) / 2^nbits`.
    pub fn train(
        sample: &ArrayView2<f32>,
        k: usize,
        nbits: usize,
        kmeans: &KMeansConfig,
    ) -> Result<Self> {
        validate_nbits(nbits)?;

        let clustering = SphericalKMeans::new(kmeans.clone()).fit(sample, k)?;
        tracing::info!(
            k,
            nbits,
            sample_size = sample.nrows(),
            iterations = clustering.iterations,
            converged = clustering.converged,
            "trained centroids"
        );
        let centroids = clustering.centroids;

        let mut residuals = sample.to_owned();
        normalize_rows(&mut residuals);
        let codes = assign_to_centroids(&residuals.view(), &centroids.view());
        for (mut row, &c) in residuals.axis_iter_mut(Axis(0)).zip(codes.iter()) {
            row -= &centroids.row(c);
        }

        let n_buckets = 1usize << nbits;
        let cutoff_qs: Vec<f64> = (1..n_buckets)
            .map(|i| i as f64 / n_buckets as f64)
            .collect();
        let weight_qs: Vec<f64> = (0..n_buckets)
            .map(|i| (i as f64 + 0.5) / n_buckets as f64)
            .collect();

        let flat: Vec<f32> = residuals.iter().copied().collect();
        let bucket_cutoffs = Array1::from_vec(quantiles(&flat, &cutoff_qs));
        let bucket_weights = Array1::from_vec(quantiles(&flat, &weight_qs));

        Self::new(nbits, centroids, bucket_cutoffs, bucket_weights)
    }

    /// Returns the embedding dimension
    pub fn embedding_dim(&self) -> usize {
        self.centroids.ncols()
    }

    /// Returns the number of centroids
    pub fn num_centroids(&self) -> usize {
        self.centroids.nrows()
    }

    /// Returns the residual bit-width
    pub fn nbits(&self) -> usize {
        self.nbits
    }

    /// Bytes used by one packed residual
    pub fn packed_dim(&self) -> usize {
        (self.embedding_dim() * self.nbits).div_ceil(8)
    }

    pub fn centroids(&self) -> ArrayView2<'_, f32> {
        self.centroids.view()
    }

    pub fn bucket_cutoffs(&self) -> ArrayView1<'_, f32> {
        self.bucket_cutoffs.view()
    }

    pub fn bucket_weights(&self) -> ArrayView1<'_, f32> {
        self.bucket_weights.view()
    }

    /// Id of the centroid with maximum inner product against `vector`.
    pub fn nearest_centroid(&self, vector: &ArrayView1<f32>) -> Result<usize> {
        Error::check_dim(self.embedding_dim(), vector.len())?;
        Ok(argmax(self.centroids.dot(vector).view()))
    }

    /// Compress embeddings into centroid codes using batched nearest-centroid search.
    ///
    /// # Arguments
    ///
    /// * `embeddings` - Embeddings of shape `[N, dim]`
    ///
    /// # Returns
    ///
    /// One centroid id per row
    pub fn compress_into_codes(&self, embeddings: &ArrayView2<f32>) -> Result<Vec<u32>> {
        Error::check_dim(self.embedding_dim(), embeddings.ncols())?;
        Ok(assign_to_centroids(embeddings, &self.centroids.view())
            .into_iter()
            .map(|c| c as u32)
            .collect())
    }

    /// Quantize a single vector.
    pub fn quantize(&self, vector: &ArrayView1<f32>) -> Result<QuantizedVector> {
        let centroid_id = self.nearest_centroid(vector)?;
        let mut residual = vec![0u8; self.packed_dim()];
        self.encode_residual(vector, centroid_id, &mut residual);
        Ok(QuantizedVector {
            centroid_id: centroid_id as u32,
            residual,
        })
    }

    /// Quantize a batch of vectors.
    ///
    /// # Returns
    ///
    /// Centroid codes of length `N` and packed residuals of shape
    /// `[N, packed_dim]`.
    pub fn quantize_batch(&self, embeddings: &ArrayView2<f32>) -> Result<(Vec<u32>, Array2<u8>)> {
        let codes = self.compress_into_codes(embeddings)?;
        let mut packed = Array2::<u8>::zeros((embeddings.nrows(), self.packed_dim()));

        packed
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(embeddings.axis_iter(Axis(0)).into_par_iter())
            .zip(codes.par_iter())
            .for_each(|((mut out, row), &code)| {
                // rows of a standard-layout Array2 are contiguous
                if let Some(out) = out.as_slice_mut() {
                    self.encode_residual(&row, code as usize, out);
                }
            });

        Ok((codes, packed))
    }

    /// Bucketize `vector - centroids[centroid_id]` and pack the buckets into `out`.
    fn encode_residual(&self, vector: &ArrayView1<f32>, centroid_id: usize, out: &mut [u8]) {
        let cutoffs = self.bucket_cutoffs.as_slice().unwrap_or(&[]);
        let centroid = self.centroids.row(centroid_id);
        out.fill(0);

        for (j, (&v, &c)) in vector.iter().zip(centroid.iter()).enumerate() {
            let residual = v - c;
            let bucket = cutoffs.partition_point(|&cut| cut < residual);
            write_bits(out, j * self.nbits, self.nbits, bucket as u8);
        }
    }

    /// Decode a quantized vector back to an approximate unit vector.
    pub fn decode(&self, quantized: &QuantizedVector) -> Result<Array1<f32>> {
        let mut out = Array1::<f32>::zeros(self.embedding_dim());
        self.decode_into(quantized.centroid_id as usize, &quantized.residual, out.view_mut())?;
        Ok(out)
    }

    /// Decode `(centroid_id, packed residual)` into `out` (length `dim`).
    ///
    /// The reconstruction `centroid + bucket_weights[bucket]` is normalized
    /// to unit length, matching the space the embeddings live in.
    pub fn decode_into(
        &self,
        centroid_id: usize,
        residual: &[u8],
        mut out: ArrayViewMut1<f32>,
    ) -> Result<()> {
        if centroid_id >= self.num_centroids() {
            return Err(Error::Config(format!(
                "centroid id {} out of range (K = {})",
                centroid_id,
                self.num_centroids()
            )));
        }
        if residual.len() != self.packed_dim() {
            return Err(Error::DimensionMismatch {
                expected: self.packed_dim(),
                actual: residual.len(),
            });
        }
        Error::check_dim(self.embedding_dim(), out.len())?;

        let centroid = self.centroids.row(centroid_id);
        for (j, (o, &c)) in out.iter_mut().zip(centroid.iter()).enumerate() {
            let bucket = read_bits(residual, j * self.nbits, self.nbits) as usize;
            *o = c + self.bucket_weights[bucket];
        }
        normalize_in_place(out);
        Ok(())
    }

    /// Decompress a batch of codes and packed residuals.
    ///
    /// # Returns
    ///
    /// Reconstructed unit vectors of shape `[N, dim]`
    pub fn decompress(&self, codes: &[u32], packed: &ArrayView2<u8>) -> Result<Array2<f32>> {
        if codes.len() != packed.nrows() {
            return Err(Error::DimensionMismatch {
                expected: codes.len(),
                actual: packed.nrows(),
            });
        }

        let mut output = Array2::<f32>::zeros((codes.len(), self.embedding_dim()));
        for ((out, code), row) in output
            .axis_iter_mut(Axis(0))
            .zip(codes.iter())
            .zip(packed.axis_iter(Axis(0)))
        {
            let row = row.to_vec();
            self.decode_into(*code as usize, &row, out)?;
        }
        Ok(output)
    }

    /// Write the codec tensors into an index directory.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        self.centroids
            .write_npy(BufWriter::new(File::create(dir.join("centroids.npy"))?))?;
        self.bucket_cutoffs
            .write_npy(BufWriter::new(File::create(dir.join("bucket_cutoffs.npy"))?))?;
        self.bucket_weights
            .write_npy(BufWriter::new(File::create(dir.join("bucket_weights.npy"))?))?;
        Ok(())
    }

    /// Load codec tensors from an index directory.
    ///
    /// `nbits` comes from the index metadata; mismatching tensor shapes are
    /// reported as index corruption.
    pub fn load_from_dir(dir: &Path, nbits: usize) -> Result<Self> {
        let centroids = Array2::<f32>::read_npy(open(dir, "centroids.npy")?)?;
        let bucket_cutoffs = Array1::<f32>::read_npy(open(dir, "bucket_cutoffs.npy")?)?;
        let bucket_weights = Array1::<f32>::read_npy(open(dir, "bucket_weights.npy")?)?;

        Self::new(nbits, centroids, bucket_cutoffs, bucket_weights)
            .map_err(|e| Error::IndexCorruption(format!("invalid codec tensors: {}", e)))
    }
}

fn open(dir: &Path, name: &str) -> Result<File> {
    File::open(dir.join(name))
        .map_err(|e| Error::IndexLoad(format!("Failed to open {}: {}", name, e)))
}

fn validate_nbits(nbits: usize) -> Result<()> {
    if nbits == 0 || nbits > MAX_NBITS {
        return Err(Error::Config(format!(
            "nbits must be between 1 and {}, got {}",
            MAX_NBITS, nbits
        )));
    }
    Ok(())
}

/// Write the low `nbits` of `value` at bit offset `bit` (MSB-first).
fn write_bits(out: &mut [u8], bit: usize, nbits: usize, value: u8) {
    for b in 0..nbits {
        let bit_value = (value >> (nbits - 1 - b)) & 1;
        let pos = bit + b;
        out[pos / 8] |= bit_value << (7 - pos % 8);
    }
}

/// Read `nbits` bits starting at bit offset `bit` (MSB-first).
fn read_bits(data: &[u8], bit: usize, nbits: usize) -> u8 {
    let byte = bit / 8;
    let hi = data[byte] as u16;
    let lo = data.get(byte + 1).copied().unwrap_or(0) as u16;
    let window = (hi << 8) | lo;
    let shift = 16 - (bit % 8) - nbits;
    ((window >> shift) & ((1u16 << nbits) - 1)) as u8
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

    fn axis_codec(nbits: usize) -> ResidualCodec {
        let centroids = Array2::from_shape_vec(
            (3, 4),
            vec![
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ],
        )
        .unwrap();
        let n = 1usize << nbits;
        let cutoffs: Vec<f32> = (1..n).map(|i| (i as f32 / n as f32 - 0.5) * 2.0).collect();
        let weights: Vec<f32> = (0..n)
            .map(|i| ((i as f32 + 0.5) / n as f32 - 0.5) * 2.0)
            .collect();
        ResidualCodec::new(
            nbits,
            centroids,
            Array1::from_vec(cutoffs),
            Array1::from_vec(weights),
        )
        .unwrap()
    }

    #[test]
    fn test_codec_creation() {
        let codec = axis_codec(2);
        assert_eq!(codec.nbits(), 2);
        assert_eq!(codec.embedding_dim(), 4);
        assert_eq!(codec.num_centroids(), 3);
        assert_eq!(codec.packed_dim(), 1);
    }

    #[test]
    fn test_codec_rejects_bad_parameters() {
        let centroids = Array2::<f32>::eye(4);
        let err = ResidualCodec::new(
            0,
            centroids.clone(),
            Array1::zeros(0),
            Array1::zeros(1),
        );
        assert!(matches!(err, Err(Error::Config(_))));

        let err = ResidualCodec::new(
            2,
            centroids.clone(),
            Array1::from_vec(vec![0.0, 1.0]),
            Array1::zeros(4),
        );
        assert!(matches!(err, Err(Error::Config(_))));

        let err = ResidualCodec::new(
            1,
            centroids,
            Array1::from_vec(vec![0.0]),
            Array1::zeros(2),
        );
        assert!(err.is_ok());
    }

    #[test]
    fn test_bit_packing_roundtrip_for_every_width() {
        for nbits in 1..=MAX_NBITS {
            let dim = 13;
            let mut buf = vec![0u8; (dim * nbits).div_ceil(8)];
            let values: Vec<u8> = (0..dim).map(|j| (j * 7 % (1 << nbits)) as u8).collect();
            for (j, &v) in values.iter().enumerate() {
                write_bits(&mut buf, j * nbits, nbits, v);
            }
            for (j, &v) in values.iter().enumerate() {
                assert_eq!(read_bits(&buf, j * nbits, nbits), v, "nbits={} j={}", nbits, j);
            }
        }
    }

    #[test]
    fn test_quantize_picks_nearest_centroid() {
        let codec = axis_codec(2);
        let v = Array1::from_vec(vec![0.0f32, 0.0, 0.95, 0.05]);
        let q = codec.quantize(&v.view()).unwrap();
        assert_eq!(q.centroid_id, 2);
        assert_eq!(q.residual.len(), 1);
    }

    #[test]
    fn test_quantize_dimension_mismatch() {
        let codec = axis_codec(2);
        let v = Array1::from_vec(vec![1.0f32, 0.0, 0.0]);
        assert!(matches!(
            codec.quantize(&v.view()),
            Err(Error::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_batch_and_single_quantization_agree() {
        let sample = unit_random(200, 16);
        let codec = ResidualCodec::train(&sample.view(), 8, 2, &KMeansConfig::default()).unwrap();

        let data = unit_random(20, 16);
        let (codes, packed) = codec.quantize_batch(&data.view()).unwrap();
        for (i, row) in data.axis_iter(Axis(0)).enumerate() {
            let q = codec.quantize(&row).unwrap();
            assert_eq!(q.centroid_id, codes[i]);
            assert_eq!(q.residual.as_slice(), packed.row(i).as_slice().unwrap());
        }

        let batch = codec.decompress(&codes, &packed.view()).unwrap();
        let single = codec
            .decode(&QuantizedVector {
                centroid_id: codes[3],
                residual: packed.row(3).to_vec(),
            })
            .unwrap();
        assert_eq!(batch.row(3), single);
    }

    #[test]
    fn test_train_fits_ordered_buckets() {
        let sample = unit_random(300, 32);
        let codec = ResidualCodec::train(&sample.view(), 16, 4, &KMeansConfig::default()).unwrap();
        assert_eq!(codec.num_centroids(), 16);
        assert_eq!(codec.bucket_cutoffs().len(), 15);
        assert_eq!(codec.bucket_weights().len(), 16);
        let w = codec.bucket_weights();
        assert!(w.windows(2).into_iter().all(|p| p[0] <= p[1]));
    }

    #[test]
    fn test_decode_is_similar_to_original() {
        let sample = unit_random(1000, 32);
        for (nbits, min_mean) in [(2usize, 0.85f32), (4, 0.95)] {
            let codec =
                ResidualCodec::train(&sample.view(), 16, nbits, &KMeansConfig::default()).unwrap();
            let mut total = 0.0;
            for row in sample.axis_iter(Axis(0)).take(200) {
                let decoded = codec.decode(&codec.quantize(&row).unwrap()).unwrap();
                let sim = decoded.dot(&row);
                assert!(sim > 0.5, "nbits={} similarity {}", nbits, sim);
                total += sim;
            }
            let mean = total / 200.0;
            assert!(mean > min_mean, "nbits={} mean similarity {}", nbits, mean);
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let sample = unit_random(100, 8);
        let codec = ResidualCodec::train(&sample.view(), 4, 2, &KMeansConfig::default()).unwrap();
        codec.save_to_dir(dir.path()).unwrap();

        let loaded = ResidualCodec::load_from_dir(dir.path(), 2).unwrap();
        assert_eq!(loaded.centroids(), codec.centroids());
        assert_eq!(loaded.bucket_weights(), codec.bucket_weights());

        assert!(matches!(
            ResidualCodec::load_from_dir(dir.path(), 4),
            Err(Error::IndexCorruption(_))
        ));
    }
}

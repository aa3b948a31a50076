//! Index construction: quantize every document token and lay out the
//! inverted postings.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use crate::codec::{ResidualCodec, MAX_NBITS};
use crate::error::{Error, Result};
use crate::index::{IndexStore, Metadata, FORMAT_VERSION};
use crate::kmeans::{estimate_num_centroids, estimate_sample_documents, sample_corpus, KMeansConfig};

/// Configuration for index creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Number of bits per residual dimension (default: 4)
    #[serde(default = "default_nbits")]
    pub nbits: usize,
    /// Number of centroids (K). If None, uses
    /// `2^floor(log2(16 * sqrt(estimated_total_tokens)))`, capped at the
    /// training sample size.
    #[serde(default)]
    pub num_centroids: Option<usize>,
    /// Centroid training settings
    #[serde(default)]
    pub kmeans: KMeansConfig,
    /// Number of documents sampled for centroid training.
    /// If None, uses `min(1 + 16 * sqrt(120 * num_documents), num_documents)`.
    #[serde(default)]
    pub n_sample_documents: Option<usize>,
    /// Documents quantized per batch (default: 10_000)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Show a progress bar while quantizing
    #[serde(default)]
    pub show_progress: bool,
}

fn default_nbits() -> usize {
    4
}

fn default_batch_size() -> usize {
    10_000
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            nbits: default_nbits(),
            num_centroids: None,
            kmeans: KMeansConfig::default(),
            n_sample_documents: None,
            batch_size: default_batch_size(),
            show_progress: false,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nbits == 0 || self.nbits > MAX_NBITS {
            return Err(Error::Config(format!(
                "nbits must be between 1 and {}, got {}",
                MAX_NBITS, self.nbits
            )));
        }
        if self.num_centroids == Some(0) {
            return Err(Error::Config("num_centroids must be at least 1".into()));
        }
        if self.n_sample_documents == Some(0) {
            return Err(Error::Config("n_sample_documents must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        self.kmeans.validate()
    }

    /// Read a configuration from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let config: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        config.validate()?;
        Ok(config)
    }
}

/// Builds an [`IndexStore`] from a corpus with a trained codec.
///
/// Document ids are assigned in ingestion order: `corpus[i]` becomes
/// document `i`.
pub struct IndexBuilder {
    codec: Arc<ResidualCodec>,
    config: IndexConfig,
}

impl IndexBuilder {
    /// Create a builder around an already trained codec.
    ///
    /// `config.nbits` must match the codec's bit-width.
    pub fn new(codec: Arc<ResidualCodec>, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        if config.nbits != codec.nbits() {
            return Err(Error::Config(format!(
                "config nbits ({}) differs from codec nbits ({})",
                config.nbits,
                codec.nbits()
            )));
        }
        if let Some(k) = config.num_centroids {
            if k != codec.num_centroids() {
                return Err(Error::Config(format!(
                    "config num_centroids ({}) differs from codec ({})",
                    k,
                    codec.num_centroids()
                )));
            }
        }
        Ok(Self { codec, config })
    }

    /// Train a codec on a sample of the corpus and return a builder for it.
    ///
    /// 1. Samples documents with a seeded shuffle
    /// 2. Picks K (explicit, or the token-count heuristic)
    /// 3. Trains centroids and residual buckets on the sampled tokens
    pub fn train(corpus: &[Array2<f32>], config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let dim = validate_corpus(corpus, None)?;

        let num_documents = corpus.len();
        let n_sample = config
            .n_sample_documents
            .unwrap_or_else(|| estimate_sample_documents(num_documents))
            .min(num_documents);
        let sample = sample_corpus(corpus, n_sample, config.kmeans.seed);
        debug_assert_eq!(sample.ncols(), dim);

        let k = match config.num_centroids {
            Some(k) => k,
            None => {
                let avg_tokens = sample.nrows() as f64 / n_sample as f64;
                let estimated_total = (avg_tokens * num_documents as f64) as usize;
                estimate_num_centroids(estimated_total).clamp(1, sample.nrows())
            }
        };

        let codec = ResidualCodec::train(&sample.view(), k, config.nbits, &config.kmeans)?;
        let config = IndexConfig {
            num_centroids: Some(k),
            ..config
        };
        Self::new(Arc::new(codec), config)
    }

    pub fn codec(&self) -> &Arc<ResidualCodec> {
        &self.codec
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Quantize every token of `corpus` and assemble the index in memory.
    ///
    /// Fails on an empty corpus, an empty document, or embeddings whose
    /// width differs from the codec. Nothing is produced on failure.
    pub fn build(&self, corpus: &[Array2<f32>]) -> Result<IndexStore> {
        let dim = validate_corpus(corpus, Some(self.codec.embedding_dim()))?;
        if corpus.len() > u32::MAX as usize {
            return Err(Error::Config(format!(
                "corpus of {} documents exceeds the u32 document id space",
                corpus.len()
            )));
        }
        if let Some((doc, d)) = corpus
            .iter()
            .enumerate()
            .find(|(_, d)| d.nrows() > u32::MAX as usize)
        {
            return Err(Error::Config(format!(
                "document {} has {} tokens, more than a u32 position can address",
                doc,
                d.nrows()
            )));
        }

        let num_documents = corpus.len();
        let doc_lengths: Vec<usize> = corpus.iter().map(|d| d.nrows()).collect();
        let num_tokens: usize = doc_lengths.iter().sum();
        let num_centroids = self.codec.num_centroids();
        let packed_dim = self.codec.packed_dim();

        tracing::info!(
            documents = num_documents,
            tokens = num_tokens,
            centroids = num_centroids,
            nbits = self.codec.nbits(),
            "building index"
        );

        // Quantize in document-order batches
        let mut token_codes: Vec<u32> = Vec::with_capacity(num_tokens);
        let mut token_residuals: Vec<u8> = Vec::with_capacity(num_tokens * packed_dim);

        let n_chunks = num_documents.div_ceil(self.config.batch_size);
        let progress = self.config.show_progress.then(|| {
            let bar = indicatif::ProgressBar::new(n_chunks as u64);
            bar.set_message("Quantizing documents...");
            bar
        });

        for (chunk_idx, chunk) in corpus.chunks(self.config.batch_size).enumerate() {
            let chunk_tokens: usize = chunk.iter().map(|d| d.nrows()).sum();
            let batch = concat_documents(chunk, chunk_tokens, dim);

            let (codes, packed) = self.codec.quantize_batch(&batch.view())?;
            token_codes.extend_from_slice(&codes);
            token_residuals.extend(packed.iter().copied());

            tracing::debug!(chunk = chunk_idx, tokens = chunk_tokens, "quantized chunk");
            if let Some(bar) = &progress {
                bar.inc(1);
            }
        }
        if let Some(bar) = progress {
            bar.finish();
        }

        // Counting sort of tokens by centroid; walking tokens in document
        // order keeps each block sorted by (document, position).
        let mut ivf_offsets = vec![0usize; num_centroids + 1];
        for &c in &token_codes {
            ivf_offsets[c as usize + 1] += 1;
        }
        for c in 0..num_centroids {
            ivf_offsets[c + 1] += ivf_offsets[c];
        }

        let mut cursor = ivf_offsets[..num_centroids].to_vec();
        let mut ivf_doc_ids = vec![0u32; num_tokens];
        let mut ivf_positions = vec![0u32; num_tokens];
        let mut ivf_residuals = vec![0u8; num_tokens * packed_dim];

        let mut token = 0usize;
        for (doc, &len) in doc_lengths.iter().enumerate() {
            for pos in 0..len {
                let c = token_codes[token] as usize;
                let slot = cursor[c];
                cursor[c] += 1;

                ivf_doc_ids[slot] = doc as u32;
                ivf_positions[slot] = pos as u32;
                ivf_residuals[slot * packed_dim..(slot + 1) * packed_dim]
                    .copy_from_slice(&token_residuals[token * packed_dim..(token + 1) * packed_dim]);
                token += 1;
            }
        }

        let used = (0..num_centroids)
            .filter(|&c| ivf_offsets[c + 1] > ivf_offsets[c])
            .count();
        tracing::info!(
            non_empty_postings = used,
            centroids = num_centroids,
            "built inverted postings"
        );

        let metadata = Metadata {
            format_version: FORMAT_VERSION,
            nbits: self.codec.nbits(),
            num_partitions: num_centroids,
            embedding_dim: dim,
            num_embeddings: num_tokens,
            num_documents,
            avg_doclen: num_tokens as f64 / num_documents as f64,
            build_config: self.config.clone(),
        };

        IndexStore::from_parts(
            metadata,
            Arc::clone(&self.codec),
            ivf_offsets,
            ivf_doc_ids,
            ivf_positions,
            ivf_residuals,
            doc_lengths,
        )
    }

    /// Build the index and publish it under `root`.
    ///
    /// The previously published index (if any) stays visible until the new
    /// one is completely written.
    pub fn build_to_dir(&self, corpus: &[Array2<f32>], root: &Path) -> Result<IndexStore> {
        let store = self.build(corpus)?;
        store.save(root)?;
        Ok(store)
    }
}

/// Check the corpus is non-empty, has no empty documents and a single
/// embedding width (equal to `expected` when given). Returns that width.
fn validate_corpus(corpus: &[Array2<f32>], expected: Option<usize>) -> Result<usize> {
    let first = corpus
        .first()
        .ok_or_else(|| Error::EmptyInput("corpus has no documents".into()))?;
    let dim = expected.unwrap_or(first.ncols());

    for (doc_id, doc) in corpus.iter().enumerate() {
        if doc.nrows() == 0 {
            return Err(Error::EmptyInput(format!("document {} has no tokens", doc_id)));
        }
        Error::check_dim(dim, doc.ncols())?;
    }
    if dim == 0 {
        return Err(Error::EmptyInput("embeddings have zero dimensions".into()));
    }
    Ok(dim)
}

fn concat_documents(docs: &[Array2<f32>], total_tokens: usize, dim: usize) -> Array2<f32> {
    let mut batch = Array2::<f32>::zeros((total_tokens, dim));
    let mut offset = 0;
    for doc in docs {
        batch
            .slice_mut(s![offset..offset + doc.nrows(), ..])
            .assign(doc);
        offset += doc.nrows();
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::normalize_rows;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    fn random_corpus(num_docs: usize, tokens: usize, dim: usize) -> Vec<Array2<f32>> {
        (0..num_docs)
            .map(|i| {
                let mut d: Array2<f32> =
                    Array2::random((tokens + i % 3, dim), Uniform::new(-1.0f32, 1.0));
                normalize_rows(&mut d);
                d
            })
            .collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(IndexConfig::default().validate().is_ok());
        for bad in [
            IndexConfig {
                nbits: 0,
                ..Default::default()
            },
            IndexConfig {
                nbits: 9,
                ..Default::default()
            },
            IndexConfig {
                num_centroids: Some(0),
                ..Default::default()
            },
            IndexConfig {
                batch_size: 0,
                ..Default::default()
            },
        ] {
            assert!(matches!(bad.validate(), Err(Error::Config(_))));
        }
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"nbits": 2, "num_centroids": 64}"#).unwrap();

        let config = IndexConfig::from_json_file(&path).unwrap();
        assert_eq!(config.nbits, 2);
        assert_eq!(config.num_centroids, Some(64));
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.kmeans, KMeansConfig::default());
    }

    #[test]
    fn test_every_token_in_exactly_one_posting() {
        let corpus = random_corpus(20, 6, 16);
        let builder = IndexBuilder::train(
            &corpus,
            IndexConfig {
                nbits: 2,
                num_centroids: Some(8),
                batch_size: 7,
                ..Default::default()
            },
        )
        .unwrap();
        let store = builder.build(&corpus).unwrap();

        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for c in 0..store.num_centroids() {
            for p in store.postings(c).unwrap().iter() {
                assert!(seen.insert((p.document_id, p.token_position)));
                total += 1;
            }
        }
        let expected: usize = corpus.iter().map(|d| d.nrows()).sum();
        assert_eq!(total, expected);
        assert_eq!(store.num_embeddings(), expected);
        for (doc, emb) in corpus.iter().enumerate() {
            assert_eq!(store.document_token_count(doc).unwrap(), emb.nrows());
        }
    }

    #[test]
    fn test_postings_match_quantizer() {
        let corpus = random_corpus(10, 5, 8);
        let builder = IndexBuilder::train(
            &corpus,
            IndexConfig {
                nbits: 4,
                num_centroids: Some(4),
                ..Default::default()
            },
        )
        .unwrap();
        let store = builder.build(&corpus).unwrap();

        for (doc, emb) in corpus.iter().enumerate() {
            let codes = store.document_codes(doc).unwrap();
            for (pos, row) in emb.outer_iter().enumerate() {
                let q = builder.codec().quantize(&row).unwrap();
                assert_eq!(codes[pos], q.centroid_id);
                assert_eq!(store.token_residual(doc, pos).unwrap(), q.residual.as_slice());
            }
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let corpus = random_corpus(15, 4, 8);
        let config = IndexConfig {
            nbits: 2,
            num_centroids: Some(4),
            ..Default::default()
        };
        let a = IndexBuilder::train(&corpus, config.clone()).unwrap().build(&corpus).unwrap();
        let b = IndexBuilder::train(&corpus, config).unwrap().build(&corpus).unwrap();
        assert_eq!(a.centroids(), b.centroids());
        for c in 0..a.num_centroids() {
            let pa = a.postings(c).unwrap();
            let pb = b.postings(c).unwrap();
            assert_eq!(pa.doc_ids(), pb.doc_ids());
            assert_eq!(pa.positions(), pb.positions());
        }
    }

    #[test]
    fn test_build_rejects_bad_corpora() {
        let corpus = random_corpus(5, 4, 8);
        let builder = IndexBuilder::train(
            &corpus,
            IndexConfig {
                nbits: 2,
                num_centroids: Some(2),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(builder.build(&[]), Err(Error::EmptyInput(_))));

        let mut with_empty = corpus.clone();
        with_empty.push(Array2::zeros((0, 8)));
        assert!(matches!(builder.build(&with_empty), Err(Error::EmptyInput(_))));

        let wrong_dim = vec![Array2::<f32>::zeros((3, 4))];
        assert!(matches!(
            builder.build(&wrong_dim),
            Err(Error::DimensionMismatch {
                expected: 8,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_new_rejects_mismatched_config() {
        let corpus = random_corpus(5, 4, 8);
        let builder = IndexBuilder::train(
            &corpus,
            IndexConfig {
                nbits: 2,
                num_centroids: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        let err = IndexBuilder::new(
            Arc::clone(builder.codec()),
            IndexConfig {
                nbits: 4,
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_failed_build_publishes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let corpus = random_corpus(5, 4, 8);
        let builder = IndexBuilder::train(
            &corpus,
            IndexConfig {
                nbits: 2,
                num_centroids: Some(2),
                ..Default::default()
            },
        )
        .unwrap();

        let mut bad = corpus.clone();
        bad.push(Array2::zeros((0, 8)));
        assert!(builder.build_to_dir(&bad, dir.path()).is_err());
        assert!(IndexStore::load(dir.path()).is_err());

        builder.build_to_dir(&corpus, dir.path()).unwrap();
        assert!(builder.build_to_dir(&bad, dir.path()).is_err());
        let loaded = IndexStore::load(dir.path()).unwrap();
        assert_eq!(loaded.document_count(), 5);
    }
}

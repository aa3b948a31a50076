//! The immutable index: centroids, inverted postings and per-document metadata.
//!
//! Postings are laid out as one contiguous block per centroid (CSR style):
//! `ivf_offsets[c]..ivf_offsets[c + 1]` indexes the parallel arrays of
//! document ids, token positions and packed residuals. Every document token
//! occupies exactly one posting slot, and slots inside a block are ordered by
//! `(document_id, token_position)`, so a document's tokens under one centroid
//! are contiguous.
//!
//! On disk an index root holds immutable generation directories plus a
//! `CURRENT` pointer file:
//!
//! ```text
//! index/
//! ├── CURRENT              "gen-000002"
//! ├── .build.lock
//! ├── gen-000001/          previous generation, kept for in-flight loads
//! └── gen-000002/
//!     ├── centroids.npy  bucket_cutoffs.npy  bucket_weights.npy
//!     ├── ivf_offsets.npy  ivf_doc_ids.npy  ivf_positions.npy  ivf_residuals.npy
//!     ├── doclens.npy
//!     └── metadata.json
//! ```
//!
//! A save writes a staging directory, renames it into place and then swaps
//! `CURRENT` (see [`crate::publish`]), so loaders only ever observe a complete
//! generation.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use serde::{Deserialize, Serialize};

use crate::builder::IndexConfig;
use crate::codec::ResidualCodec;
use crate::error::{Error, Result};
use crate::publish::{published_generation, Publication};

/// On-disk layout version written to `metadata.json`.
pub const FORMAT_VERSION: u32 = 1;

const NO_SLOT: usize = usize::MAX;

/// Metadata for the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Layout version
    pub format_version: u32,
    /// Number of bits for residual quantization
    pub nbits: usize,
    /// Number of partitions (centroids)
    pub num_partitions: usize,
    /// Embedding dimension
    pub embedding_dim: usize,
    /// Total number of token embeddings
    pub num_embeddings: usize,
    /// Total number of documents
    pub num_documents: usize,
    /// Average document length in tokens
    pub avg_doclen: f64,
    /// Configuration the index was built with
    #[serde(default)]
    pub build_config: IndexConfig,
}

/// One posting entry: a document token filed under a centroid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting<'a> {
    pub document_id: u32,
    pub token_position: u32,
    /// Packed residual of the token against the posting's centroid
    pub residual: &'a [u8],
}

/// Borrowed view of one centroid's posting list.
#[derive(Debug, Clone, Copy)]
pub struct PostingList<'a> {
    centroid_id: usize,
    doc_ids: &'a [u32],
    positions: &'a [u32],
    residuals: &'a [u8],
    packed_dim: usize,
}

impl<'a> PostingList<'a> {
    pub fn centroid_id(&self) -> usize {
        self.centroid_id
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    /// Document ids, one per entry, ascending
    pub fn doc_ids(&self) -> &'a [u32] {
        self.doc_ids
    }

    pub fn positions(&self) -> &'a [u32] {
        self.positions
    }

    /// Packed residual of entry `i`
    pub fn residual(&self, i: usize) -> &'a [u8] {
        &self.residuals[i * self.packed_dim..(i + 1) * self.packed_dim]
    }

    pub fn get(&self, i: usize) -> Option<Posting<'a>> {
        if i >= self.len() {
            return None;
        }
        Some(Posting {
            document_id: self.doc_ids[i],
            token_position: self.positions[i],
            residual: self.residual(i),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Posting<'a>> + 'a {
        let list = *self;
        (0..list.len()).map(move |i| Posting {
            document_id: list.doc_ids[i],
            token_position: list.positions[i],
            residual: list.residual(i),
        })
    }
}

/// A built index.
///
/// Nothing in the structure changes after construction, so it can be shared
/// across query threads (`Arc<IndexStore>`) without locking.
#[derive(Debug, Clone)]
pub struct IndexStore {
    metadata: Metadata,
    codec: Arc<ResidualCodec>,
    /// Offsets of each centroid's posting block, length `K + 1`
    ivf_offsets: Vec<usize>,
    ivf_doc_ids: Vec<u32>,
    ivf_positions: Vec<u32>,
    /// Packed residuals, `packed_dim` bytes per slot
    ivf_residuals: Vec<u8>,
    doc_lengths: Vec<usize>,
    /// Prefix sums of `doc_lengths`, length `num_documents + 1`
    doc_offsets: Vec<usize>,
    /// Centroid of every token, in document order
    token_codes: Vec<u32>,
    /// Posting slot of every token, in document order
    token_slots: Vec<usize>,
}

impl IndexStore {
    /// Assemble an index from its raw parts, validating the structure.
    ///
    /// Any inconsistency is reported as `IndexCorruption`; the derived
    /// document-order views (`token_codes`, `token_slots`) are rebuilt here.
    pub fn from_parts(
        metadata: Metadata,
        codec: Arc<ResidualCodec>,
        ivf_offsets: Vec<usize>,
        ivf_doc_ids: Vec<u32>,
        ivf_positions: Vec<u32>,
        ivf_residuals: Vec<u8>,
        doc_lengths: Vec<usize>,
    ) -> Result<Self> {
        let corrupt = |msg: String| Error::IndexCorruption(msg);

        let num_centroids = codec.num_centroids();
        let packed_dim = codec.packed_dim();

        if metadata.format_version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                metadata.format_version
            )));
        }
        if metadata.nbits != codec.nbits()
            || metadata.num_partitions != num_centroids
            || metadata.embedding_dim != codec.embedding_dim()
        {
            return Err(corrupt(format!(
                "metadata (nbits={}, K={}, dim={}) disagrees with codec (nbits={}, K={}, dim={})",
                metadata.nbits,
                metadata.num_partitions,
                metadata.embedding_dim,
                codec.nbits(),
                num_centroids,
                codec.embedding_dim()
            )));
        }

        let num_documents = doc_lengths.len();
        if num_documents == 0 || metadata.num_documents != num_documents {
            return Err(corrupt(format!(
                "metadata records {} documents, doclens has {}",
                metadata.num_documents, num_documents
            )));
        }
        if let Some(doc) = doc_lengths.iter().position(|&len| len == 0) {
            return Err(corrupt(format!("document {} has no tokens", doc)));
        }

        let mut doc_offsets = Vec::with_capacity(num_documents + 1);
        doc_offsets.push(0usize);
        let mut num_tokens = 0usize;
        for &len in &doc_lengths {
            num_tokens = num_tokens
                .checked_add(len)
                .ok_or_else(|| corrupt("document lengths overflow the token count".into()))?;
            doc_offsets.push(num_tokens);
        }

        if metadata.num_embeddings != num_tokens {
            return Err(corrupt(format!(
                "metadata records {} embeddings, doclens sum to {}",
                metadata.num_embeddings, num_tokens
            )));
        }
        if ivf_offsets.len() != num_centroids + 1 {
            return Err(corrupt(format!(
                "expected {} ivf offsets, found {}",
                num_centroids + 1,
                ivf_offsets.len()
            )));
        }
        if ivf_offsets[0] != 0 || ivf_offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(corrupt("ivf offsets are not a non-decreasing sequence from 0".into()));
        }
        let residual_bytes = num_tokens
            .checked_mul(packed_dim)
            .ok_or_else(|| corrupt(format!("{} tokens overflow the residual size", num_tokens)))?;
        if ivf_offsets[num_centroids] != num_tokens
            || ivf_doc_ids.len() != num_tokens
            || ivf_positions.len() != num_tokens
            || ivf_residuals.len() != residual_bytes
        {
            return Err(corrupt(format!(
                "posting arrays disagree with token count {} (offsets end {}, doc ids {}, positions {}, residual bytes {})",
                num_tokens,
                ivf_offsets[num_centroids],
                ivf_doc_ids.len(),
                ivf_positions.len(),
                ivf_residuals.len()
            )));
        }

        let mut token_codes = vec![0u32; num_tokens];
        let mut token_slots = vec![NO_SLOT; num_tokens];

        for c in 0..num_centroids {
            let mut previous: Option<(u32, u32)> = None;
            for slot in ivf_offsets[c]..ivf_offsets[c + 1] {
                let doc = ivf_doc_ids[slot];
                let pos = ivf_positions[slot];

                let doc_idx = doc as usize;
                if doc_idx >= num_documents {
                    return Err(corrupt(format!(
                        "posting of centroid {} references document {} beyond document count {}",
                        c, doc, num_documents
                    )));
                }
                if pos as usize >= doc_lengths[doc_idx] {
                    return Err(corrupt(format!(
                        "posting of centroid {} references token {} of document {} (length {})",
                        c, pos, doc, doc_lengths[doc_idx]
                    )));
                }
                if previous.is_some_and(|p| p >= (doc, pos)) {
                    return Err(corrupt(format!(
                        "posting list of centroid {} is not ordered by (document, position)",
                        c
                    )));
                }
                previous = Some((doc, pos));

                let token = doc_offsets[doc_idx] + pos as usize;
                if token_slots[token] != NO_SLOT {
                    return Err(corrupt(format!(
                        "token {} of document {} appears in more than one posting list",
                        pos, doc
                    )));
                }
                token_slots[token] = slot;
                token_codes[token] = c as u32;
            }
        }

        Ok(Self {
            metadata,
            codec,
            ivf_offsets,
            ivf_doc_ids,
            ivf_positions,
            ivf_residuals,
            doc_lengths,
            doc_offsets,
            token_codes,
            token_slots,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The quantizer the index was built with
    pub fn codec(&self) -> &Arc<ResidualCodec> {
        &self.codec
    }

    pub fn centroids(&self) -> ArrayView2<'_, f32> {
        self.codec.centroids()
    }

    pub fn num_centroids(&self) -> usize {
        self.codec.num_centroids()
    }

    pub fn embedding_dim(&self) -> usize {
        self.codec.embedding_dim()
    }

    pub fn nbits(&self) -> usize {
        self.codec.nbits()
    }

    pub fn document_count(&self) -> usize {
        self.doc_lengths.len()
    }

    /// Total number of indexed token embeddings
    pub fn num_embeddings(&self) -> usize {
        self.token_codes.len()
    }

    /// Posting list of a centroid.
    pub fn postings(&self, centroid_id: usize) -> Result<PostingList<'_>> {
        if centroid_id >= self.num_centroids() {
            return Err(Error::Config(format!(
                "centroid id {} out of range (K = {})",
                centroid_id,
                self.num_centroids()
            )));
        }
        let start = self.ivf_offsets[centroid_id];
        let end = self.ivf_offsets[centroid_id + 1];
        let packed_dim = self.codec.packed_dim();
        Ok(PostingList {
            centroid_id,
            doc_ids: &self.ivf_doc_ids[start..end],
            positions: &self.ivf_positions[start..end],
            residuals: &self.ivf_residuals[start * packed_dim..end * packed_dim],
            packed_dim,
        })
    }

    /// Number of entries in a centroid's posting list (0 when out of range).
    pub fn posting_len(&self, centroid_id: usize) -> usize {
        if centroid_id >= self.num_centroids() {
            return 0;
        }
        self.ivf_offsets[centroid_id + 1] - self.ivf_offsets[centroid_id]
    }

    pub fn document_token_count(&self, document_id: usize) -> Result<usize> {
        self.doc_lengths
            .get(document_id)
            .copied()
            .ok_or(Error::DocumentNotFound(document_id))
    }

    /// Token counts of all documents, by document id
    pub fn document_lengths(&self) -> &[usize] {
        &self.doc_lengths
    }

    /// Centroid id of every token of a document, in token order.
    pub fn document_codes(&self, document_id: usize) -> Result<&[u32]> {
        let (start, end) = self.document_range(document_id)?;
        Ok(&self.token_codes[start..end])
    }

    /// Packed residual of one document token.
    pub fn token_residual(&self, document_id: usize, token_position: usize) -> Result<&[u8]> {
        let (start, end) = self.document_range(document_id)?;
        if token_position >= end - start {
            return Err(Error::DocumentNotFound(document_id));
        }
        let slot = self.token_slots[start + token_position];
        let packed_dim = self.codec.packed_dim();
        Ok(&self.ivf_residuals[slot * packed_dim..(slot + 1) * packed_dim])
    }

    /// Decode all tokens of a document.
    ///
    /// # Returns
    ///
    /// Approximate unit embeddings of shape `[num_tokens, dim]`
    pub fn reconstruct_document(&self, document_id: usize) -> Result<Array2<f32>> {
        let codes = self.document_codes(document_id)?;
        let mut out = Array2::<f32>::zeros((codes.len(), self.embedding_dim()));
        for (pos, (row, &code)) in out.axis_iter_mut(Axis(0)).zip(codes.iter()).enumerate() {
            let residual = self.token_residual(document_id, pos)?;
            self.codec.decode_into(code as usize, residual, row)?;
        }
        Ok(out)
    }

    fn document_range(&self, document_id: usize) -> Result<(usize, usize)> {
        if document_id >= self.document_count() {
            return Err(Error::DocumentNotFound(document_id));
        }
        Ok((self.doc_offsets[document_id], self.doc_offsets[document_id + 1]))
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Persist the index under `root` and publish it atomically.
    ///
    /// # Returns
    ///
    /// The path of the published generation directory.
    pub fn save(&self, root: &Path) -> Result<PathBuf> {
        let publication = Publication::begin(root)?;
        self.write_generation(publication.staging_dir())?;
        let target = publication.commit()?;

        tracing::info!(
            path = %target.display(),
            documents = self.document_count(),
            embeddings = self.num_embeddings(),
            "published index generation"
        );

        Ok(target)
    }

    fn write_generation(&self, dir: &Path) -> Result<()> {
        self.codec.save_to_dir(dir)?;

        let offsets: Array1<i64> = self.ivf_offsets.iter().map(|&o| o as i64).collect();
        offsets.write_npy(create(dir, "ivf_offsets.npy")?)?;

        Array1::from_vec(self.ivf_doc_ids.clone()).write_npy(create(dir, "ivf_doc_ids.npy")?)?;
        Array1::from_vec(self.ivf_positions.clone())
            .write_npy(create(dir, "ivf_positions.npy")?)?;

        let residuals = ArrayView2::from_shape(
            (self.ivf_doc_ids.len(), self.codec.packed_dim()),
            &self.ivf_residuals[..],
        )
        .map_err(|e| Error::IndexCorruption(format!("residual buffer shape: {}", e)))?;
        residuals.write_npy(create(dir, "ivf_residuals.npy")?)?;

        let doclens: Array1<i64> = self.doc_lengths.iter().map(|&l| l as i64).collect();
        doclens.write_npy(create(dir, "doclens.npy")?)?;

        // metadata last: a generation without it is never loadable
        let file = File::create(dir.join("metadata.json"))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.metadata)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        Ok(())
    }

    /// Load the currently published index under `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let generation = published_generation(root)?;
        let store = Self::load_generation(&generation)?;
        tracing::info!(
            path = %generation.display(),
            documents = store.document_count(),
            centroids = store.num_centroids(),
            "loaded index"
        );
        Ok(store)
    }

    /// Load one generation directory directly.
    pub fn load_generation(dir: &Path) -> Result<Self> {
        let metadata: Metadata = serde_json::from_reader(BufReader::new(open(dir, "metadata.json")?))
            .map_err(|e| Error::IndexCorruption(format!("unreadable metadata.json: {}", e)))?;

        let codec = ResidualCodec::load_from_dir(dir, metadata.nbits)?;

        let offsets = Array1::<i64>::read_npy(open(dir, "ivf_offsets.npy")?)?;
        let ivf_offsets = to_usize(&offsets, "ivf_offsets.npy")?;
        let ivf_doc_ids = Array1::<u32>::read_npy(open(dir, "ivf_doc_ids.npy")?)?.to_vec();
        let ivf_positions = Array1::<u32>::read_npy(open(dir, "ivf_positions.npy")?)?.to_vec();

        let residuals = Array2::<u8>::read_npy(open(dir, "ivf_residuals.npy")?)?;
        if residuals.ncols() != codec.packed_dim() {
            return Err(Error::IndexCorruption(format!(
                "residual width {} does not match codec width {}",
                residuals.ncols(),
                codec.packed_dim()
            )));
        }
        let ivf_residuals: Vec<u8> = residuals.iter().copied().collect();

        let doclens = Array1::<i64>::read_npy(open(dir, "doclens.npy")?)?;
        let doc_lengths = to_usize(&doclens, "doclens.npy")?;

        Self::from_parts(
            metadata,
            Arc::new(codec),
            ivf_offsets,
            ivf_doc_ids,
            ivf_positions,
            ivf_residuals,
            doc_lengths,
        )
    }
}

/// Size in bytes of the published generation under `root`.
pub fn disk_usage(root: &Path) -> Result<u64> {
    dir_size(&published_generation(root)?)
}

fn dir_size(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += dir_size(&entry?.path())?;
    }
    Ok(total)
}

fn to_usize(values: &Array1<i64>, name: &str) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|&v| {
            usize::try_from(v)
                .map_err(|_| Error::IndexCorruption(format!("negative value {} in {}", v, name)))
        })
        .collect()
}

fn open(dir: &Path, name: &str) -> Result<File> {
    File::open(dir.join(name))
        .map_err(|e| Error::IndexLoad(format!("Failed to open {}: {}", name, e)))
}

fn create(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(dir.join(name))?))
}

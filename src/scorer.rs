//! Late-interaction scoring of candidate documents.
//!
//! A document's score is the sum over query tokens of the best similarity
//! between that query token and any document token. Only document tokens
//! filed under a centroid the query token probed are observed; every other
//! (query token, document) pair gets the imputed value from its
//! [`TokenProbe`](crate::candidates::TokenProbe).

use std::collections::{BTreeMap, HashMap};

use ndarray::{Array1, ArrayView1, ArrayView2};
use rayon::prelude::*;

use crate::candidates::QueryProbe;
use crate::error::{Error, Result};
use crate::imputation::Imputer;
use crate::index::IndexStore;

/// Scores candidates of one probed query.
pub struct Scorer<'a> {
    store: &'a IndexStore,
    imputer: &'a dyn Imputer,
}

impl<'a> Scorer<'a> {
    pub fn new(store: &'a IndexStore, imputer: &'a dyn Imputer) -> Self {
        Self { store, imputer }
    }

    /// Score a set of candidate documents.
    ///
    /// # Arguments
    ///
    /// * `query` - Query token embeddings `[num_tokens, dim]`
    /// * `probe` - Output of [`CandidateGenerator::probe`](crate::candidates::CandidateGenerator::probe) for this query
    /// * `candidates` - Document ids to score, ascending
    ///
    /// # Returns
    ///
    /// `(document_id, score)` pairs in the order of `candidates`
    pub fn score_candidates(
        &self,
        query: &ArrayView2<f32>,
        probe: &QueryProbe,
        candidates: &[u32],
    ) -> Result<Vec<(u32, f32)>> {
        self.check_probe(query, probe)?;
        let observed = self.gather(query, probe, candidates)?;

        let scores = candidates
            .iter()
            .map(|&doc| {
                let row = observed.get(&doc).map(|r| r.as_slice());
                (doc, self.aggregate(probe, row))
            })
            .collect();

        tracing::debug!(
            candidates = candidates.len(),
            observed = observed.len(),
            "scored candidates"
        );

        Ok(scores)
    }

    /// Score one document by walking its tokens in document order.
    ///
    /// Returns exactly the value [`score_candidates`](Self::score_candidates)
    /// produces for the same document.
    pub fn score(&self, query: &ArrayView2<f32>, probe: &QueryProbe, document_id: usize) -> Result<f32> {
        self.check_probe(query, probe)?;
        let codes = self.store.document_codes(document_id)?;
        let codec = self.store.codec();

        let mut best = vec![f32::NEG_INFINITY; query.nrows()];
        let mut decoded = Array1::<f32>::zeros(self.store.embedding_dim());
        for (pos, &code) in codes.iter().enumerate() {
            let probing: Vec<usize> = probe
                .tokens
                .iter()
                .enumerate()
                .filter(|(_, t)| t.probes(code))
                .map(|(i, _)| i)
                .collect();
            if probing.is_empty() {
                continue;
            }
            codec.decode_into(
                code as usize,
                self.store.token_residual(document_id, pos)?,
                decoded.view_mut(),
            )?;
            for i in probing {
                let sim = similarity(decoded.view(), query.row(i));
                if sim > best[i] {
                    best[i] = sim;
                }
            }
        }

        Ok(self.aggregate(probe, Some(best.as_slice())))
    }

    /// Per-document, per-query-token observed maxima for the given candidates.
    ///
    /// Work is split by probed centroid: each posting list is decoded once and
    /// compared against every query token that probed it.
    fn gather(
        &self,
        query: &ArrayView2<f32>,
        probe: &QueryProbe,
        candidates: &[u32],
    ) -> Result<HashMap<u32, Vec<f32>>> {
        let num_tokens = query.nrows();

        let mut by_centroid: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (i, token) in probe.tokens.iter().enumerate() {
            for c in &token.probed {
                by_centroid.entry(c.centroid_id).or_default().push(i);
            }
        }
        let work: Vec<(u32, Vec<usize>)> = by_centroid.into_iter().collect();

        let partials: Vec<Vec<(u32, usize, f32)>> = work
            .par_iter()
            .map(|(centroid_id, tokens)| self.scan_posting_list(query, *centroid_id, tokens))
            .collect::<Result<_>>()?;

        let mut observed: HashMap<u32, Vec<f32>> = HashMap::new();
        for (doc, i, sim) in partials.into_iter().flatten() {
            if candidates.binary_search(&doc).is_err() {
                continue;
            }
            let row = observed
                .entry(doc)
                .or_insert_with(|| vec![f32::NEG_INFINITY; num_tokens]);
            if sim > row[i] {
                row[i] = sim;
            }
        }
        Ok(observed)
    }

    /// Best similarity of each probing query token per document in one posting list.
    fn scan_posting_list(
        &self,
        query: &ArrayView2<f32>,
        centroid_id: u32,
        tokens: &[usize],
    ) -> Result<Vec<(u32, usize, f32)>> {
        let postings = self.store.postings(centroid_id as usize)?;
        let codec = self.store.codec();

        let mut out = Vec::new();
        let mut decoded = Array1::<f32>::zeros(self.store.embedding_dim());
        let mut best = vec![f32::NEG_INFINITY; tokens.len()];
        let mut current: Option<u32> = None;

        let flush = |doc: u32, best: &mut [f32], out: &mut Vec<(u32, usize, f32)>| {
            for (slot, &i) in tokens.iter().enumerate() {
                if best[slot] > f32::NEG_INFINITY {
                    out.push((doc, i, best[slot]));
                }
                best[slot] = f32::NEG_INFINITY;
            }
        };

        for entry in postings.iter() {
            if current != Some(entry.document_id) {
                if let Some(doc) = current {
                    flush(doc, &mut best, &mut out);
                }
                current = Some(entry.document_id);
            }
            codec.decode_into(centroid_id as usize, entry.residual, decoded.view_mut())?;
            for (slot, &i) in tokens.iter().enumerate() {
                let sim = similarity(decoded.view(), query.row(i));
                if sim > best[slot] {
                    best[slot] = sim;
                }
            }
        }
        if let Some(doc) = current {
            flush(doc, &mut best, &mut out);
        }

        Ok(out)
    }

    /// Sum per-token contributions in query order.
    fn aggregate(&self, probe: &QueryProbe, observed: Option<&[f32]>) -> f32 {
        let mut total = 0.0f32;
        for (i, token) in probe.tokens.iter().enumerate() {
            let seen = observed
                .map(|row| row[i])
                .filter(|&s| s > f32::NEG_INFINITY);
            total += self.imputer.combine(seen, token.missing_similarity);
        }
        total
    }

    fn check_probe(&self, query: &ArrayView2<f32>, probe: &QueryProbe) -> Result<()> {
        Error::check_dim(self.store.embedding_dim(), query.ncols())?;
        if probe.tokens.len() != query.nrows() {
            return Err(Error::DimensionMismatch {
                expected: query.nrows(),
                actual: probe.tokens.len(),
            });
        }
        Ok(())
    }
}

#[inline]
fn similarity(decoded: ArrayView1<f32>, query_token: ArrayView1<f32>) -> f32 {
    decoded.dot(&query_token)
}

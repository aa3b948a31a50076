//! Candidate generation: probe the nearest centroids of every query token and
//! collect the documents filed under them.
//!
//! Documents that have no token under any probed centroid are never scored.
//! This pruning is the central approximation of the engine: `nprobe` trades
//! latency for recall.

use std::sync::Arc;

use ndarray::{ArrayView2, Axis};
use rayon::prelude::*;

use crate::codec::ResidualCodec;
use crate::error::{Error, Result};
use crate::imputation::Imputer;
use crate::index::IndexStore;
use crate::utils::by_score_desc_then_id;

/// A centroid and its inner product with a query token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredCentroid {
    pub centroid_id: u32,
    pub score: f32,
}

/// Nearest-centroid search used to pick the centroids each query token probes.
///
/// The default is an exact scan ([`ExactCentroidIndex`]); an approximate
/// structure (e.g. a graph index over the centroids) can be plugged in for
/// very large K.
pub trait CentroidIndex: Send + Sync {
    /// For each query row, the `k` highest-scoring centroids in descending
    /// score order, ties broken by ascending centroid id.
    fn search(&self, queries: &ArrayView2<f32>, k: usize) -> Result<Vec<Vec<ScoredCentroid>>>;
}

/// Exhaustive inner-product scan over all centroids.
pub struct ExactCentroidIndex {
    codec: Arc<ResidualCodec>,
}

impl ExactCentroidIndex {
    pub fn new(codec: Arc<ResidualCodec>) -> Self {
        Self { codec }
    }
}

impl CentroidIndex for ExactCentroidIndex {
    fn search(&self, queries: &ArrayView2<f32>, k: usize) -> Result<Vec<Vec<ScoredCentroid>>> {
        Error::check_dim(self.codec.embedding_dim(), queries.ncols())?;

        // [Q, dim] @ [dim, K] -> [Q, K]
        let scores = queries.dot(&self.codec.centroids().t());
        let k = k.min(scores.ncols());

        Ok(scores
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| {
                let mut ranked: Vec<(u32, f32)> = row
                    .iter()
                    .enumerate()
                    .map(|(c, &s)| (c as u32, s))
                    .collect();
                if k == 0 {
                    return Vec::new();
                }
                if k < ranked.len() {
                    ranked.select_nth_unstable_by(k - 1, |a, b| by_score_desc_then_id(*a, *b));
                    ranked.truncate(k);
                }
                ranked.sort_by(|a, b| by_score_desc_then_id(*a, *b));
                ranked
                    .into_iter()
                    .map(|(centroid_id, score)| ScoredCentroid { centroid_id, score })
                    .collect()
            })
            .collect())
    }
}

/// What one query token probed.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenProbe {
    /// Centroids whose postings this token reads, best first
    pub probed: Vec<ScoredCentroid>,
    /// Similarity assumed when this token observes no token of a candidate
    pub missing_similarity: f32,
}

impl TokenProbe {
    pub fn probes(&self, centroid_id: u32) -> bool {
        self.probed.iter().any(|c| c.centroid_id == centroid_id)
    }
}

/// Result of probing the index for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryProbe {
    /// One entry per query token, in query order
    pub tokens: Vec<TokenProbe>,
    /// Union of the documents posted under any probed centroid, ascending
    pub candidates: Vec<u32>,
}

/// Turns query token embeddings into probed centroids and candidate documents.
pub struct CandidateGenerator<'a> {
    store: &'a IndexStore,
    centroid_index: &'a dyn CentroidIndex,
}

impl<'a> CandidateGenerator<'a> {
    pub fn new(store: &'a IndexStore, centroid_index: &'a dyn CentroidIndex) -> Self {
        Self {
            store,
            centroid_index,
        }
    }

    /// Candidate documents for `query` when every token probes its
    /// `nprobe` nearest centroids.
    pub fn generate(&self, query: &ArrayView2<f32>, nprobe: usize) -> Result<Vec<u32>> {
        validate_query(self.store, query)?;
        let ranked = self.rank(query, nprobe, nprobe)?;
        let probed: Vec<Vec<ScoredCentroid>> = ranked
            .into_iter()
            .map(|r| select_probed(&r, nprobe, None))
            .collect();
        self.union_postings(probed.iter().map(|p| p.as_slice()))
    }

    /// Probe the index for `query`.
    ///
    /// Each token keeps its `nprobe` best centroids, minus those scoring
    /// below `centroid_score_threshold` (the best centroid is always kept).
    /// The imputer decides the similarity a token contributes to candidates
    /// it did not observe.
    pub fn probe(
        &self,
        query: &ArrayView2<f32>,
        nprobe: usize,
        centroid_score_threshold: Option<f32>,
        imputer: &dyn Imputer,
    ) -> Result<QueryProbe> {
        validate_query(self.store, query)?;
        let depth = imputer.ranking_depth().max(nprobe);
        let ranked = self.rank(query, nprobe, depth)?;

        let tokens: Vec<TokenProbe> = ranked
            .iter()
            .map(|r| {
                let probed = select_probed(r, nprobe, centroid_score_threshold);
                let missing_similarity = imputer.missing_similarity(r, self.store);
                TokenProbe {
                    probed,
                    missing_similarity,
                }
            })
            .collect();

        let candidates = self.union_postings(tokens.iter().map(|t| t.probed.as_slice()))?;

        tracing::debug!(
            query_tokens = tokens.len(),
            nprobe,
            candidates = candidates.len(),
            "generated candidates"
        );

        Ok(QueryProbe { tokens, candidates })
    }

    fn rank(
        &self,
        query: &ArrayView2<f32>,
        nprobe: usize,
        depth: usize,
    ) -> Result<Vec<Vec<ScoredCentroid>>> {
        if nprobe == 0 {
            return Err(Error::Config("nprobe must be at least 1".into()));
        }
        let depth = depth.min(self.store.num_centroids());
        let ranked = self.centroid_index.search(query, depth)?;
        if ranked.len() != query.nrows() {
            return Err(Error::DimensionMismatch {
                expected: query.nrows(),
                actual: ranked.len(),
            });
        }
        Ok(ranked)
    }

    fn union_postings<'p>(
        &self,
        probed: impl Iterator<Item = &'p [ScoredCentroid]>,
    ) -> Result<Vec<u32>> {
        let mut docs = Vec::new();
        for token in probed {
            for c in token {
                let postings = self.store.postings(c.centroid_id as usize)?;
                let ids = postings.doc_ids();
                // ids are sorted, skip runs of the same document
                docs.extend(
                    ids.iter()
                        .enumerate()
                        .filter(|(i, id)| *i == 0 || ids[i - 1] != **id)
                        .map(|(_, id)| *id),
                );
            }
        }
        docs.sort_unstable();
        docs.dedup();
        Ok(docs)
    }
}

/// Keep the first `nprobe` ranked centroids that pass the threshold; the
/// top centroid always passes.
fn select_probed(
    ranked: &[ScoredCentroid],
    nprobe: usize,
    centroid_score_threshold: Option<f32>,
) -> Vec<ScoredCentroid> {
    ranked
        .iter()
        .take(nprobe)
        .enumerate()
        .filter(|(i, c)| *i == 0 || centroid_score_threshold.map_or(true, |t| c.score >= t))
        .map(|(_, c)| *c)
        .collect()
}

/// Reject empty queries and queries of the wrong width.
pub(crate) fn validate_query(store: &IndexStore, query: &ArrayView2<f32>) -> Result<()> {
    if query.nrows() == 0 {
        return Err(Error::EmptyInput("query has no tokens".into()));
    }
    Error::check_dim(store.embedding_dim(), query.ncols())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imputation::{ClusterSizeCutoff, FixedPenalty, NearestProbedCentroid};
    use crate::test_support::axis_store;
    use ndarray::{array, Array2};

    #[test]
    fn test_exact_index_ranks_and_breaks_ties() {
        let store = axis_store();
        let index = ExactCentroidIndex::new(Arc::clone(store.codec()));
        // equal similarity to e0 and e1
        let q = array![[0.5f32, 0.5, 0.0, 0.0]];
        let ranked = index.search(&q.view(), 2).unwrap();
        assert_eq!(ranked[0][0].centroid_id, 0);
        assert_eq!(ranked[0][1].centroid_id, 1);

        let all = index.search(&q.view(), 100).unwrap();
        assert_eq!(all[0].len(), store.num_centroids());
        assert!(all[0].windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_generate_unions_postings() {
        let store = axis_store();
        let index = ExactCentroidIndex::new(Arc::clone(store.codec()));
        let generator = CandidateGenerator::new(&store, &index);

        // e0 is posted by docs 0 and 1, e2 by doc 2
        let q = array![[1.0f32, 0.0, 0.0, 0.0]];
        assert_eq!(generator.generate(&q.view(), 1).unwrap(), vec![0, 1]);

        let q = array![[1.0f32, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
        assert_eq!(generator.generate(&q.view(), 1).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_candidates_grow_with_nprobe() {
        let store = axis_store();
        let index = ExactCentroidIndex::new(Arc::clone(store.codec()));
        let generator = CandidateGenerator::new(&store, &index);

        let q = array![[0.9f32, 0.3, 0.1, 0.2]];
        let mut previous: Vec<u32> = Vec::new();
        for nprobe in 1..=store.num_centroids() {
            let current = generator.generate(&q.view(), nprobe).unwrap();
            assert!(previous.iter().all(|d| current.contains(d)));
            previous = current;
        }
        assert_eq!(previous.len(), store.document_count());
    }

    #[test]
    fn test_unused_centroid_contributes_nothing() {
        let store = axis_store();
        let index = ExactCentroidIndex::new(Arc::clone(store.codec()));
        let generator = CandidateGenerator::new(&store, &index);

        // e3 has no postings
        let q = array![[0.0f32, 0.0, 0.0, 1.0]];
        assert!(generator.generate(&q.view(), 1).unwrap().is_empty());

        let probe = generator
            .probe(&q.view(), 1, None, &NearestProbedCentroid)
            .unwrap();
        assert_eq!(probe.tokens.len(), 1);
        assert_eq!(probe.tokens[0].probed[0].centroid_id, 3);
    }

    #[test]
    fn test_imputed_value_does_not_depend_on_nprobe() {
        let store = axis_store();
        let index = ExactCentroidIndex::new(Arc::clone(store.codec()));
        let generator = CandidateGenerator::new(&store, &index);

        let q = array![[0.8f32, 0.5, 0.3, 0.1], [0.1, 0.2, 0.9, 0.4]];
        let imputers: [&dyn Imputer; 2] = [
            &NearestProbedCentroid,
            &ClusterSizeCutoff { t_prime: 3, bound: 4 },
        ];
        for imputer in imputers {
            let first = generator.probe(&q.view(), 1, None, imputer).unwrap();
            for nprobe in 2..=4 {
                let wider = generator.probe(&q.view(), nprobe, None, imputer).unwrap();
                for (a, b) in first.tokens.iter().zip(wider.tokens.iter()) {
                    assert_eq!(a.missing_similarity, b.missing_similarity, "nprobe = {}", nprobe);
                }
            }
        }
    }

    #[test]
    fn test_threshold_keeps_best_centroid() {
        let store = axis_store();
        let index = ExactCentroidIndex::new(Arc::clone(store.codec()));
        let generator = CandidateGenerator::new(&store, &index);

        let q = array![[0.2f32, 0.1, 0.0, 0.0]];
        let probe = generator
            .probe(&q.view(), 3, Some(0.9), &FixedPenalty { penalty: 0.0 })
            .unwrap();
        assert_eq!(probe.tokens[0].probed.len(), 1);
        assert_eq!(probe.tokens[0].probed[0].centroid_id, 0);
        assert_eq!(probe.tokens[0].missing_similarity, 0.0);
    }

    #[test]
    fn test_invalid_queries() {
        let store = axis_store();
        let index = ExactCentroidIndex::new(Arc::clone(store.codec()));
        let generator = CandidateGenerator::new(&store, &index);

        let empty = Array2::<f32>::zeros((0, 4));
        assert!(matches!(
            generator.generate(&empty.view(), 1),
            Err(Error::EmptyInput(_))
        ));

        let narrow = Array2::<f32>::zeros((1, 3));
        assert!(matches!(
            generator.generate(&narrow.view(), 1),
            Err(Error::DimensionMismatch { .. })
        ));

        let q = array![[1.0f32, 0.0, 0.0, 0.0]];
        assert!(matches!(
            generator.generate(&q.view(), 0),
            Err(Error::Config(_))
        ));
    }
}

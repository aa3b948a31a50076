//! Top-k search over a loaded index

use std::path::Path;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::candidates::{validate_query, CandidateGenerator, CentroidIndex, ExactCentroidIndex};
use crate::error::{Error, Result};
use crate::imputation::ImputationStrategy;
use crate::index::IndexStore;
use crate::scorer::Scorer;
use crate::utils::by_score_desc_then_id;

fn default_top_k() -> usize {
    10
}

fn default_nprobe() -> usize {
    8
}

/// Search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParameters {
    /// Number of results to return per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Number of centroids probed per query token
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    /// Skip probed centroids scoring below this (a token's best centroid is always kept)
    #[serde(default)]
    pub centroid_score_threshold: Option<f32>,
    /// Similarity used for query tokens that observed nothing of a candidate
    #[serde(default)]
    pub imputation: ImputationStrategy,
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            nprobe: default_nprobe(),
            centroid_score_threshold: None,
            imputation: ImputationStrategy::default(),
        }
    }
}

impl SearchParameters {
    /// Parameters tuned for a given result count: small k probes fewer
    /// centroids and prunes weak ones harder.
    pub fn for_top_k(top_k: usize) -> Self {
        let (nprobe, threshold) = if top_k <= 10 {
            (1, 0.5)
        } else if top_k <= 100 {
            (2, 0.45)
        } else {
            (4, 0.4)
        };
        Self {
            top_k,
            nprobe,
            centroid_score_threshold: Some(threshold),
            imputation: ImputationStrategy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::Config("top_k must be at least 1".into()));
        }
        if self.nprobe == 0 {
            return Err(Error::Config("nprobe must be at least 1".into()));
        }
        if let Some(t) = self.centroid_score_threshold {
            if !t.is_finite() {
                return Err(Error::Config(format!(
                    "centroid_score_threshold must be finite, got {}",
                    t
                )));
            }
        }
        self.imputation.validate(self.nprobe)
    }

    /// Load and validate parameters from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let params: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        params.validate()?;
        Ok(params)
    }
}

/// Predicate over document ids; documents it rejects are never scored.
pub type DocumentFilter<'a> = &'a (dyn Fn(usize) -> bool + Sync);

/// One ranked document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub document_id: usize,
    pub score: f32,
}

/// Result of a single query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Query ID
    pub query_id: usize,
    /// Retrieved document IDs (ranked by relevance)
    pub passage_ids: Vec<usize>,
    /// Relevance scores for each document
    pub scores: Vec<f32>,
}

/// Query engine over a shared, immutable index.
///
/// Cloning is cheap and every method takes `&self`, so one searcher can
/// serve any number of threads.
#[derive(Clone)]
pub struct Searcher {
    store: Arc<IndexStore>,
    centroid_index: Arc<dyn CentroidIndex>,
    params: SearchParameters,
}

impl Searcher {
    /// Searcher with an exact centroid scan.
    pub fn new(store: Arc<IndexStore>, params: SearchParameters) -> Result<Self> {
        let centroid_index = Arc::new(ExactCentroidIndex::new(Arc::clone(store.codec())));
        Self::with_centroid_index(store, centroid_index, params)
    }

    /// Searcher using a custom nearest-centroid structure.
    pub fn with_centroid_index(
        store: Arc<IndexStore>,
        centroid_index: Arc<dyn CentroidIndex>,
        params: SearchParameters,
    ) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            store,
            centroid_index,
            params,
        })
    }

    /// Load the published index under `root` and search it.
    pub fn load(root: &Path, params: SearchParameters) -> Result<Self> {
        Self::new(Arc::new(IndexStore::load(root)?), params)
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    /// Default parameters of this searcher
    pub fn params(&self) -> &SearchParameters {
        &self.params
    }

    pub fn candidate_generator(&self) -> CandidateGenerator<'_> {
        CandidateGenerator::new(&self.store, self.centroid_index.as_ref())
    }

    /// Top `k` documents for `query`, probing `nprobe` centroids per token.
    ///
    /// The threshold and imputation strategy come from the searcher's
    /// parameters.
    pub fn search(
        &self,
        query: &ArrayView2<f32>,
        k: usize,
        nprobe: usize,
    ) -> Result<Vec<ScoredCandidate>> {
        let params = SearchParameters {
            top_k: k,
            nprobe,
            ..self.params.clone()
        };
        self.search_with(query, &params, None, None)
    }

    /// Search with explicit parameters, optionally restricted to a subset of
    /// document ids and to the documents `filter` accepts.
    ///
    /// # Returns
    ///
    /// At most `top_k` documents, highest score first, ties broken by
    /// ascending document id. Empty when no document is a candidate.
    pub fn search_with(
        &self,
        query: &ArrayView2<f32>,
        params: &SearchParameters,
        subset: Option<&[usize]>,
        filter: Option<DocumentFilter<'_>>,
    ) -> Result<Vec<ScoredCandidate>> {
        params.validate()?;
        self.search_validated(query, params, subset, filter)
    }

    fn search_validated(
        &self,
        query: &ArrayView2<f32>,
        params: &SearchParameters,
        subset: Option<&[usize]>,
        filter: Option<DocumentFilter<'_>>,
    ) -> Result<Vec<ScoredCandidate>> {
        validate_query(&self.store, query)?;

        let imputer = params.imputation.build();
        let probe = self.candidate_generator().probe(
            query,
            params.nprobe,
            params.centroid_score_threshold,
            imputer.as_ref(),
        )?;

        let allowed: Option<Vec<usize>> = subset.map(|ids| {
            let mut ids = ids.to_vec();
            ids.sort_unstable();
            ids
        });
        let candidates: Vec<u32> = probe
            .candidates
            .iter()
            .copied()
            .filter(|&d| {
                allowed
                    .as_ref()
                    .map_or(true, |a| a.binary_search(&(d as usize)).is_ok())
            })
            .filter(|&d| filter.map_or(true, |f| f(d as usize)))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let scorer = Scorer::new(&self.store, imputer.as_ref());
        let mut scored = scorer.score_candidates(query, &probe, &candidates)?;
        scored.sort_by(|a, b| by_score_desc_then_id(*a, *b));
        scored.truncate(params.top_k);

        tracing::debug!(
            query_tokens = query.nrows(),
            candidates = candidates.len(),
            results = scored.len(),
            "search finished"
        );

        Ok(scored
            .into_iter()
            .map(|(doc, score)| ScoredCandidate {
                document_id: doc as usize,
                score,
            })
            .collect())
    }

    /// Search many queries in parallel.
    ///
    /// `subsets`, when given, holds one allowed-id list per query; `filter`
    /// applies to every query. Any failing query fails the batch.
    pub fn search_batch(
        &self,
        queries: &[Array2<f32>],
        params: &SearchParameters,
        show_progress: bool,
        subsets: Option<&[Vec<usize>]>,
        filter: Option<DocumentFilter<'_>>,
    ) -> Result<Vec<QueryResult>> {
        params.validate()?;
        if let Some(s) = subsets {
            if s.len() != queries.len() {
                return Err(Error::Config(format!(
                    "{} subsets given for {} queries",
                    s.len(),
                    queries.len()
                )));
            }
        }

        let progress = if show_progress {
            let bar = indicatif::ProgressBar::new(queries.len() as u64);
            bar.set_message("Searching...");
            Some(bar)
        } else {
            None
        };

        let results = queries
            .par_iter()
            .enumerate()
            .map(|(i, query)| {
                let subset = subsets.map(|s| s[i].as_slice());
                let ranked = self.search_validated(&query.view(), params, subset, filter)?;

                if let Some(ref bar) = progress {
                    bar.inc(1);
                }

                Ok(QueryResult {
                    query_id: i,
                    passage_ids: ranked.iter().map(|c| c.document_id).collect(),
                    scores: ranked.iter().map(|c| c.score).collect(),
                })
            })
            .collect::<Result<Vec<_>>>();

        if let Some(bar) = progress {
            bar.finish();
        }

        results
    }

    /// Score one document against `query` under `params`, whether or not it
    /// would be a candidate.
    pub fn score_document(
        &self,
        query: &ArrayView2<f32>,
        params: &SearchParameters,
        document_id: usize,
    ) -> Result<f32> {
        params.validate()?;
        validate_query(&self.store, query)?;
        let imputer = params.imputation.build();
        let probe = self.candidate_generator().probe(
            query,
            params.nprobe,
            params.centroid_score_threshold,
            imputer.as_ref(),
        )?;
        Scorer::new(&self.store, imputer.as_ref()).score(query, &probe, document_id)
    }
}

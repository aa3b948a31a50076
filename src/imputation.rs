//! Missing-similarity imputation.
//!
//! Candidate generation only observes a document token when it sits under a
//! centroid the query token probed. For every (query token, candidate) pair
//! with no such token the scorer needs a stand-in value: a good estimate is an
//! upper bound on what the unprobed centroids could have contributed.

use serde::{Deserialize, Serialize};

use crate::candidates::ScoredCentroid;
use crate::error::{Error, Result};
use crate::index::IndexStore;

/// Strategy deciding the similarity a query token contributes to a candidate
/// it did not observe.
///
/// The imputed value depends only on the centroid ranking up to
/// [`ranking_depth`](Imputer::ranking_depth), never on how many centroids were
/// probed, and it acts as a floor on observed similarities. Together these
/// keep a candidate's score non-decreasing as `nprobe` grows.
pub trait Imputer: Send + Sync {
    /// How many ranked centroids per query token `missing_similarity` needs
    /// to see. Independent of `nprobe`.
    fn ranking_depth(&self) -> usize {
        1
    }

    /// Imputed similarity for one query token.
    ///
    /// # Arguments
    ///
    /// * `ranked` - Centroids ranked by score, best first, at least
    ///   `min(ranking_depth, K)` long
    /// * `store` - The index, for cluster sizes
    fn missing_similarity(&self, ranked: &[ScoredCentroid], store: &IndexStore) -> f32;

    /// Contribution of a query token to a candidate's score.
    fn combine(&self, observed: Option<f32>, missing: f32) -> f32 {
        observed.map_or(missing, |s| s.max(missing))
    }
}

/// A constant value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedPenalty {
    pub penalty: f32,
}

impl Imputer for FixedPenalty {
    fn ranking_depth(&self) -> usize {
        0
    }

    fn missing_similarity(&self, _: &[ScoredCentroid], _: &IndexStore) -> f32 {
        self.penalty
    }
}

/// Score of the token's nearest centroid, which is always probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearestProbedCentroid;

impl Imputer for NearestProbedCentroid {
    fn missing_similarity(&self, ranked: &[ScoredCentroid], _: &IndexStore) -> f32 {
        ranked.first().map_or(0.0, |c| c.score)
    }
}

/// Score of the centroid at which the cumulative size of the best-ranked
/// clusters first reaches `t_prime` tokens, looking at most `bound`
/// centroids deep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSizeCutoff {
    pub t_prime: usize,
    pub bound: usize,
}

impl Imputer for ClusterSizeCutoff {
    fn ranking_depth(&self) -> usize {
        self.bound
    }

    fn missing_similarity(&self, ranked: &[ScoredCentroid], store: &IndexStore) -> f32 {
        let mut cumulative = 0usize;
        for c in ranked.iter().take(self.bound) {
            cumulative += store.posting_len(c.centroid_id as usize);
            if cumulative >= self.t_prime {
                return c.score;
            }
        }
        ranked
            .iter()
            .take(self.bound)
            .last()
            .map_or(0.0, |c| c.score)
    }
}

fn default_t_prime() -> usize {
    10_000
}

fn default_bound() -> usize {
    128
}

/// Serializable selection of an [`Imputer`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum ImputationStrategy {
    FixedPenalty {
        penalty: f32,
    },
    NearestProbedCentroid,
    ClusterSizeCutoff {
        #[serde(default = "default_t_prime")]
        t_prime: usize,
        #[serde(default = "default_bound")]
        bound: usize,
    },
}

impl Default for ImputationStrategy {
    fn default() -> Self {
        ImputationStrategy::ClusterSizeCutoff {
            t_prime: default_t_prime(),
            bound: default_bound(),
        }
    }
}

impl ImputationStrategy {
    /// Check the strategy against the number of centroids probed per token.
    pub fn validate(&self, nprobe: usize) -> Result<()> {
        match *self {
            ImputationStrategy::FixedPenalty { penalty } if !penalty.is_finite() => Err(
                Error::Config(format!("imputation penalty must be finite, got {}", penalty)),
            ),
            ImputationStrategy::ClusterSizeCutoff { t_prime: 0, .. } => {
                Err(Error::Config("t_prime must be at least 1".into()))
            }
            ImputationStrategy::ClusterSizeCutoff { bound, .. } if bound < nprobe => {
                Err(Error::Config(format!(
                    "bound ({}) must be at least nprobe ({})",
                    bound, nprobe
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn build(&self) -> Box<dyn Imputer> {
        match *self {
            ImputationStrategy::FixedPenalty { penalty } => Box::new(FixedPenalty { penalty }),
            ImputationStrategy::NearestProbedCentroid => Box::new(NearestProbedCentroid),
            ImputationStrategy::ClusterSizeCutoff { t_prime, bound } => {
                Box::new(ClusterSizeCutoff { t_prime, bound })
            }
        }
    }
}

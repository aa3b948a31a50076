//! Next-WARP: CPU-based WARP engine for compressed multi-vector search
//!
//! This crate builds a residual-compressed inverted index over per-token
//! document embeddings and answers late-interaction (MaxSim) queries
//! against it: query tokens probe their nearest centroids, the documents
//! posted there become candidates, and candidates are scored from decoded
//! residuals with imputation for the query tokens that observed nothing.

pub mod builder;
pub mod candidates;
pub mod codec;
pub mod error;
pub mod imputation;
pub mod index;
pub mod kmeans;
pub mod publish;
pub mod scorer;
pub mod search;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use builder::{IndexBuilder, IndexConfig};
pub use candidates::{CandidateGenerator, CentroidIndex, ExactCentroidIndex, QueryProbe};
pub use codec::{QuantizedVector, ResidualCodec};
pub use error::{Error, Result};
pub use imputation::{ImputationStrategy, Imputer};
pub use index::{disk_usage, IndexStore, Metadata};
pub use kmeans::KMeansConfig;
pub use publish::Publication;
pub use scorer::Scorer;
pub use search::{DocumentFilter, QueryResult, ScoredCandidate, SearchParameters, Searcher};

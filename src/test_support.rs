//! Hand-built fixtures shared by unit tests.

use std::sync::Arc;

use ndarray::{array, Array1};

use crate::builder::IndexConfig;
use crate::codec::ResidualCodec;
use crate::index::{IndexStore, Metadata, FORMAT_VERSION};

/// Four axis-aligned centroids in 4 dimensions, 2-bit residuals.
///
/// ```text
/// doc 0: [c0, c1]
/// doc 1: [c0]
/// doc 2: [c2, c1]
/// ```
///
/// c3 has no postings.
pub(crate) fn axis_store() -> IndexStore {
    let centroids = array![
        [1.0f32, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ];
    let codec = ResidualCodec::new(
        2,
        centroids,
        Array1::from_vec(vec![-0.1, 0.0, 0.1]),
        Array1::from_vec(vec![-0.2, -0.05, 0.05, 0.2]),
    )
    .unwrap();

    let metadata = Metadata {
        format_version: FORMAT_VERSION,
        nbits: 2,
        num_partitions: 4,
        embedding_dim: 4,
        num_embeddings: 5,
        num_documents: 3,
        avg_doclen: 5.0 / 3.0,
        build_config: IndexConfig::default(),
    };

    IndexStore::from_parts(
        metadata,
        Arc::new(codec),
        vec![0, 2, 4, 5, 5],
        vec![0, 1, 0, 2, 2],
        vec![0, 0, 1, 1, 0],
        vec![0b1010_1010, 0b1001_0101, 0b0110_1010, 0b0101_0101, 0b1111_0000],
        vec![2, 1, 2],
    )
    .unwrap()
}

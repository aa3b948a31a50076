//! Numeric helpers shared by the codec, the builder and the search path.

use std::cmp::Ordering;

use ndarray::{Array2, ArrayView1, ArrayViewMut1, Axis};

/// Norm floor used when normalizing, so zero vectors stay finite.
pub const NORM_EPSILON: f32 = 1e-12;

/// Compute multiple quantiles of a set of values using linear interpolation.
///
/// # Arguments
///
/// * `values` - Input values (copied and sorted internally)
/// * `qs` - Quantiles to compute, each between 0.0 and 1.0
///
/// # Returns
///
/// One value per requested quantile. An empty input yields zeros.
pub fn quantiles(values: &[f32], qs: &[f64]) -> Vec<f32> {
    if values.is_empty() {
        return vec![0.0; qs.len()];
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len();

    qs.iter()
        .map(|&q| {
            let idx_float = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower_idx = idx_float.floor() as usize;
            let upper_idx = idx_float.ceil() as usize;

            if lower_idx == upper_idx {
                sorted[lower_idx]
            } else {
                let weight = (idx_float - lower_idx as f64) as f32;
                sorted[lower_idx] * (1.0 - weight) + sorted[upper_idx] * weight
            }
        })
        .collect()
}

/// Normalize a single vector to unit length in place.
pub fn normalize_in_place(mut row: ArrayViewMut1<f32>) {
    let norm = row.dot(&row).sqrt().max(NORM_EPSILON);
    row /= norm;
}

/// Normalize every row of a 2D array to unit length in place.
pub fn normalize_rows(arr: &mut Array2<f32>) {
    for row in arr.axis_iter_mut(Axis(0)) {
        normalize_in_place(row);
    }
}

/// Index of the largest value, preferring the lowest index on ties.
///
/// NaN scores never win. Returns 0 for an empty slice.
pub fn argmax(values: ArrayView1<f32>) -> usize {
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v > best {
            best = v;
            best_idx = idx;
        }
    }
    best_idx
}

/// Descending score order with ascending id as tie-breaker.
///
/// Uses `total_cmp` so that sorting is a total order even with NaN.
pub fn by_score_desc_then_id<I: Ord>(a: (I, f32), b: (I, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

use std::collections::HashMap;

use ndarray::{Array2, ArrayView2};
use num_traits::ToPrimitive;

use crate::errors::{Result, SpatialQuantError};

/// Integer label grid; 0 is background
pub type LabelMask = Array2<u32>;

/// Label value reserved for background pixels
pub const BACKGROUND_LABEL: u32 = 0;

/// Round to the nearest integer, ties to even (2.5 -> 2, 3.5 -> 4)
#[inline]
pub fn round_half_to_even(value: f64) -> f64 {
    value.round_ties_even()
}

/// Convert one raw mask value into a label
pub fn to_label<T: ToPrimitive + Copy>(value: T) -> Result<u32> {
    if let Some(signed) = value.to_i64() {
        if signed < 0 {
            return Err(SpatialQuantError::NegativeLabel(signed));
        }
    }

    value.to_u32().ok_or_else(|| {
        let shown = value
            .to_u64()
            .map(|v| v.to_string())
            .or_else(|| value.to_f64().map(|v| v.to_string()))
            .unwrap_or_else(|| "?".to_string());
        SpatialQuantError::LabelOutOfRange(shown)
    })
}

/// Convert a grid of arbitrary integer samples into a label mask
pub fn labels_from_view<T: ToPrimitive + Copy>(view: ArrayView2<T>) -> Result<LabelMask> {
    let mut mask = LabelMask::zeros(view.raw_dim());
    for (dst, &value) in mask.iter_mut().zip(view.iter()) {
        *dst = to_label(value)?;
    }
    Ok(mask)
}

/// Sorted set of the positive labels in a mask, with pixel counts
#[derive(Debug, Clone)]
pub struct LabelIndex {
    labels: Vec<u32>,
    counts: Vec<usize>,
    positions: HashMap<u32, usize>,
}

impl LabelIndex {
    /// Scan the mask once and index every non-background label in ascending order
    pub fn from_mask(mask: &LabelMask) -> Self {
        let mut counts_by_label: HashMap<u32, usize> = HashMap::new();
        for &label in mask.iter() {
            if label != BACKGROUND_LABEL {
                *counts_by_label.entry(label).or_insert(0) += 1;
            }
        }

        let mut labels: Vec<u32> = counts_by_label.keys().copied().collect();
        labels.sort_unstable();

        let counts = labels.iter().map(|label| counts_by_label[label]).collect();
        let positions = labels
            .iter()
            .enumerate()
            .map(|(position, &label)| (label, position))
            .collect();

        Self { labels, counts, positions }
    }

    /// Position of a label in ascending order, None for background or unknown labels
    #[inline]
    pub fn position(&self, label: u32) -> Option<usize> {
        if label == BACKGROUND_LABEL {
            return None;
        }
        self.positions.get(&label).copied()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

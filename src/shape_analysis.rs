// src/shape_analysis.rs - Mask-only region geometry (centroid, ellipse fit, orientation)

use nalgebra::Matrix2;
use std::f64::consts::FRAC_PI_4;

use crate::image_utils::{round_half_to_even, LabelIndex, LabelMask};

/// Geometric descriptors of one labeled region
///
/// Coordinates follow image conventions: rows grow downward, `x` is the
/// column and `y` the row.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionGeometry {
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub pixel_count: usize,
    pub major_axis_length: f64,
    pub minor_axis_length: f64,
    pub eccentricity: f64,
    /// Angle in radians between the row axis and the major axis, in [-pi/2, pi/2]
    pub orientation: f64,
}

impl RegionGeometry {
    /// Rounded column of the centroid
    pub fn x(&self) -> i64 {
        round_half_to_even(self.centroid_x) as i64
    }

    /// Rounded row of the centroid
    pub fn y(&self) -> i64 {
        round_half_to_even(self.centroid_y) as i64
    }

    pub fn size(&self) -> u64 {
        self.pixel_count as u64
    }
}

/// Second-order central moments of a region, normalized by its area
#[derive(Debug, Clone, Copy, Default)]
struct CentralMoments {
    row_row: f64,
    col_col: f64,
    row_col: f64,
}

/// Measure the geometry of every indexed label, in index order
pub fn measure_regions(mask: &LabelMask, index: &LabelIndex) -> Vec<RegionGeometry> {
    let counts = index.counts();
    let mut row_sums = vec![0.0f64; index.len()];
    let mut col_sums = vec![0.0f64; index.len()];

    for ((row, col), &label) in mask.indexed_iter() {
        if let Some(position) = index.position(label) {
            row_sums[position] += row as f64;
            col_sums[position] += col as f64;
        }
    }

    let centroids: Vec<(f64, f64)> = row_sums
        .iter()
        .zip(&col_sums)
        .zip(counts)
        .map(|((&rows, &cols), &count)| (rows / count as f64, cols / count as f64))
        .collect();

    // Second pass around the centroid keeps the moments well conditioned for large images
    let mut moments = vec![CentralMoments::default(); index.len()];
    for ((row, col), &label) in mask.indexed_iter() {
        if let Some(position) = index.position(label) {
            let (centroid_row, centroid_col) = centroids[position];
            let dr = row as f64 - centroid_row;
            let dc = col as f64 - centroid_col;
            let m = &mut moments[position];
            m.row_row += dr * dr;
            m.col_col += dc * dc;
            m.row_col += dr * dc;
        }
    }

    centroids
        .into_iter()
        .zip(moments)
        .zip(counts)
        .map(|(((centroid_row, centroid_col), m), &count)| {
            let area = count as f64;
            let normalized = CentralMoments {
                row_row: m.row_row / area,
                col_col: m.col_col / area,
                row_col: m.row_col / area,
            };
            describe_ellipse(centroid_row, centroid_col, count, normalized)
        })
        .collect()
}

/// Best-fit ellipse descriptors from the region's inertia tensor
fn describe_ellipse(
    centroid_row: f64,
    centroid_col: f64,
    pixel_count: usize,
    moments: CentralMoments,
) -> RegionGeometry {
    // Inertia tensor [[a, b], [b, c]]
    let a = moments.col_col;
    let b = -moments.row_col;
    let c = moments.row_row;

    let (major_eigenvalue, minor_eigenvalue) = inertia_eigenvalues(a, b, c);

    let eccentricity = if major_eigenvalue == 0.0 {
        0.0
    } else {
        (1.0 - minor_eigenvalue / major_eigenvalue).sqrt()
    };

    let orientation = if a - c == 0.0 {
        if b < 0.0 {
            -FRAC_PI_4
        } else {
            FRAC_PI_4
        }
    } else {
        0.5 * (-2.0 * b).atan2(c - a)
    };

    RegionGeometry {
        centroid_x: centroid_col,
        centroid_y: centroid_row,
        pixel_count,
        major_axis_length: 4.0 * major_eigenvalue.sqrt(),
        minor_axis_length: 4.0 * minor_eigenvalue.sqrt(),
        eccentricity,
        orientation,
    }
}

/// Eigenvalues of the symmetric tensor, largest first, clamped at zero
fn inertia_eigenvalues(a: f64, b: f64, c: f64) -> (f64, f64) {
    let tensor = Matrix2::new(a, b, b, c);
    let eigenvalues = tensor.symmetric_eigenvalues();

    let (first, second) = (eigenvalues[0].max(0.0), eigenvalues[1].max(0.0));
    if first >= second {
        (first, second)
    } else {
        (second, first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::FRAC_PI_2;

    fn measure_single(mask: &LabelMask) -> RegionGeometry {
        let index = LabelIndex::from_mask(mask);
        let mut regions = measure_regions(mask, &index);
        assert_eq!(regions.len(), 1);
        regions.remove(0)
    }

    #[test]
    fn square_block_is_a_circle() {
        let mut mask = LabelMask::zeros((5, 5));
        for row in 1..=2 {
            for col in 1..=2 {
                mask[[row, col]] = 1;
            }
        }

        let geometry = measure_single(&mask);
        assert_eq!(geometry.pixel_count, 4);
        assert_approx_eq!(geometry.centroid_x, 1.5);
        assert_approx_eq!(geometry.centroid_y, 1.5);
        assert_eq!(geometry.x(), 2);
        assert_eq!(geometry.y(), 2);
        assert_approx_eq!(geometry.major_axis_length, 2.0);
        assert_approx_eq!(geometry.minor_axis_length, 2.0);
        assert_approx_eq!(geometry.eccentricity, 0.0);
        assert_approx_eq!(geometry.orientation, FRAC_PI_4);
    }

    #[test]
    fn single_pixel_is_degenerate() {
        let mut mask = LabelMask::zeros((3, 3));
        mask[[2, 1]] = 5;

        let geometry = measure_single(&mask);
        assert_eq!(geometry.pixel_count, 1);
        assert_eq!(geometry.x(), 1);
        assert_eq!(geometry.y(), 2);
        assert_eq!(geometry.major_axis_length, 0.0);
        assert_eq!(geometry.minor_axis_length, 0.0);
        assert_eq!(geometry.eccentricity, 0.0);
    }

    #[test]
    fn vertical_line_points_along_rows() {
        let mut mask = LabelMask::zeros((5, 3));
        for row in 1..4 {
            mask[[row, 1]] = 2;
        }

        let geometry = measure_single(&mask);
        assert_approx_eq!(geometry.orientation, 0.0);
        assert_approx_eq!(geometry.eccentricity, 1.0);
        assert_approx_eq!(geometry.major_axis_length, 4.0 * (2.0f64 / 3.0).sqrt());
        assert_approx_eq!(geometry.minor_axis_length, 0.0);
    }

    #[test]
    fn horizontal_line_is_perpendicular_to_rows() {
        let mut mask = LabelMask::zeros((3, 5));
        for col in 0..4 {
            mask[[1, col]] = 9;
        }

        let geometry = measure_single(&mask);
        assert_approx_eq!(geometry.orientation.abs(), FRAC_PI_2);
        assert_approx_eq!(geometry.eccentricity, 1.0);
        assert_approx_eq!(geometry.centroid_x, 1.5);
        // 1.5 rounds to even
        assert_eq!(geometry.x(), 2);
    }

    #[test]
    fn elongated_region_has_ordered_axes() {
        let mut mask = LabelMask::zeros((6, 6));
        for row in 0..2 {
            for col in 0..6 {
                mask[[row, col]] = 1;
            }
        }

        let geometry = measure_single(&mask);
        assert!(geometry.major_axis_length > geometry.minor_axis_length);
        assert!(geometry.eccentricity > 0.0 && geometry.eccentricity < 1.0);
    }

    #[test]
    fn down_right_diagonal_leans_negative() {
        let mut mask = LabelMask::zeros((3, 3));
        for i in 0..3 {
            mask[[i, i]] = 1;
        }

        // mu_rr = mu_cc = mu_rc = 2/3, so a == c and b < 0
        let geometry = measure_single(&mask);
        assert_approx_eq!(geometry.orientation, -FRAC_PI_4);
        assert_approx_eq!(geometry.eccentricity, 1.0);
        assert_approx_eq!(geometry.major_axis_length, 8.0 / 3.0f64.sqrt());
        assert_approx_eq!(geometry.minor_axis_length, 0.0);
    }

    #[test]
    fn anti_diagonal_leans_positive() {
        let mut mask = LabelMask::zeros((3, 3));
        for i in 0..3 {
            mask[[i, 2 - i]] = 4;
        }

        let geometry = measure_single(&mask);
        assert_approx_eq!(geometry.orientation, FRAC_PI_4);
        assert_approx_eq!(geometry.eccentricity, 1.0);
    }

    #[test]
    fn l_shape_uses_the_oblique_formula() {
        // (0,0) (1,0) (2,0) (2,1)
        let mut mask = LabelMask::zeros((3, 2));
        mask[[0, 0]] = 3;
        mask[[1, 0]] = 3;
        mask[[2, 0]] = 3;
        mask[[2, 1]] = 3;

        // centroid (1.25, 0.25); a = 0.1875, b = -0.1875, c = 0.6875
        // eigenvalues 0.75 and 0.125
        let geometry = measure_single(&mask);
        assert_approx_eq!(geometry.centroid_y, 1.25);
        assert_approx_eq!(geometry.centroid_x, 0.25);
        assert_approx_eq!(geometry.major_axis_length, 2.0 * 3.0f64.sqrt());
        assert_approx_eq!(geometry.minor_axis_length, 2.0f64.sqrt());
        assert_approx_eq!(geometry.eccentricity, (5.0f64 / 6.0).sqrt());
        assert_approx_eq!(geometry.orientation, 0.5 * 0.75f64.atan());
        assert_eq!(geometry.x(), 0);
        assert_eq!(geometry.y(), 1);
    }

    #[test]
    fn eigenvalues_are_sorted_descending() {
        let (major, minor) = inertia_eigenvalues(0.25, 0.0, 2.0);
        assert_approx_eq!(major, 2.0);
        assert_approx_eq!(minor, 0.25);
    }
}

// src/feature_extraction.rs - Per-cell feature aggregation over a label mask and a channel stack

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::Array2;
use rayon::prelude::*;

use crate::errors::{Result, SpatialQuantError};
use crate::image_utils::{LabelIndex, LabelMask};
use crate::output::write_cell_expressions_csv;
use crate::shape_analysis::{measure_regions, RegionGeometry};

/// Geometry columns written before the per-channel intensity columns
pub const GEOMETRY_COLUMNS: [&str; 8] = [
    "CELL_IDENTIFIER",
    "MAJOR_AXIS_LENGTH",
    "MINOR_AXIS_LENGTH",
    "X",
    "Y",
    "SIZE",
    "ECCENTRICITY",
    "ORIENTATION",
];

/// One row of the output table
#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    /// Label value of the cell in the mask
    pub identifier: u32,

    /// Mask-derived descriptors, independent of any channel
    pub geometry: RegionGeometry,

    /// Mean intensity per channel, in channel order
    pub intensities: Vec<f64>,
}

/// Aggregated per-cell table, rows sorted by identifier
#[derive(Debug, Clone, PartialEq)]
pub struct CellExpressionTable {
    /// Upper-cased channel names, in channel order
    pub channel_columns: Vec<String>,
    pub records: Vec<CellRecord>,
}

impl CellExpressionTable {
    /// Full header row: geometry columns followed by channel columns
    pub fn header(&self) -> Vec<String> {
        GEOMETRY_COLUMNS
            .iter()
            .map(|column| column.to_string())
            .chain(self.channel_columns.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Check the panel and plane shapes against the mask before doing any work
///
/// Returns the upper-cased column names.
pub fn validate_inputs(
    planes: &[Array2<f64>],
    mask: &LabelMask,
    channel_names: &[String],
) -> Result<Vec<String>> {
    if channel_names.len() < planes.len() {
        return Err(SpatialQuantError::MissingChannelName {
            channels: planes.len(),
            names: channel_names.len(),
        });
    }

    if channel_names.len() > planes.len() {
        return Err(SpatialQuantError::PanelMismatch {
            channels: planes.len(),
            names: channel_names.len(),
        });
    }

    let mask_shape = mask.dim();
    for (channel, plane) in planes.iter().enumerate() {
        if plane.dim() != mask_shape {
            return Err(SpatialQuantError::ShapeMismatch {
                channel,
                channel_shape: plane.dim(),
                mask_shape,
            });
        }
    }

    let columns: Vec<String> = channel_names.iter().map(|name| name.to_uppercase()).collect();

    {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(SpatialQuantError::DuplicateChannelName(column.clone()));
            }
        }
    }

    Ok(columns)
}

/// Mean of one channel's samples over every indexed label, in index order
pub fn mean_intensities(plane: &Array2<f64>, mask: &LabelMask, index: &LabelIndex) -> Vec<f64> {
    let mut sums = vec![0.0f64; index.len()];

    for (&label, &value) in mask.iter().zip(plane.iter()) {
        if let Some(position) = index.position(label) {
            sums[position] += value;
        }
    }

    sums.iter()
        .zip(index.counts())
        .map(|(&sum, &count)| sum / count as f64)
        .collect()
}

/// Build the per-cell table from a channel stack and its segmentation mask
///
/// Geometry is measured once from the mask; intensities once per channel.
/// With `parallel` set, channels are aggregated on the rayon pool; the
/// output is identical either way.
pub fn aggregate_cells(
    planes: &[Array2<f64>],
    mask: &LabelMask,
    channel_names: &[String],
    parallel: bool,
) -> Result<CellExpressionTable> {
    let channel_columns = validate_inputs(planes, mask, channel_names)?;

    let index = LabelIndex::from_mask(mask);
    debug!("Found {} labeled cells in a {:?} mask", index.len(), mask.dim());

    let geometries = measure_regions(mask, &index);

    let per_channel: Vec<Vec<f64>> = if parallel {
        planes
            .par_iter()
            .map(|plane| mean_intensities(plane, mask, &index))
            .collect()
    } else {
        planes
            .iter()
            .map(|plane| mean_intensities(plane, mask, &index))
            .collect()
    };

    let records = index
        .labels()
        .iter()
        .zip(geometries)
        .enumerate()
        .map(|(position, (&identifier, geometry))| CellRecord {
            identifier,
            geometry,
            intensities: per_channel.iter().map(|means| means[position]).collect(),
        })
        .collect();

    Ok(CellExpressionTable {
        channel_columns,
        records,
    })
}

/// Quantify every marker per cell and write `cell_expressions.csv` into `save_dir`
///
/// Nothing is written when the inputs fail validation.
pub fn quantify_expression<P: AsRef<Path>>(
    planes: &[Array2<f64>],
    mask: &LabelMask,
    channel_names: &[String],
    save_dir: P,
    parallel: bool,
) -> Result<PathBuf> {
    let table = aggregate_cells(planes, mask, channel_names, parallel)?;

    if table.is_empty() {
        info!("Segmentation mask has no labeled cells; writing header only");
    } else {
        info!(
            "Quantified {} cells across {} channels",
            table.records.len(),
            table.channel_columns.len()
        );
    }

    write_cell_expressions_csv(&table, save_dir)
}

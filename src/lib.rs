// src/lib.rs - Library interface for spatial_quant_rust

pub mod config;
pub mod errors;
pub mod feature_extraction;
pub mod image_io;
pub mod image_utils;
pub mod output;
pub mod panel;
pub mod pipeline;
pub mod shape_analysis;
pub mod thresholds;

// Re-export commonly used types and functions
pub use errors::{SpatialQuantError, Result};
pub use config::Config;
pub use pipeline::{quantify_sample, condense_channels, CondensedOutput};
pub use image_io::{ChannelStack, PixelDepth, load_channel_stack, load_mask, prepare_input, save_channel_stack};
pub use image_utils::{LabelIndex, LabelMask};

pub use feature_extraction::{
    aggregate_cells,
    quantify_expression,
    CellExpressionTable,
    CellRecord,
    GEOMETRY_COLUMNS,
};

pub use shape_analysis::{measure_regions, RegionGeometry};

pub use output::{write_cell_expressions_csv, CELL_EXPRESSIONS_FILENAME};

pub use panel::{extract_panel, read_panel_file};

pub use thresholds::{
    generate_initial_thresholds,
    generate_quality_control,
    sync_thresholds,
    update_thresholds,
    ClinicalRecord,
    ThresholdRecord,
};

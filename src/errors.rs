use thiserror::Error;
use std::io;
use std::path::PathBuf;

/// Custom error types for spatial quantification
#[derive(Error, Debug)]
pub enum SpatialQuantError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image decoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("NPY read error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("CSV error: {0}")]
    CsvOutput(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel {channel} has shape {channel_shape:?} but the mask has shape {mask_shape:?}")]
    ShapeMismatch {
        channel: usize,
        channel_shape: (usize, usize),
        mask_shape: (usize, usize),
    },

    #[error("Image has {channels} channels but only {names} channel names were supplied")]
    MissingChannelName { channels: usize, names: usize },

    #[error("Image has {channels} channels but {names} channel names were supplied")]
    PanelMismatch { channels: usize, names: usize },

    #[error("Channel name '{0}' appears more than once in the panel")]
    DuplicateChannelName(String),

    #[error("Segmentation mask contains negative label {0}")]
    NegativeLabel(i64),

    #[error("Segmentation mask label {0} does not fit in 32 bits")]
    LabelOutOfRange(String),

    #[error("Unable to extract marker metadata: {0}")]
    PanelMetadata(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid input path: {0}")]
    InvalidPath(PathBuf),

    #[error("Invalid clinical data: {0}")]
    ClinicalData(String),
}

/// Type alias for Result with our custom error type
pub type Result<T> = std::result::Result<T, SpatialQuantError>;

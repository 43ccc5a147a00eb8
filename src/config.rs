use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{Result, SpatialQuantError};

/// Configuration for a quantification run
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// Multi-channel image (QPTIFF, TIFF or plain raster)
    #[serde(default)]
    pub image_path: String,

    /// Segmentation mask (.npy, TIFF or grayscale raster)
    #[serde(default)]
    pub mask_path: String,

    /// Channel list file, used only when image metadata cannot be parsed
    #[serde(default)]
    pub panel_path: Option<String>,

    /// Where cell_expressions.csv goes; defaults to the mask's directory
    #[serde(default)]
    pub output_dir: Option<String>,

    #[serde(default = "default_parallel")]
    pub use_parallel: bool,

    /// Marker names dropped by the condense command
    #[serde(default)]
    pub channels_to_remove: Vec<String>,
}

fn default_parallel() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_path: String::new(),
            mask_path: String::new(),
            panel_path: None,
            output_dir: None,
            use_parallel: default_parallel(),
            channels_to_remove: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, or JSON when the extension is `.json`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SpatialQuantError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            serde_json::from_str(&content).map_err(|e| {
                SpatialQuantError::Config(format!("Failed to parse config file '{}': {}", path.display(), e))
            })
        } else {
            toml::from_str(&content).map_err(|e| {
                SpatialQuantError::Config(format!("Failed to parse config file '{}': {}", path.display(), e))
            })
        }
    }

    /// Directory that receives cell_expressions.csv
    pub fn resolved_output_dir(&self) -> PathBuf {
        match &self.output_dir {
            Some(dir) => PathBuf::from(dir),
            None => Path::new(&self.mask_path)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }
    }

    /// Validate configuration for a quantification run
    ///
    /// Only checks the inputs; nothing is created on disk.
    pub fn validate(&self) -> Result<()> {
        if self.image_path.is_empty() {
            return Err(SpatialQuantError::Config("image_path must be set".to_string()));
        }

        if self.mask_path.is_empty() {
            return Err(SpatialQuantError::Config("mask_path must be set".to_string()));
        }

        let image_path = PathBuf::from(&self.image_path);
        if !image_path.is_file() {
            return Err(SpatialQuantError::InvalidPath(image_path));
        }

        let mask_path = PathBuf::from(&self.mask_path);
        if !mask_path.is_file() {
            return Err(SpatialQuantError::InvalidPath(mask_path));
        }

        if let Some(panel_path) = &self.panel_path {
            let panel_path = PathBuf::from(panel_path);
            if !panel_path.is_file() {
                return Err(SpatialQuantError::InvalidPath(panel_path));
            }
        }

        // The output directory is created by the writer, only once the inputs have been accepted
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            SpatialQuantError::Config(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, content)?;

        Ok(())
    }
}

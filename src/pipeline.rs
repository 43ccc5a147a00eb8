// src/pipeline.rs - Sample-level orchestration: quantification and channel condensing

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::Config;
use crate::errors::{Result, SpatialQuantError};
use crate::feature_extraction::quantify_expression;
use crate::image_io::{load_channel_stack, load_mask, save_channel_stack};
use crate::panel::{extract_panel, read_panel_file, write_panel_file, CONDENSED_PANEL_FILENAME};

/// Quantify one sample described by the configuration
///
/// Returns the path of the written table.
pub fn quantify_sample(config: &Config) -> Result<PathBuf> {
    let image_path = Path::new(&config.image_path);
    let stack = load_channel_stack(image_path)?;
    info!("Processing sample {}", stack.sample_name);

    let panel = extract_panel(image_path, config.panel_path.as_deref())?;
    let mask = load_mask(&config.mask_path)?;

    let output_path = quantify_expression(
        &stack.planes,
        &mask,
        &panel,
        config.resolved_output_dir(),
        config.use_parallel,
    )?;

    info!("Wrote {}", output_path.display());
    Ok(output_path)
}

/// Paths written by [`condense_channels`]
#[derive(Debug, Clone)]
pub struct CondensedOutput {
    pub image_path: PathBuf,
    pub panel_path: PathBuf,
    pub kept_channels: Vec<String>,
}

/// Drop the named channels from an image and its panel file
///
/// The image goes to `<image dir>/condensed_images/<image file>` and the
/// remaining names to `condensed_channel_names.txt` beside the panel file.
pub fn condense_channels<P: AsRef<Path>, Q: AsRef<Path>>(
    image_path: P,
    panel_path: Q,
    channels_to_remove: &[String],
) -> Result<CondensedOutput> {
    let image_path = image_path.as_ref();
    let panel_path = panel_path.as_ref();

    let panel = read_panel_file(panel_path)?;
    let stack = load_channel_stack(image_path)?;

    if panel.len() != stack.channel_count() {
        return Err(SpatialQuantError::PanelMismatch {
            channels: stack.channel_count(),
            names: panel.len(),
        });
    }

    let removal: HashSet<&str> = channels_to_remove.iter().map(String::as_str).collect();
    for name in &removal {
        if !panel.iter().any(|marker| marker.as_str() == *name) {
            warn!("Channel '{}' is not in the panel; nothing removed for it", name);
        }
    }

    let (kept_planes, kept_channels): (Vec<_>, Vec<_>) = stack
        .planes
        .into_iter()
        .zip(panel)
        .filter(|(_, name)| !removal.contains(name.as_str()))
        .unzip();

    let file_name = image_path
        .file_name()
        .ok_or_else(|| SpatialQuantError::InvalidPath(image_path.to_path_buf()))?;
    let image_dir = image_path.parent().unwrap_or_else(|| Path::new(""));
    let condensed_image_path = image_dir.join("condensed_images").join(file_name);
    save_channel_stack(&kept_planes, stack.depth, &condensed_image_path)?;

    let panel_dir = panel_path.parent().unwrap_or_else(|| Path::new(""));
    let condensed_panel_path = panel_dir.join(CONDENSED_PANEL_FILENAME);
    write_panel_file(&kept_channels, &condensed_panel_path)?;

    info!(
        "Condensed {} to {} channels",
        image_path.display(),
        kept_channels.len()
    );

    Ok(CondensedOutput {
        image_path: condensed_image_path,
        panel_path: condensed_panel_path,
        kept_channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_io::PixelDepth;
    use ndarray::{array, Array2};
    use std::fs;

    #[test]
    fn condense_keeps_surviving_channels_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("slide.tif");
        let panel_path = dir.path().join("channel_names.txt");

        let planes: Vec<Array2<f64>> = (0..4)
            .map(|c| Array2::from_elem((2, 2), c as f64 * 10.0))
            .collect();
        save_channel_stack(&planes, PixelDepth::U8, &image_path).unwrap();
        fs::write(&panel_path, "DAPI\nBlank\nCD4\nEmpty\n").unwrap();

        let removed = vec!["Blank".to_string(), "Empty".to_string(), "Absent".to_string()];
        let output = condense_channels(&image_path, &panel_path, &removed).unwrap();

        assert_eq!(output.kept_channels, vec!["DAPI", "CD4"]);
        assert_eq!(
            output.image_path,
            dir.path().join("condensed_images").join("slide.tif")
        );
        assert_eq!(read_panel_file(&output.panel_path).unwrap(), vec!["DAPI", "CD4"]);

        let condensed = load_channel_stack(&output.image_path).unwrap();
        assert_eq!(condensed.depth, PixelDepth::U8);
        assert_eq!(condensed.planes, vec![planes[0].clone(), planes[2].clone()]);
    }

    #[test]
    fn condense_keeps_signed_sample_type() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("signed.tif");
        let panel_path = dir.path().join("channel_names.txt");

        let planes = vec![array![[-5.0f64, 7.0]], array![[1.0f64, -2.0]]];
        save_channel_stack(&planes, PixelDepth::I16, &image_path).unwrap();
        fs::write(&panel_path, "DAPI\nBlank\n").unwrap();

        let output = condense_channels(&image_path, &panel_path, &["Blank".to_string()]).unwrap();

        let condensed = load_channel_stack(&output.image_path).unwrap();
        assert_eq!(condensed.depth, PixelDepth::I16);
        assert_eq!(condensed.planes, vec![planes[0].clone()]);
    }

    #[test]
    fn condense_rejects_panel_of_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("slide.tif");
        let panel_path = dir.path().join("channel_names.txt");

        save_channel_stack(&[array![[1.0f64]]], PixelDepth::U16, &image_path).unwrap();
        fs::write(&panel_path, "A\nB\n").unwrap();

        assert!(matches!(
            condense_channels(&image_path, &panel_path, &[]),
            Err(SpatialQuantError::PanelMismatch { channels: 1, names: 2 })
        ));
    }
}

// src/panel.rs - Marker panel (channel names) from QPTIFF metadata or a channel list file

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use log::{info, warn};
use regex::{Captures, Regex};
use tiff::tags::Tag;

use crate::errors::{Result, SpatialQuantError};
use crate::image_io::is_tiff_path;

/// File name of the condensed panel written next to the original panel file
pub const CONDENSED_PANEL_FILENAME: &str = "condensed_channel_names.txt";

static BIOMARKER_PATTERN: OnceLock<Regex> = OnceLock::new();
static ENTITY_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Compile a pattern on first use and keep it for the rest of the process
fn cached_pattern(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<&'static Regex> {
    if let Some(regex) = cell.get() {
        return Ok(regex);
    }
    let regex = Regex::new(pattern).map_err(|e| SpatialQuantError::PanelMetadata(e.to_string()))?;
    Ok(cell.get_or_init(|| regex))
}

/// Decode the five named XML entities and numeric character references in one pass
fn decode_xml_entities(text: &str) -> Result<String> {
    let pattern = cached_pattern(&ENTITY_PATTERN, r"&(lt|gt|quot|apos|amp|#[0-9]+|#[xX][0-9a-fA-F]+);")?;

    let decoded = pattern.replace_all(text, |captures: &Captures| {
        let entity = &captures[1];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "amp" => Some('&'),
            _ => {
                let code = match entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => entity[1..].parse::<u32>().ok(),
                };
                code.and_then(char::from_u32)
            }
        };
        // Invalid code points are left as written
        decoded.map_or_else(|| captures[0].to_string(), String::from)
    });

    Ok(decoded.into_owned())
}

/// Extract the marker name from one page's `ImageDescription` XML
pub fn parse_biomarker(description: &str) -> Result<String> {
    let pattern = cached_pattern(&BIOMARKER_PATTERN, r"<Biomarker>\s*([^<]*?)\s*</Biomarker>")?;

    let raw = pattern
        .captures(description)
        .and_then(|captures| captures.get(1))
        .map(|name| name.as_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            SpatialQuantError::PanelMetadata("page description has no Biomarker element".to_string())
        })?;

    decode_xml_entities(raw)
}

/// Read the marker of every full-resolution page of a QPTIFF
pub fn extract_panel_from_metadata<P: AsRef<Path>>(image_path: P) -> Result<Vec<String>> {
    let image_path = image_path.as_ref();
    if !is_tiff_path(image_path) {
        return Err(SpatialQuantError::PanelMetadata(format!(
            "{} is not a TIFF container",
            image_path.display()
        )));
    }

    let file = fs::File::open(image_path)?;
    let mut decoder = tiff::decoder::Decoder::new(std::io::BufReader::new(file))?;
    let dimensions = decoder.dimensions()?;

    let mut panel = Vec::new();
    loop {
        let description = decoder
            .get_tag_ascii_string(Tag::ImageDescription)
            .map_err(|e| SpatialQuantError::PanelMetadata(format!("page {}: {}", panel.len(), e)))?;
        panel.push(parse_biomarker(&description)?);

        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
        if decoder.dimensions()? != dimensions {
            break;
        }
    }

    Ok(panel)
}

/// Read a channel list file: one name per line, trailing whitespace trimmed, blank lines skipped
pub fn read_panel_file<P: AsRef<Path>>(panel_path: P) -> Result<Vec<String>> {
    let panel_path = panel_path.as_ref();
    let content = fs::read_to_string(panel_path).map_err(|e| {
        SpatialQuantError::Config(format!(
            "Failed to read panel file '{}': {}",
            panel_path.display(),
            e
        ))
    })?;

    Ok(content
        .lines()
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

/// Write a channel list file, one name per line
pub fn write_panel_file<P: AsRef<Path>>(panel: &[String], panel_path: P) -> Result<()> {
    fs::write(panel_path, panel.join("\n"))?;
    Ok(())
}

/// Resolve the marker panel for an image
///
/// Image metadata is tried first; the channel list file is only consulted
/// when metadata parsing fails.
pub fn extract_panel<P: AsRef<Path>, Q: AsRef<Path>>(
    image_path: P,
    panel_path: Option<Q>,
) -> Result<Vec<String>> {
    match extract_panel_from_metadata(&image_path) {
        Ok(panel) => Ok(panel),
        Err(metadata_error) => {
            warn!("Unable to extract marker metadata: {}", metadata_error);
            match panel_path {
                Some(panel_path) => {
                    info!("Extracting protein panel from {}", panel_path.as_ref().display());
                    read_panel_file(panel_path)
                }
                None => Err(metadata_error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_biomarker_from_description() {
        let description = "<?xml version=\"1.0\"?><PerkinElmer-QPI-ImageDescription>\
            <DescriptionVersion>2</DescriptionVersion><Name>Cy5</Name>\
            <Biomarker> CD8 </Biomarker></PerkinElmer-QPI-ImageDescription>";

        assert_eq!(parse_biomarker(description).unwrap(), "CD8");
    }

    #[test]
    fn decodes_entities_in_biomarker() {
        assert_eq!(
            parse_biomarker("<Biomarker>HLA&amp;DR</Biomarker>").unwrap(),
            "HLA&DR"
        );
    }

    #[test]
    fn decodes_numeric_character_references() {
        assert_eq!(parse_biomarker("<Biomarker>Pan&#45;CK</Biomarker>").unwrap(), "Pan-CK");
        assert_eq!(parse_biomarker("<Biomarker>HLA&#x2D;DR</Biomarker>").unwrap(), "HLA-DR");
        // Decoding is single pass: an escaped ampersand does not start a new entity
        assert_eq!(parse_biomarker("<Biomarker>A&amp;#45;B</Biomarker>").unwrap(), "A&#45;B");
    }

    #[test]
    fn pattern_is_compiled_once() {
        parse_biomarker("<Biomarker>CD3</Biomarker>").unwrap();
        let first = BIOMARKER_PATTERN.get().unwrap() as *const Regex;
        parse_biomarker("<Biomarker>CD4</Biomarker>").unwrap();
        let second = BIOMARKER_PATTERN.get().unwrap() as *const Regex;
        assert_eq!(first, second);
    }

    #[test]
    fn missing_biomarker_is_a_metadata_error() {
        assert!(matches!(
            parse_biomarker("<Name>DAPI</Name>"),
            Err(SpatialQuantError::PanelMetadata(_))
        ));
        assert!(matches!(
            parse_biomarker("<Biomarker></Biomarker>"),
            Err(SpatialQuantError::PanelMetadata(_))
        ));
    }

    #[test]
    fn panel_file_trims_and_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_names.txt");
        fs::write(&path, "DAPI  \nCD3\r\n\nPan-CK\n").unwrap();

        assert_eq!(read_panel_file(&path).unwrap(), vec!["DAPI", "CD3", "Pan-CK"]);
    }

    #[test]
    fn falls_back_to_panel_file_for_plain_rasters() {
        let dir = tempfile::tempdir().unwrap();
        let panel_path = dir.path().join("channel_names.txt");
        fs::write(&panel_path, "A\nB\n").unwrap();

        let panel = extract_panel(dir.path().join("image.png"), Some(&panel_path)).unwrap();
        assert_eq!(panel, vec!["A", "B"]);
    }

    #[test]
    fn metadata_failure_without_panel_file_is_surfaced() {
        let result = extract_panel(Path::new("image.png"), None::<&Path>);
        assert!(matches!(result, Err(SpatialQuantError::PanelMetadata(_))));
    }

    #[test]
    fn panel_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONDENSED_PANEL_FILENAME);
        let panel = vec!["DAPI".to_string(), "CD20".to_string()];

        write_panel_file(&panel, &path).unwrap();

        assert_eq!(read_panel_file(&path).unwrap(), panel);
    }
}

// src/thresholds.rs - Cell-type threshold sheets and the quality-control sheet, keyed by clinical samples

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use csv::{Reader, Writer};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SpatialQuantError};
use crate::panel::read_panel_file;

/// Default ANCHOR threshold for a cell type
pub const DEFAULT_ANCHOR: f64 = 0.7;

/// Default INDEX threshold for a cell type
pub const DEFAULT_INDEX: f64 = 0.5;

/// Suffix shared by every threshold sheet
pub const THRESHOLDS_SUFFIX: &str = "_thresholds.csv";

/// Suffix appended to the quality-control save prefix
pub const QUALITY_CONTROL_SUFFIX: &str = "_quality_control.csv";

/// One sample of the clinical data sheet; other columns are ignored
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClinicalRecord {
    #[serde(rename = "TMA")]
    pub tma: String,

    #[serde(rename = "TMA_PART")]
    pub tma_part: String,

    #[serde(rename = "CORE_IMAGE_ID")]
    pub core_image_id: String,
}

impl ClinicalRecord {
    /// Core number, accepting integral floats such as `3.0`
    pub fn core_number(&self) -> Result<i64> {
        let raw = self.core_image_id.trim();
        if let Ok(number) = raw.parse::<i64>() {
            return Ok(number);
        }

        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() && value.fract() == 0.0 => Ok(value as i64),
            _ => Err(SpatialQuantError::ClinicalData(format!(
                "CORE_IMAGE_ID '{}' of {}_{} is not an integer",
                self.core_image_id, self.tma, self.tma_part
            ))),
        }
    }

    /// `reg007` style core name
    pub fn sample_id(&self) -> Result<String> {
        Ok(format!("reg{:03}", self.core_number()?))
    }

    /// `{TMA}_{TMA_PART}`
    pub fn microarray_id(&self) -> String {
        format!("{}_{}", self.tma, self.tma_part)
    }

    /// `{TMA}_{TMA_PART}_reg{CORE_IMAGE_ID:03}`
    pub fn identifier(&self) -> Result<String> {
        Ok(format!("{}_{}", self.microarray_id(), self.sample_id()?))
    }

    pub fn thresholds_file_name(&self) -> Result<String> {
        Ok(format!("{}{}", self.identifier()?, THRESHOLDS_SUFFIX))
    }
}

/// One row of a threshold sheet
///
/// Empty cells stay empty when a sheet is rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRecord {
    #[serde(rename = "CELL_TYPE")]
    pub cell_type: String,

    #[serde(rename = "ANCHOR")]
    pub anchor: Option<f64>,

    #[serde(rename = "INDEX")]
    pub index: Option<f64>,
}

impl ThresholdRecord {
    pub fn with_defaults(cell_type: &str) -> Self {
        Self {
            cell_type: cell_type.to_string(),
            anchor: Some(DEFAULT_ANCHOR),
            index: Some(DEFAULT_INDEX),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignatureRecord {
    #[serde(rename = "CELL_TYPE")]
    cell_type: String,
}

/// Read the clinical data sheet
pub fn read_clinical_data<P: AsRef<Path>>(path: P) -> Result<Vec<ClinicalRecord>> {
    let mut reader = Reader::from_path(path.as_ref())?;
    let records = reader
        .deserialize()
        .collect::<std::result::Result<Vec<ClinicalRecord>, csv::Error>>()?;

    debug!("Read {} clinical samples from {}", records.len(), path.as_ref().display());
    Ok(records)
}

/// Cell types of a signature matrix, in row order
pub fn read_signature_cell_types<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let mut reader = Reader::from_path(path.as_ref())?;
    let mut cell_types = Vec::new();
    for record in reader.deserialize() {
        let record: SignatureRecord = record?;
        cell_types.push(record.cell_type);
    }

    Ok(cell_types)
}

pub fn read_thresholds<P: AsRef<Path>>(path: P) -> Result<Vec<ThresholdRecord>> {
    let mut reader = Reader::from_path(path.as_ref())?;
    let records = reader
        .deserialize()
        .collect::<std::result::Result<Vec<ThresholdRecord>, csv::Error>>()?;
    Ok(records)
}

/// Write a threshold sheet, replacing any previous file
pub fn write_thresholds<P: AsRef<Path>>(records: &[ThresholdRecord], path: P) -> Result<()> {
    let mut writer = Writer::from_path(path.as_ref())?;
    for record in records {
        writer.serialize(record)?;
    }
    // serialize() only emits the header alongside the first record
    if records.is_empty() {
        writer.write_record(["CELL_TYPE", "ANCHOR", "INDEX"])?;
    }

    writer
        .flush()
        .map_err(|e| SpatialQuantError::CsvOutput(csv::Error::from(e)))?;
    Ok(())
}

fn default_thresholds(cell_types: &[String]) -> Vec<ThresholdRecord> {
    cell_types
        .iter()
        .map(|cell_type| ThresholdRecord::with_defaults(cell_type))
        .collect()
}

/// Reorder a sheet to the signature matrix, keeping values already set
///
/// The first row wins when a cell type appears more than once; cell types
/// absent from the matrix are dropped.
pub fn merge_thresholds(existing: &[ThresholdRecord], cell_types: &[String]) -> Vec<ThresholdRecord> {
    let mut known: HashMap<&str, &ThresholdRecord> = HashMap::new();
    for record in existing {
        known.entry(record.cell_type.as_str()).or_insert(record);
    }

    cell_types
        .iter()
        .map(|cell_type| match known.get(cell_type.as_str()) {
            Some(record) => ThresholdRecord {
                cell_type: cell_type.clone(),
                anchor: record.anchor,
                index: record.index,
            },
            None => ThresholdRecord::with_defaults(cell_type),
        })
        .collect()
}

/// Threshold sheets directly inside a directory, sorted by path
pub fn get_threshold_files_in_dir<P: AsRef<Path>>(dir_path: P) -> Result<Vec<PathBuf>> {
    let dir_path = dir_path.as_ref();
    if !dir_path.is_dir() {
        return Err(SpatialQuantError::InvalidPath(dir_path.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir_path)? {
        let path = entry?.path();
        let is_sheet = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(THRESHOLDS_SUFFIX))
            .unwrap_or(false);
        if path.is_file() && is_sheet {
            files.push(path);
        }
    }
    files.sort();

    Ok(files)
}

/// Write a default threshold sheet for every clinical sample, overwriting existing sheets
pub fn generate_initial_thresholds<P, Q, R>(
    clinical_data_path: P,
    signature_matrix_path: Q,
    save_dir: R,
) -> Result<Vec<PathBuf>>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
{
    let save_dir = save_dir.as_ref();
    let clinical = read_clinical_data(clinical_data_path)?;
    let cell_types = read_signature_cell_types(signature_matrix_path)?;
    fs::create_dir_all(save_dir)?;

    let defaults = default_thresholds(&cell_types);
    let mut written = Vec::with_capacity(clinical.len());
    for sample in &clinical {
        let path = save_dir.join(sample.thresholds_file_name()?);
        write_thresholds(&defaults, &path)?;
        written.push(path);
    }

    info!(
        "Generated {} threshold sheets with {} cell types",
        written.len(),
        cell_types.len()
    );
    Ok(written)
}

/// Bring every existing sheet in `thresholds_dir` in line with the signature matrix
pub fn update_thresholds<P: AsRef<Path>, Q: AsRef<Path>>(
    thresholds_dir: P,
    signature_matrix_path: Q,
) -> Result<Vec<PathBuf>> {
    let cell_types = read_signature_cell_types(signature_matrix_path)?;
    let files = get_threshold_files_in_dir(thresholds_dir)?;

    for path in &files {
        let existing = read_thresholds(path)?;
        write_thresholds(&merge_thresholds(&existing, &cell_types), path)?;
        debug!("Updated {}", path.display());
    }

    info!("Updated {} threshold sheets", files.len());
    Ok(files)
}

/// Update the sheets that exist, then create default sheets for clinical samples without one
pub fn sync_thresholds<P, Q, R>(
    clinical_data_path: P,
    signature_matrix_path: Q,
    save_dir: R,
) -> Result<Vec<PathBuf>>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
{
    let save_dir = save_dir.as_ref();
    let clinical = read_clinical_data(clinical_data_path)?;
    fs::create_dir_all(save_dir)?;

    let mut touched = update_thresholds(save_dir, &signature_matrix_path)?;
    let mut present: HashSet<PathBuf> = touched.iter().cloned().collect();

    let defaults = default_thresholds(&read_signature_cell_types(&signature_matrix_path)?);
    for sample in &clinical {
        let path = save_dir.join(sample.thresholds_file_name()?);
        if !present.insert(path.clone()) {
            continue;
        }
        write_thresholds(&defaults, &path)?;
        info!("Created {}", path.display());
        touched.push(path);
    }

    Ok(touched)
}

/// Group key order: numeric when both sides are integers, lexicographic otherwise
fn compare_key(left: &str, right: &str) -> Ordering {
    match (left.trim().parse::<i64>(), right.trim().parse::<i64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.cmp(right),
    }
}

/// Write `<save_prefix>_quality_control.csv`: one row per sample, grouped by microarray
///
/// Panel columns are left empty for manual review; a blank row separates
/// microarrays.
pub fn generate_quality_control<P, Q, R>(
    clinical_data_path: P,
    panel_path: Q,
    save_prefix: R,
) -> Result<PathBuf>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
{
    let mut clinical = read_clinical_data(clinical_data_path)?;
    let panel = read_panel_file(panel_path)?;

    clinical.retain(|sample| {
        let keyed = !sample.tma.trim().is_empty() && !sample.tma_part.trim().is_empty();
        if !keyed {
            warn!("Skipping clinical row without TMA or TMA_PART: {:?}", sample);
        }
        keyed
    });
    // Stable sort keeps clinical order within a microarray
    clinical.sort_by(|a, b| {
        compare_key(&a.tma, &b.tma).then_with(|| compare_key(&a.tma_part, &b.tma_part))
    });

    let mut output_path = OsString::from(save_prefix.as_ref().as_os_str());
    output_path.push(QUALITY_CONTROL_SUFFIX);
    let output_path = PathBuf::from(output_path);
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let width = 2 + panel.len();
    let mut writer = Writer::from_path(&output_path)?;

    let mut header = vec!["MICROARRAY".to_string(), "SAMPLE".to_string()];
    header.extend(panel.iter().cloned());
    writer.write_record(&header)?;

    let mut previous: Option<String> = None;
    for sample in &clinical {
        let microarray = sample.microarray_id();
        if previous.as_deref().is_some_and(|id| id != microarray) {
            writer.write_record(vec![""; width])?;
        }

        let mut row = vec![microarray.clone(), sample.sample_id()?];
        row.resize(width, String::new());
        writer.write_record(&row)?;

        previous = Some(microarray);
    }

    writer
        .flush()
        .map_err(|e| SpatialQuantError::CsvOutput(csv::Error::from(e)))?;

    info!(
        "Wrote quality-control sheet for {} samples to {}",
        clinical.len(),
        output_path.display()
    );
    Ok(output_path)
}

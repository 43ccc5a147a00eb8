use std::fs;
use std::path::{Path, PathBuf};
use csv::Writer;
use log::debug;

use crate::errors::{Result, SpatialQuantError};
use crate::feature_extraction::CellExpressionTable;

/// File name of the per-cell expression table
pub const CELL_EXPRESSIONS_FILENAME: &str = "cell_expressions.csv";

/// Format a float for the table: shortest round-trip digits, integral values keep ".0", NaN is empty
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

/// Write the per-cell table to `<output_dir>/cell_expressions.csv`, replacing any previous file
pub fn write_cell_expressions_csv<P: AsRef<Path>>(
    table: &CellExpressionTable,
    output_dir: P,
) -> Result<PathBuf> {
    let output_dir = output_dir.as_ref();
    fs::create_dir_all(output_dir)?;

    let output_path = output_dir.join(CELL_EXPRESSIONS_FILENAME);
    let mut writer = Writer::from_path(&output_path)?;

    writer.write_record(table.header())?;

    for record in &table.records {
        let geometry = &record.geometry;
        let mut row = vec![
            record.identifier.to_string(),
            format_float(geometry.major_axis_length),
            format_float(geometry.minor_axis_length),
            geometry.x().to_string(),
            geometry.y().to_string(),
            geometry.size().to_string(),
            format_float(geometry.eccentricity),
            format_float(geometry.orientation),
        ];
        row.extend(record.intensities.iter().map(|&value| format_float(value)));

        writer.write_record(&row)?;
    }

    writer
        .flush()
        .map_err(|e| SpatialQuantError::CsvOutput(csv::Error::from(e)))?;

    debug!("Wrote {} rows to {}", table.records.len(), output_path.display());

    Ok(output_path)
}

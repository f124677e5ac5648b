//! CSV export
//!
//! Header row of column names, then one row per record. Values use the
//! shortest representation that parses back to the same float.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use super::{ExportError, SessionExporter};
use crate::telemetry::{StoredRecord, TelemetryLayout, TelemetryRecord};

/// Write records to a CSV file
pub fn write_csv<P: AsRef<Path>>(
    path: P,
    layout: TelemetryLayout,
    rows: &[StoredRecord],
) -> Result<(), ExportError> {
    // Validate before creating the file so a bad call leaves nothing behind
    if let Some((index, row)) = rows
        .iter()
        .enumerate()
        .find(|(_, row)| row.record.layout() != layout)
    {
        return Err(ExportError::LayoutMismatch {
            index,
            expected: layout,
            found: row.record.layout(),
        });
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "{}", layout.export_header().join(","))?;

    for row in rows {
        let mut first = true;
        for value in row.record.export_row() {
            if !first {
                write!(writer, ",")?;
            }
            write!(writer, "{}", value)?;
            first = false;
        }
        writeln!(writer)?;
    }

    writer.flush()?;
    Ok(())
}

/// Contents of an export read back from disk
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedLog {
    /// Column names
    pub header: Vec<String>,
    /// Values in column order
    pub rows: Vec<Vec<f64>>,
}

impl ExportedLog {
    /// Layout whose export header matches this file, if any
    pub fn layout(&self) -> Option<TelemetryLayout> {
        [TelemetryLayout::Standard, TelemetryLayout::Compact]
            .into_iter()
            .find(|layout| layout.export_header() == self.header)
    }

    /// Rebuild the telemetry records
    pub fn records(&self, layout: TelemetryLayout) -> Result<Vec<TelemetryRecord>, ExportError> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                TelemetryRecord::from_export_row(layout, row).map_err(|e| ExportError::Parse {
                    line: i + 2,
                    message: e.to_string(),
                })
            })
            .collect()
    }
}

/// Read an export produced by [`write_csv`]
pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<ExportedLog, ExportError> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    let header = match lines.next() {
        Some(line) => line?.trim().split(',').map(|s| s.to_string()).collect(),
        None => {
            return Err(ExportError::Parse {
                line: 1,
                message: "missing header".to_string(),
            })
        }
    };

    let mut rows = Vec::new();
    for (i, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = line
            .trim()
            .split(',')
            .map(|token| {
                token.parse::<f64>().map_err(|e| ExportError::Parse {
                    line: i + 2,
                    message: format!("'{}': {}", token, e),
                })
            })
            .collect::<Result<Vec<f64>, ExportError>>()?;
        rows.push(row);
    }

    Ok(ExportedLog { header, rows })
}

/// Pick a name next to `path` that does not exist yet (`name_2.csv`, `name_3.csv`, ...)
fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("DATA")
        .to_string();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("csv")
        .to_string();
    (2..)
        .map(|n| path.with_file_name(format!("{}_{}.{}", stem, n, ext)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

/// Writes each export as a CSV file in one directory
#[derive(Debug, Clone)]
pub struct CsvExporter {
    dir: PathBuf,
}

impl CsvExporter {
    /// Export into `dir`, created on first use
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SessionExporter for CsvExporter {
    fn export(
        &mut self,
        layout: TelemetryLayout,
        rows: &[StoredRecord],
        destination_hint: &str,
    ) -> Result<PathBuf, ExportError> {
        fs::create_dir_all(&self.dir)?;
        let path = unique_path(self.dir.join(destination_hint));
        write_csv(&path, layout, rows)?;
        info!(path = %path.display(), rows = rows.len(), "exported run");
        Ok(path)
    }
}

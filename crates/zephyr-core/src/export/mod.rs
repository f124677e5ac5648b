//! Session export
//!
//! Writes the telemetry of a finished run to disk.

mod csv;

pub use csv::{read_csv, write_csv, CsvExporter, ExportedLog};

use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::telemetry::{StoredRecord, TelemetryLayout};

/// Export failures. The store is never touched, so the export can be retried.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("record {index} uses {found:?} layout, export is {expected:?}")]
    LayoutMismatch {
        index: usize,
        expected: TelemetryLayout,
        found: TelemetryLayout,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Destination of finished runs
pub trait SessionExporter: Send {
    /// Persist `rows` (all in `layout`) and return where they went
    fn export(
        &mut self,
        layout: TelemetryLayout,
        rows: &[StoredRecord],
        destination_hint: &str,
    ) -> Result<PathBuf, ExportError>;
}

/// File name for an export started at `now`: `DATA_<MM>-<DD>_<HH>-<MM>.csv`
pub fn export_file_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    now.format("DATA_%m-%d_%H-%M.csv").to_string()
}

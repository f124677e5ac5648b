//! Telemetry
//!
//! Decoded sensor and controller-state samples streamed by the stand, and the
//! per-session store that keeps them in arrival order.

mod store;

pub use store::{StoredRecord, TelemetryStore};

use serde::{Deserialize, Serialize};

use crate::protocol::FrameError;

/// Number of valve/position and pressure channels
pub const ANALOG_CHANNELS: usize = 6;

const VALVE_OFFSET: usize = 1;
const PRESSURE_OFFSET: usize = 7;
const DELTA_OFFSET: usize = 13;
const SETPOINT_VALVE_OFFSET: usize = 15;

const STANDARD_COLUMNS: [&str; 22] = [
    "Index", "V0", "V1", "V2", "V3", "V4", "V5", "P0", "P1", "P2", "P3", "P4", "P5", "dP0",
    "dP1", "SV0", "SV1", "SP0", "SP1", "OP0", "OP1", "Elapsed",
];

const COMPACT_COLUMNS: [&str; 19] = [
    "Elapsed", "V0", "V1", "V2", "V3", "V4", "V5", "P0", "P1", "P2", "P3", "P4", "P5", "dP0",
    "dP1", "SV0", "SV1", "OP0", "OP1",
];

/// Wire layout of a telemetry line.
///
/// The stand firmware has shipped two layouts. `Standard` carries the sender's
/// sample index and the pressure setpoints; `Compact` is the older 19-field
/// frame whose first field is the elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryLayout {
    /// `Index,V0..V5,P0..P5,dP0,dP1,SV0,SV1,SP0,SP1,OP0,OP1,Elapsed`
    #[default]
    Standard,
    /// `Elapsed,V0..V5,P0..P5,dP0,dP1,SV0,SV1,OP0,OP1`
    Compact,
}

impl TelemetryLayout {
    /// Column names in wire order
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TelemetryLayout::Standard => &STANDARD_COLUMNS,
            TelemetryLayout::Compact => &COMPACT_COLUMNS,
        }
    }

    /// Number of comma-separated fields on the wire
    pub fn field_count(&self) -> usize {
        self.columns().len()
    }

    /// Resolve a layout from a declared field count
    pub fn from_field_count(count: usize) -> Option<Self> {
        [TelemetryLayout::Standard, TelemetryLayout::Compact]
            .into_iter()
            .find(|layout| layout.field_count() == count)
    }

    /// Position of the elapsed-time field
    pub fn elapsed_position(&self) -> usize {
        match self {
            TelemetryLayout::Standard => 21,
            TelemetryLayout::Compact => 0,
        }
    }

    fn sample_index_position(&self) -> Option<usize> {
        match self {
            TelemetryLayout::Standard => Some(0),
            TelemetryLayout::Compact => None,
        }
    }

    fn setpoint_pressure_offset(&self) -> Option<usize> {
        match self {
            TelemetryLayout::Standard => Some(17),
            TelemetryLayout::Compact => None,
        }
    }

    fn output_offset(&self) -> usize {
        match self {
            TelemetryLayout::Standard => 19,
            TelemetryLayout::Compact => 17,
        }
    }

    /// Export header: `Time` followed by every column except the elapsed time
    pub fn export_header(&self) -> Vec<&'static str> {
        let elapsed = self.elapsed_position();
        std::iter::once("Time")
            .chain(
                self.columns()
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != elapsed)
                    .map(|(_, name)| *name),
            )
            .collect()
    }
}

/// One decoded telemetry sample.
///
/// Values are kept in wire order; the accessors map them onto the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    layout: TelemetryLayout,
    values: Vec<f64>,
}

impl TelemetryRecord {
    /// Build a record, rejecting a value count that does not match the layout
    pub fn new(layout: TelemetryLayout, values: Vec<f64>) -> Result<Self, FrameError> {
        if values.len() != layout.field_count() {
            return Err(FrameError::FieldCount {
                expected: layout.field_count(),
                actual: values.len(),
            });
        }
        Ok(Self { layout, values })
    }

    /// Layout this record was decoded with
    pub fn layout(&self) -> TelemetryLayout {
        self.layout
    }

    /// All fields in wire order
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Sender-assigned sample index (standard layout only)
    pub fn sample_index(&self) -> Option<u64> {
        self.layout
            .sample_index_position()
            .map(|i| self.values[i] as u64)
    }

    /// Session-relative device time in milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.values[self.layout.elapsed_position()]
    }

    /// Valve/position channels `V0..V5`
    pub fn valve_position(&self) -> [f64; ANALOG_CHANNELS] {
        self.array(VALVE_OFFSET)
    }

    /// Pressure channels `P0..P5`
    pub fn pressure(&self) -> [f64; ANALOG_CHANNELS] {
        self.array(PRESSURE_OFFSET)
    }

    /// Fuel and oxidizer differential pressure `dP0`, `dP1`
    pub fn delta_pressure(&self) -> [f64; 2] {
        self.array(DELTA_OFFSET)
    }

    /// Valve setpoints `SV0`, `SV1`
    pub fn setpoint_valve(&self) -> [f64; 2] {
        self.array(SETPOINT_VALVE_OFFSET)
    }

    /// Pressure setpoints `SP0`, `SP1` (standard layout only)
    pub fn setpoint_pressure(&self) -> Option<[f64; 2]> {
        self.layout
            .setpoint_pressure_offset()
            .map(|offset| self.array(offset))
    }

    /// PID controller outputs `OP0`, `OP1`
    pub fn output(&self) -> [f64; 2] {
        self.array(self.layout.output_offset())
    }

    /// Values in export column order, with the elapsed time converted to seconds first
    pub fn export_row(&self) -> Vec<f64> {
        let elapsed = self.layout.elapsed_position();
        std::iter::once(self.elapsed_ms() / 1000.0)
            .chain(
                self.values
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != elapsed)
                    .map(|(_, v)| *v),
            )
            .collect()
    }

    /// Rebuild a record from an export row.
    ///
    /// The elapsed time is restored at microsecond resolution, which recovers
    /// the device's millisecond timestamps exactly.
    pub fn from_export_row(layout: TelemetryLayout, row: &[f64]) -> Result<Self, FrameError> {
        if row.len() != layout.field_count() {
            return Err(FrameError::FieldCount {
                expected: layout.field_count(),
                actual: row.len(),
            });
        }
        let elapsed = layout.elapsed_position();
        let mut rest = row[1..].iter().copied();
        let values = (0..layout.field_count())
            .map(|i| {
                if i == elapsed {
                    (row[0] * 1_000_000.0).round() / 1000.0
                } else {
                    rest.next().unwrap_or_default()
                }
            })
            .collect();
        Self::new(layout, values)
    }

    fn array<const N: usize>(&self, offset: usize) -> [f64; N] {
        let mut out = [0.0; N];
        out.copy_from_slice(&self.values[offset..offset + N]);
        out
    }
}

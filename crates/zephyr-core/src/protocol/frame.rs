//! Frame codec
//!
//! Classifies one inbound line as either a telemetry record or a status message.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::FrameError;
use crate::telemetry::{TelemetryLayout, TelemetryRecord};

/// A decoded inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Numeric sample
    Telemetry(TelemetryRecord),
    /// Device state or diagnostic text
    Status(StatusMessage),
}

/// Status line vocabulary of the stand firmware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusMessage {
    /// `IDLE`
    Idle,
    /// `IGNITION`
    Ignition,
    /// `THRUSTING`
    Thrusting,
    /// `COOLING`
    Cooling,
    /// `PID_DONE`
    PidDone,
    /// `EMERGENCY_SHUTDOWN`
    EmergencyShutdown,
    /// `TESTINGCONNECTION complete`
    ConnectionOk,
    /// `State set to <MODE>`
    StateSet(String),
    /// `FIELDS <n>`: the device declares its telemetry field count
    LayoutDeclared(usize),
    /// Anything else, echoed verbatim
    Diagnostic(String),
}

impl StatusMessage {
    /// Classify a trimmed, non-numeric line
    pub fn parse(line: &str) -> Self {
        match line {
            "IDLE" => StatusMessage::Idle,
            "IGNITION" => StatusMessage::Ignition,
            "THRUSTING" => StatusMessage::Thrusting,
            "COOLING" => StatusMessage::Cooling,
            "PID_DONE" => StatusMessage::PidDone,
            "EMERGENCY_SHUTDOWN" => StatusMessage::EmergencyShutdown,
            "TESTINGCONNECTION complete" => StatusMessage::ConnectionOk,
            _ => {
                if let Some(mode) = line.strip_prefix("State set to ") {
                    return StatusMessage::StateSet(mode.trim().to_string());
                }
                if let Some(count) = line
                    .strip_prefix("FIELDS ")
                    .and_then(|n| n.trim().parse::<usize>().ok())
                {
                    return StatusMessage::LayoutDeclared(count);
                }
                StatusMessage::Diagnostic(line.to_string())
            }
        }
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusMessage::Idle => write!(f, "IDLE"),
            StatusMessage::Ignition => write!(f, "IGNITION"),
            StatusMessage::Thrusting => write!(f, "THRUSTING"),
            StatusMessage::Cooling => write!(f, "COOLING"),
            StatusMessage::PidDone => write!(f, "PID_DONE"),
            StatusMessage::EmergencyShutdown => write!(f, "EMERGENCY_SHUTDOWN"),
            StatusMessage::ConnectionOk => write!(f, "TESTINGCONNECTION complete"),
            StatusMessage::StateSet(mode) => write!(f, "State set to {}", mode),
            StatusMessage::LayoutDeclared(count) => write!(f, "FIELDS {}", count),
            StatusMessage::Diagnostic(text) => write!(f, "{}", text),
        }
    }
}

fn parse_number(token: &str) -> Option<f64> {
    token.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Decode one line against the active layout.
///
/// A line whose first comma-separated token is a number must be a complete
/// telemetry record; anything short of that is a [`FrameError`]. Every other
/// line is a status message, commas or not.
pub fn decode(line: &str, layout: TelemetryLayout) -> Result<Frame, FrameError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(FrameError::Empty);
    }

    let first = line.split(',').next().unwrap_or(line);
    if parse_number(first).is_none() {
        return Ok(Frame::Status(StatusMessage::parse(line)));
    }

    let values = line
        .split(',')
        .enumerate()
        .map(|(index, token)| {
            parse_number(token).ok_or_else(|| FrameError::NotNumeric {
                index,
                token: token.trim().to_string(),
            })
        })
        .collect::<Result<Vec<f64>, FrameError>>()?;

    TelemetryRecord::new(layout, values).map(Frame::Telemetry)
}

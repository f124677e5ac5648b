//! Safety interlock
//!
//! Checks every telemetry record against the differential-pressure limits of
//! the fuel and oxidizer feed lines.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::telemetry::TelemetryRecord;
use crate::unit_conversion::PressureUnit;

/// Default fuel-line dP limit
pub const DEFAULT_FUEL_DP_LIMIT: f64 = 17.4;

/// Default oxidizer-line dP limit
pub const DEFAULT_OX_DP_LIMIT: f64 = 101.5;

/// Differential-pressure limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// Maximum |dP0|
    pub fuel_dp_limit: f64,
    /// Maximum |dP1|
    pub ox_dp_limit: f64,
    /// Unit the limits are written in
    pub unit: PressureUnit,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            fuel_dp_limit: DEFAULT_FUEL_DP_LIMIT,
            ox_dp_limit: DEFAULT_OX_DP_LIMIT,
            unit: PressureUnit::Kpa,
        }
    }
}

impl SafetyLimits {
    /// Same limits expressed in `unit`
    pub fn converted_to(&self, unit: PressureUnit) -> Self {
        Self {
            fuel_dp_limit: self.unit.convert(self.fuel_dp_limit, unit),
            ox_dp_limit: self.unit.convert(self.ox_dp_limit, unit),
            unit,
        }
    }
}

/// Feed line a dP channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DpChannel {
    /// `dP0`
    Fuel,
    /// `dP1`
    Oxidizer,
}

impl fmt::Display for DpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpChannel::Fuel => write!(f, "fuel dP0"),
            DpChannel::Oxidizer => write!(f, "oxidizer dP1"),
        }
    }
}

/// Outcome of checking one record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SafetyVerdict {
    Ok,
    Violation {
        channel: DpChannel,
        value: f64,
        limit: f64,
    },
}

/// What the caller must do after observing a record
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SafetyAction {
    /// Within limits
    None,
    /// First violation since the latch was armed: force IDLE now
    Trip(SafetyVerdict),
    /// Still out of limits, IDLE already sent
    Latched(SafetyVerdict),
}

/// Differential-pressure interlock with a trip latch
#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    limits: SafetyLimits,
    tripped: bool,
}

impl SafetyMonitor {
    /// Create a monitor; `limits` must already be in the telemetry unit
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            limits,
            tripped: false,
        }
    }

    /// Active limits
    pub fn limits(&self) -> SafetyLimits {
        self.limits
    }

    /// Check one record. The fuel line is checked first.
    pub fn check(&self, record: &TelemetryRecord) -> SafetyVerdict {
        let [fuel, ox] = record.delta_pressure();
        if fuel.abs() > self.limits.fuel_dp_limit {
            return SafetyVerdict::Violation {
                channel: DpChannel::Fuel,
                value: fuel,
                limit: self.limits.fuel_dp_limit,
            };
        }
        if ox.abs() > self.limits.ox_dp_limit {
            return SafetyVerdict::Violation {
                channel: DpChannel::Oxidizer,
                value: ox,
                limit: self.limits.ox_dp_limit,
            };
        }
        SafetyVerdict::Ok
    }

    /// Check a record and update the trip latch
    pub fn observe(&mut self, record: &TelemetryRecord) -> SafetyAction {
        match self.check(record) {
            SafetyVerdict::Ok => SafetyAction::None,
            verdict if self.tripped => SafetyAction::Latched(verdict),
            verdict => {
                self.tripped = true;
                SafetyAction::Trip(verdict)
            }
        }
    }

    /// Whether the latch is set
    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    /// Re-arm the latch
    pub fn rearm(&mut self) {
        self.tripped = false;
    }
}
